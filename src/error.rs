use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Failures of the messaging core.
///
/// Only `Transport` is ever returned to a publishing caller. Everything else
/// is resolved inside a consumer into a settlement decision.
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Broker transport error: {0}")]
    Transport(String),

    #[error("Failed to decode envelope: {0}")]
    Decode(String),

    #[error("Failed to encode envelope: {0}")]
    Encode(String),

    #[error("Invalid routing key: '{0}'")]
    InvalidRoutingKey(String),

    #[error("Unrecognized routing key: '{0}'")]
    UnknownRoutingKey(String),

    #[error("Replica store error: {0}")]
    Store(String),

    #[error("Replica write conflicts with existing data: {0}")]
    Conflict(String),

    #[error("Notification handler failed: {0}")]
    Handler(String),
}

impl MessagingError {
    /// Whether another attempt could succeed for the same message.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            MessagingError::Transport(_) | MessagingError::Store(_) | MessagingError::Handler(_)
        )
    }
}

impl From<lapin::Error> for MessagingError {
    fn from(e: lapin::Error) -> Self {
        MessagingError::Transport(e.to_string())
    }
}

impl From<tokio_postgres::Error> for MessagingError {
    fn from(e: tokio_postgres::Error) -> Self {
        if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
            MessagingError::Conflict(e.to_string())
        } else {
            MessagingError::Store(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, MessagingError>;
