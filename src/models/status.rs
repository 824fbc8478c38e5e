use std::fmt::{Display, Formatter, Result};

/// Delivery state of a notification, keyed by envelope `message_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyStatus {
    NotFound,
    Sent,
    Failed,
}

impl IdempotencyStatus {
    pub fn from_stored(value: Option<&str>) -> Self {
        match value {
            Some("sent") => IdempotencyStatus::Sent,
            Some("failed") => IdempotencyStatus::Failed,
            _ => IdempotencyStatus::NotFound,
        }
    }
}

impl Display for IdempotencyStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            IdempotencyStatus::NotFound => write!(f, "not_found"),
            IdempotencyStatus::Sent => write!(f, "sent"),
            IdempotencyStatus::Failed => write!(f, "failed"),
        }
    }
}
