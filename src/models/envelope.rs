use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::error::MessagingError;

/// Wrapper carried by every message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(alias = "messageId")]
    pub message_id: Uuid,
    pub name: String,
    #[serde(alias = "type")]
    pub kind: MessageKind,
    #[serde(alias = "data")]
    pub payload: T,
    #[serde(alias = "metaData")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(alias = "service")]
    pub origin_service: String,
    #[serde(alias = "timestamp", deserialize_with = "deserialize_timestamp")]
    pub emitted_at: DateTime<Utc>,
}

/// Informational discriminator. Unknown values are kept as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    Event,
    Request,
    Other(String),
}

impl From<String> for MessageKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "event" => MessageKind::Event,
            "request" => MessageKind::Request,
            _ => MessageKind::Other(s),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Event => "event".to_string(),
            MessageKind::Request => "request".to_string(),
            MessageKind::Other(s) => s,
        }
    }
}

impl<T> Envelope<T> {
    pub fn new(
        name: impl Into<String>,
        kind: MessageKind,
        payload: T,
        origin_service: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            name: name.into(),
            kind,
            payload,
            metadata: Metadata {
                origin_service: origin_service.into(),
                emitted_at: Utc::now(),
            },
        }
    }

    pub fn event(name: impl Into<String>, payload: T, origin_service: impl Into<String>) -> Self {
        Self::new(name, MessageKind::Event, payload, origin_service)
    }

    pub fn request(name: impl Into<String>, payload: T, origin_service: impl Into<String>) -> Self {
        Self::new(name, MessageKind::Request, payload, origin_service)
    }
}

pub fn encode<T: Serialize>(envelope: &Envelope<T>) -> Result<Vec<u8>, MessagingError> {
    serde_json::to_vec(envelope).map_err(|e| MessagingError::Encode(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<Envelope<T>, MessagingError> {
    serde_json::from_slice(bytes).map_err(|e| MessagingError::Decode(e.to_string()))
}

// Java producers serialize timestamps as epoch milliseconds.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Millis(ms) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {}", ms))),
        Raw::Text(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom),
    }
}
