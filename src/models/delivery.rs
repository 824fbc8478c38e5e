use std::collections::BTreeMap;

pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
pub const FAILURE_REASON_HEADER: &str = "x-failure-reason";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Int(i64),
    Text(String),
}

pub type Headers = BTreeMap<String, HeaderValue>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Survive a broker restart (AMQP delivery mode 2).
    pub persistent: bool,
    pub headers: Headers,
}

impl PublishOptions {
    pub fn persistent() -> Self {
        Self {
            persistent: true,
            headers: Headers::new(),
        }
    }

    pub fn transient() -> Self {
        Self::default()
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.headers
            .insert(RETRY_COUNT_HEADER.to_string(), HeaderValue::Int(retry_count as i64));
        self
    }

    pub fn with_failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.headers
            .insert(FAILURE_REASON_HEADER.to_string(), HeaderValue::Text(reason.into()));
        self
    }
}

/// A message handed to a consumer by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub redelivered: bool,
}

impl InboundMessage {
    /// Attempts already made; 0 when the header is absent or unreadable.
    pub fn retry_count(&self) -> u32 {
        match self.headers.get(RETRY_COUNT_HEADER) {
            Some(HeaderValue::Int(n)) => u32::try_from(*n).unwrap_or(0),
            Some(HeaderValue::Text(s)) => s.trim().parse().unwrap_or(0),
            None => 0,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self.headers.get(FAILURE_REASON_HEADER) {
            Some(HeaderValue::Text(s)) => Some(s),
            _ => None,
        }
    }
}

/// How a consumed message is settled with the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Reject without requeue. Dead-letters if the queue has a target.
    Reject,
    /// Reject with requeue.
    Requeue,
    /// Publish a copy with `retry_count` into `queue`, then ack.
    Retry { queue: String, retry_count: u32 },
    /// Publish the original body verbatim into `queue`, then ack.
    DeadLetter { queue: String, reason: String },
}
