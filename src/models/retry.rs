/// In-process backoff for synchronous calls (template fetches).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: u64,
}

/// Broker-driven retry budget of a notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// TTL of the retry queue.
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Cycle once more through the retry queue carrying this count.
    Retry { next_count: u32 },
    /// Budget exhausted.
    Park,
}

impl RetryPolicy {
    pub fn after_failure(&self, retry_count: u32) -> RetryDecision {
        if retry_count >= self.max_retries {
            RetryDecision::Park
        } else {
            RetryDecision::Retry {
                next_count: retry_count + 1,
            }
        }
    }
}
