use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clients::{email::NotificationHandler, redis::IdempotencyGuard},
    consumers::MessageProcessor,
    error::MessagingError,
    models::{
        delivery::{Disposition, InboundMessage},
        email::EmailRequest,
        envelope::{self, Envelope},
        retry::{RetryDecision, RetryPolicy},
        status::IdempotencyStatus,
        topology::NotificationQueues,
    },
};

/// Drives a notification handler through the main/retry/dead channel.
pub struct RetryPipeline {
    handler: Arc<dyn NotificationHandler>,
    queues: NotificationQueues,
    policy: RetryPolicy,
    handler_timeout: Option<Duration>,
    guard: Option<Arc<dyn IdempotencyGuard>>,
}

impl RetryPipeline {
    pub fn new(
        handler: Arc<dyn NotificationHandler>,
        queues: NotificationQueues,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            handler,
            queues,
            policy,
            handler_timeout: None,
            guard: None,
        }
    }

    /// Count an attempt that runs longer than `timeout` as failed.
    /// A zero duration disables the limit.
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_idempotency_guard(mut self, guard: Arc<dyn IdempotencyGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    async fn invoke(&self, request: &EmailRequest) -> Result<(), MessagingError> {
        let attempt = AssertUnwindSafe(self.handler.handle(request)).catch_unwind();

        let outcome = match self.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, attempt).await.map_err(|_| {
                MessagingError::Handler(format!("handler timed out after {}ms", limit.as_millis()))
            })?,
            None => attempt.await,
        };

        outcome.unwrap_or_else(|_| Err(MessagingError::Handler("handler panicked".to_string())))
    }

    async fn already_delivered(&self, message_id: &Uuid) -> bool {
        let Some(guard) = &self.guard else {
            return false;
        };

        match guard.check(message_id).await {
            Ok(IdempotencyStatus::Sent) => true,
            Ok(_) => false,
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Idempotency check failed, delivering anyway");
                false
            }
        }
    }

    async fn record(&self, message_id: &Uuid, delivered: bool) {
        let Some(guard) = &self.guard else {
            return;
        };

        let result = if delivered {
            guard.mark_as_sent(message_id).await
        } else {
            guard.mark_as_failed(message_id).await
        };

        if let Err(e) = result {
            warn!(message_id = %message_id, error = %e, "Failed to record delivery status");
        }
    }

    fn dead_letter(&self, reason: impl Into<String>) -> Disposition {
        Disposition::DeadLetter {
            queue: self.queues.dead.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl MessageProcessor for RetryPipeline {
    async fn process(&self, message: &InboundMessage) -> Disposition {
        let retry_count = message.retry_count();

        let envelope: Envelope<EmailRequest> = match envelope::decode(&message.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    delivery_tag = message.delivery_tag,
                    retry_count,
                    error = %e,
                    "Undecodable notification, parking in dead queue"
                );
                return self.dead_letter(e.to_string());
            }
        };

        let message_id = envelope.message_id;

        if self.already_delivered(&message_id).await {
            info!(message_id = %message_id, "Notification already delivered, skipping");
            return Disposition::Ack;
        }

        debug!(
            message_id = %message_id,
            template_id = %envelope.payload.template_id,
            retry_count,
            "Invoking notification handler"
        );

        match self.invoke(&envelope.payload).await {
            Ok(()) => {
                self.record(&message_id, true).await;
                info!(message_id = %message_id, retry_count, "Notification handled");
                Disposition::Ack
            }
            Err(e) => {
                self.record(&message_id, false).await;

                match self.policy.after_failure(retry_count) {
                    RetryDecision::Retry { next_count } => {
                        warn!(
                            message_id = %message_id,
                            retry_count,
                            next_count,
                            delay_ms = self.policy.retry_delay_ms,
                            error = %e,
                            "Notification failed, scheduling retry"
                        );
                        Disposition::Retry {
                            queue: self.queues.retry.clone(),
                            retry_count: next_count,
                        }
                    }
                    RetryDecision::Park => {
                        error!(
                            message_id = %message_id,
                            retry_count,
                            error = %e,
                            "Retries exhausted, parking in dead queue"
                        );
                        self.dead_letter(e.to_string())
                    }
                }
            }
        }
    }
}
