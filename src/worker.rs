use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use tokio::{task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    clients::broker::MessageBroker,
    consumers::MessageProcessor,
    error::MessagingError,
    models::{
        delivery::{Disposition, HeaderValue, InboundMessage, PublishOptions, RETRY_COUNT_HEADER},
        topology::DEFAULT_EXCHANGE,
    },
};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// One consumer on one queue, processing a single delivery at a time.
pub struct Worker {
    broker: Arc<dyn MessageBroker>,
    processor: Arc<dyn MessageProcessor>,
    queue: String,
    consumer_tag: String,
    requeue_delay: Duration,
}

impl Worker {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        processor: Arc<dyn MessageProcessor>,
        queue: impl Into<String>,
        consumer_tag: impl Into<String>,
        requeue_delay: Duration,
    ) -> Self {
        Self {
            broker,
            processor,
            queue: queue.into(),
            consumer_tag: consumer_tag.into(),
            requeue_delay,
        }
    }

    /// Consume until the delivery stream closes.
    pub async fn run(&self) -> Result<(), MessagingError> {
        let mut deliveries = self.broker.consume(&self.queue, &self.consumer_tag).await?;

        info!(queue = %self.queue, consumer_tag = %self.consumer_tag, "Worker started");

        while let Some(delivery) = deliveries.next().await {
            let message = match delivery {
                Ok(message) => message,
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "Failed to receive delivery");
                    continue;
                }
            };

            let disposition = self.processor.process(&message).await;

            if let Err(e) = self.settle(&message, disposition).await {
                error!(
                    queue = %self.queue,
                    delivery_tag = message.delivery_tag,
                    error = %e,
                    "Failed to settle delivery"
                );
            }
        }

        warn!(queue = %self.queue, consumer_tag = %self.consumer_tag, "Delivery stream closed");

        Ok(())
    }

    /// Keep a consumer subscribed for the lifetime of the process.
    pub async fn run_forever(self) {
        loop {
            if let Err(e) = self.run().await {
                error!(queue = %self.queue, error = %e, "Worker failed to subscribe");
            }

            sleep(RESUBSCRIBE_DELAY).await;
        }
    }

    async fn settle(
        &self,
        message: &InboundMessage,
        disposition: Disposition,
    ) -> Result<(), MessagingError> {
        let tag = message.delivery_tag;

        match disposition {
            Disposition::Ack => self.broker.acknowledge(tag).await,
            Disposition::Reject => self.broker.reject(tag, false).await,
            Disposition::Requeue => {
                sleep(self.requeue_delay).await;
                self.broker.reject(tag, true).await
            }
            Disposition::Retry { queue, retry_count } => {
                let options = PublishOptions::persistent().with_retry_count(retry_count);
                self.forward(message, &queue, options).await
            }
            Disposition::DeadLetter { queue, reason } => {
                let options = PublishOptions::persistent()
                    .with_retry_count(message.retry_count())
                    .with_failure_reason(reason);
                self.forward(message, &queue, options).await
            }
        }
    }

    // The copy must be handed to the broker before the original is acked.
    async fn forward(
        &self,
        message: &InboundMessage,
        queue: &str,
        options: PublishOptions,
    ) -> Result<(), MessagingError> {
        let forwarded_retry_count = match options.headers.get(RETRY_COUNT_HEADER) {
            Some(HeaderValue::Int(n)) => Some(*n),
            _ => None,
        };

        match self
            .broker
            .publish(DEFAULT_EXCHANGE, queue, &message.body, options)
            .await
        {
            Ok(()) => {
                debug!(delivery_tag = message.delivery_tag, target = %queue, "Delivery forwarded");
                self.broker.acknowledge(message.delivery_tag).await
            }
            // The rejected original still reaches the retry queue through the
            // main queue's dead-letter route, but with its old retry count: that
            // attempt is not charged against the budget.
            Err(e) => {
                warn!(
                    delivery_tag = message.delivery_tag,
                    target = %queue,
                    retry_count = message.retry_count(),
                    unwritten_retry_count = ?forwarded_retry_count,
                    error = %e,
                    "Forward failed, rejecting to dead-letter route"
                );
                self.broker.reject(message.delivery_tag, false).await
            }
        }
    }
}

/// Spawn `concurrency` workers on `queue`, each with its own consumer tag.
pub fn spawn_workers(
    broker: Arc<dyn MessageBroker>,
    processor: Arc<dyn MessageProcessor>,
    queue: &str,
    concurrency: usize,
    requeue_delay: Duration,
) -> Vec<JoinHandle<()>> {
    (0..concurrency)
        .map(|i| {
            let worker = Worker::new(
                broker.clone(),
                processor.clone(),
                queue,
                format!("{}-worker-{}", queue, i),
                requeue_delay,
            );
            tokio::spawn(worker.run_forever())
        })
        .collect()
}
