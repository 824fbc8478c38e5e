use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::{Error, Result};
use async_trait::async_trait;
use event_bus::{
    clients::{
        broker::{DeliveryStream, MessageBroker},
        memory::InMemoryBroker,
        publisher::Publisher,
        redis::IdempotencyGuard,
    },
    consumers::{MessageProcessor, notification::RetryPipeline},
    error::MessagingError,
    models::{
        delivery::{
            Disposition, FAILURE_REASON_HEADER, HeaderValue, Headers, PublishOptions,
            RETRY_COUNT_HEADER,
        },
        envelope::{self, Envelope},
        retry::RetryPolicy,
        status::IdempotencyStatus,
        topology::{DEFAULT_EXCHANGE, Topology},
    },
    worker::Worker,
};
use futures_util::StreamExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::common::{
    Behavior, ScriptedHandler, USER_EXCHANGE, declared_broker, email_request, eventually, inbound,
    notification_queues, routing_keys, spawn_worker,
};

fn pipeline(handler: Arc<ScriptedHandler>, max_retries: u32, retry_delay_ms: u64) -> RetryPipeline {
    RetryPipeline::new(
        handler,
        notification_queues(),
        RetryPolicy {
            max_retries,
            retry_delay_ms,
        },
    )
}

fn publisher(broker: &InMemoryBroker) -> Publisher {
    Publisher::new(
        Arc::new(broker.clone()),
        "user-service",
        USER_EXCHANGE,
        routing_keys(),
        notification_queues().main,
    )
}

fn notification_body() -> Result<Vec<u8>> {
    let envelope = Envelope::request("notification.email", email_request(), "user-service");
    Ok(envelope::encode(&envelope)?)
}

/// Test: A successful delivery is acked and leaves every queue empty
#[tokio::test]
async fn test_successful_notification_is_acked() -> Result<()> {
    let broker = declared_broker(50).await;
    let handler = ScriptedHandler::new(Behavior::Succeed);
    let queues = notification_queues();

    spawn_worker(&broker, Arc::new(pipeline(handler.clone(), 3, 50)), &queues.main);

    publisher(&broker).publish_notification(email_request()).await?;

    assert!(eventually(Duration::from_secs(2), || async { handler.calls() == 1 }).await);
    assert!(eventually(Duration::from_secs(1), || async { broker.unacked_count() == 0 }).await);

    assert_eq!(broker.depth(&queues.main), 0);
    assert_eq!(broker.depth(&queues.retry), 0);
    assert_eq!(broker.depth(&queues.dead), 0);

    Ok(())
}

/// Test: An always-failing handler runs 1 + max_retries times, then the
/// message is parked in the dead queue only
#[tokio::test]
async fn test_bounded_retry_ends_in_dead_queue() -> Result<()> {
    let broker = declared_broker(50).await;
    let handler = ScriptedHandler::new(Behavior::Fail);
    let queues = notification_queues();

    spawn_worker(&broker, Arc::new(pipeline(handler.clone(), 3, 50)), &queues.main);

    let body = notification_body()?;
    broker
        .publish(DEFAULT_EXCHANGE, &queues.main, &body, PublishOptions::persistent())
        .await?;

    assert!(
        eventually(Duration::from_secs(5), || async { broker.depth(&queues.dead) == 1 }).await,
        "Message should reach the dead queue"
    );

    // Longer than one more TTL cycle: nothing else may show up.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(handler.calls(), 4, "1 original + 3 retries");
    assert_eq!(broker.depth(&queues.main), 0);
    assert_eq!(broker.depth(&queues.retry), 0);
    assert_eq!(broker.depth(&queues.dead), 1);
    assert_eq!(broker.unacked_count(), 0);

    let parked = &broker.messages(&queues.dead)[0];
    assert_eq!(parked.body, body, "Dead queue must hold the original bytes");
    assert!(parked.persistent);
    assert_eq!(parked.headers.get(RETRY_COUNT_HEADER), Some(&HeaderValue::Int(3)));
    assert!(parked.headers.contains_key(FAILURE_REASON_HEADER));

    // Whoever drains the dead queue sees the last failure and attempt count.
    let mut dead = broker.consume(&queues.dead, "dead-reader").await?;
    let drained = dead.next().await.expect("parked message")?;
    assert_eq!(drained.retry_count(), 3);
    assert!(
        drained
            .failure_reason()
            .is_some_and(|reason| reason.contains("smtp unavailable"))
    );

    Ok(())
}

/// Test: A retried message is not redelivered before the retry TTL elapses
#[tokio::test]
async fn test_retry_waits_for_ttl() -> Result<()> {
    let retry_delay_ms = 300;
    let broker = declared_broker(retry_delay_ms).await;
    let handler = ScriptedHandler::new(Behavior::FailTimes(1));
    let queues = notification_queues();

    spawn_worker(
        &broker,
        Arc::new(pipeline(handler.clone(), 3, retry_delay_ms)),
        &queues.main,
    );

    publisher(&broker).publish_notification(email_request()).await?;

    assert!(eventually(Duration::from_secs(3), || async { handler.calls() == 2 }).await);

    let times = handler.call_times();
    let gap = times[1].duration_since(times[0]);

    assert!(
        gap >= Duration::from_millis(retry_delay_ms),
        "Redelivered after {:?}, before the TTL",
        gap
    );
    assert!(
        gap < Duration::from_millis(retry_delay_ms + 250),
        "Redelivered after {:?}, too long past the TTL",
        gap
    );

    assert!(eventually(Duration::from_secs(1), || async { broker.unacked_count() == 0 }).await);
    assert_eq!(broker.depth(&queues.dead), 0);

    Ok(())
}

/// Test: An undecodable envelope goes to the dead queue with zero handler calls
#[tokio::test]
async fn test_undecodable_message_short_circuits_to_dead() -> Result<()> {
    let broker = declared_broker(50).await;
    let handler = ScriptedHandler::new(Behavior::Succeed);
    let queues = notification_queues();

    spawn_worker(&broker, Arc::new(pipeline(handler.clone(), 3, 50)), &queues.main);

    let body = br#"{"message_id": "not-a-uuid", "payload": 42}"#.to_vec();
    broker
        .publish(DEFAULT_EXCHANGE, &queues.main, &body, PublishOptions::persistent())
        .await?;

    assert!(eventually(Duration::from_secs(2), || async { broker.depth(&queues.dead) == 1 }).await);
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(handler.calls(), 0);
    assert_eq!(broker.depth(&queues.retry), 0);
    assert_eq!(broker.messages(&queues.dead)[0].body, body);

    Ok(())
}

/// Test: A handler panic is treated like an error
#[tokio::test]
async fn test_handler_panic_is_retried() -> Result<()> {
    let handler = ScriptedHandler::new(Behavior::Panic);
    let pipeline = pipeline(handler.clone(), 3, 50);

    let disposition = pipeline
        .process(&inbound("notification.email.main", notification_body()?, Headers::new()))
        .await;

    assert_eq!(
        disposition,
        Disposition::Retry {
            queue: notification_queues().retry,
            retry_count: 1
        }
    );
    assert_eq!(handler.calls(), 1);

    Ok(())
}

/// Test: An attempt that outlives the handler timeout counts as failed
#[tokio::test]
async fn test_handler_timeout_counts_as_failure() -> Result<()> {
    let handler = ScriptedHandler::new(Behavior::Hang(Duration::from_millis(500)));
    let pipeline = pipeline(handler, 3, 50).with_handler_timeout(Duration::from_millis(20));

    let options = PublishOptions::persistent().with_retry_count(1);
    let disposition = pipeline
        .process(&inbound("notification.email.main", notification_body()?, options.headers))
        .await;

    assert_eq!(
        disposition,
        Disposition::Retry {
            queue: notification_queues().retry,
            retry_count: 2
        }
    );

    Ok(())
}

/// Test: A failure on the last allowed attempt parks the message
#[tokio::test]
async fn test_failure_at_budget_parks_message() -> Result<()> {
    let handler = ScriptedHandler::new(Behavior::Fail);
    let pipeline = pipeline(handler, 3, 50);

    let options = PublishOptions::persistent().with_retry_count(3);
    let disposition = pipeline
        .process(&inbound("notification.email.main", notification_body()?, options.headers))
        .await;

    assert!(matches!(
        disposition,
        Disposition::DeadLetter { ref queue, .. } if *queue == notification_queues().dead
    ));

    Ok(())
}

#[derive(Default)]
struct MemoryGuard {
    sent: Mutex<HashSet<Uuid>>,
}

#[async_trait]
impl IdempotencyGuard for MemoryGuard {
    async fn check(&self, message_id: &Uuid) -> Result<IdempotencyStatus, Error> {
        Ok(if self.sent.lock().await.contains(message_id) {
            IdempotencyStatus::Sent
        } else {
            IdempotencyStatus::NotFound
        })
    }

    async fn mark_as_sent(&self, message_id: &Uuid) -> Result<(), Error> {
        self.sent.lock().await.insert(*message_id);
        Ok(())
    }

    async fn mark_as_failed(&self, _message_id: &Uuid) -> Result<(), Error> {
        Ok(())
    }
}

/// Test: With an idempotency guard a redelivered envelope is not handled twice
#[tokio::test]
async fn test_duplicate_delivery_is_skipped_with_guard() -> Result<()> {
    let handler = ScriptedHandler::new(Behavior::Succeed);
    let pipeline =
        pipeline(handler.clone(), 3, 50).with_idempotency_guard(Arc::new(MemoryGuard::default()));

    let message = inbound("notification.email.main", notification_body()?, Headers::new());

    assert_eq!(pipeline.process(&message).await, Disposition::Ack);
    assert_eq!(pipeline.process(&message).await, Disposition::Ack);

    assert_eq!(handler.calls(), 1);

    Ok(())
}

/// Test: Without a guard every delivery reaches the handler
#[tokio::test]
async fn test_duplicate_delivery_is_handled_without_guard() -> Result<()> {
    let handler = ScriptedHandler::new(Behavior::Succeed);
    let pipeline = pipeline(handler.clone(), 3, 50);

    let message = inbound("notification.email.main", notification_body()?, Headers::new());
    pipeline.process(&message).await;
    pipeline.process(&message).await;

    assert_eq!(handler.calls(), 2);

    Ok(())
}

/// Drops the first `failures` publishes addressed to `queue`.
struct FlakyQueueBroker {
    inner: InMemoryBroker,
    queue: String,
    failures: AtomicU32,
}

#[async_trait]
impl MessageBroker for FlakyQueueBroker {
    async fn declare(&self, topology: &Topology) -> Result<(), MessagingError> {
        self.inner.declare(topology).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<(), MessagingError> {
        let refused = routing_key == self.queue
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if refused {
            return Err(MessagingError::Transport("channel closed".to_string()));
        }
        self.inner.publish(exchange, routing_key, body, options).await
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, MessagingError> {
        self.inner.consume(queue, consumer_tag).await
    }

    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.inner.acknowledge(delivery_tag).await
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        self.inner.reject(delivery_tag, requeue).await
    }

    async fn is_connected(&self) -> bool {
        self.inner.is_connected().await
    }
}

/// Test: When the retry copy cannot be published the original still takes
/// the delayed path, and that attempt is not charged against the budget
#[tokio::test]
async fn test_failed_retry_forward_falls_back_to_dead_letter_route() -> Result<()> {
    let broker = declared_broker(50).await;
    let queues = notification_queues();
    let flaky = Arc::new(FlakyQueueBroker {
        inner: broker.clone(),
        queue: queues.retry.clone(),
        failures: AtomicU32::new(1),
    });

    // One retry allowed, two failures: only the uncharged attempt makes room
    // for the third call.
    let handler = ScriptedHandler::new(Behavior::FailTimes(2));
    let worker = Worker::new(
        flaky,
        Arc::new(pipeline(handler.clone(), 1, 50)),
        queues.main.clone(),
        "flaky-test",
        Duration::from_millis(10),
    );
    tokio::spawn(async move { worker.run().await });

    broker
        .publish(DEFAULT_EXCHANGE, &queues.main, &notification_body()?, PublishOptions::persistent())
        .await?;

    assert!(eventually(Duration::from_secs(3), || async { handler.calls() == 3 }).await);
    assert!(eventually(Duration::from_secs(1), || async { broker.unacked_count() == 0 }).await);

    assert_eq!(broker.depth(&queues.main), 0);
    assert_eq!(broker.depth(&queues.retry), 0);
    assert_eq!(broker.depth(&queues.dead), 0);

    Ok(())
}
