use std::{
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use event_bus::{
    clients::{broker::MessageBroker, email::NotificationHandler, memory::InMemoryBroker},
    consumers::MessageProcessor,
    error::MessagingError,
    models::{
        delivery::{Headers, InboundMessage},
        email::EmailRequest,
        routing::RoutingKeys,
        topology::{NotificationQueues, Topology},
    },
    worker::Worker,
};
use serde_json::{Map, json};
use tokio::{task::JoinHandle, time::Instant};

pub const USER_EXCHANGE: &str = "user-events";
pub const REPLICA_QUEUE: &str = "content-service.user-replica";

pub fn notification_queues() -> NotificationQueues {
    NotificationQueues {
        main: "notification.email.main".to_string(),
        retry: "notification.email.retry".to_string(),
        dead: "notification.email.dead".to_string(),
    }
}

pub fn test_topology(retry_delay_ms: u64) -> Topology {
    Topology::new()
        .with_event_subscription(USER_EXCHANGE, REPLICA_QUEUE, "user.*")
        .with_retry_channel(&notification_queues(), retry_delay_ms)
}

pub async fn declared_broker(retry_delay_ms: u64) -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    broker
        .declare(&test_topology(retry_delay_ms))
        .await
        .expect("declare test topology");
    broker
}

pub fn routing_keys() -> RoutingKeys {
    RoutingKeys::default()
}

pub fn email_request() -> EmailRequest {
    let data = json!({ "username": "ada" });

    EmailRequest {
        template_id: "welcome".to_string(),
        to: "ada@example.com".to_string(),
        from: "noreply@example.com".to_string(),
        data: data.as_object().cloned().unwrap_or_else(Map::new),
    }
}

pub fn inbound(routing_key: &str, body: Vec<u8>, headers: Headers) -> InboundMessage {
    InboundMessage {
        delivery_tag: 1,
        routing_key: routing_key.to_string(),
        body,
        headers,
        redelivered: false,
    }
}

pub fn spawn_worker(
    broker: &InMemoryBroker,
    processor: Arc<dyn MessageProcessor>,
    queue: &str,
) -> JoinHandle<Result<(), MessagingError>> {
    let worker = Worker::new(
        Arc::new(broker.clone()),
        processor,
        queue,
        format!("{}-test", queue),
        Duration::from_millis(10),
    );

    tokio::spawn(async move { worker.run().await })
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    condition().await
}

/// What a scripted handler does on each call.
#[derive(Clone, Copy)]
pub enum Behavior {
    Succeed,
    Fail,
    /// Fail this many times, then succeed.
    FailTimes(u32),
    Panic,
    Hang(Duration),
}

pub struct ScriptedHandler {
    behavior: Behavior,
    calls: AtomicU32,
    call_times: Mutex<Vec<Instant>>,
}

impl ScriptedHandler {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicU32::new(0),
            call_times: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationHandler for ScriptedHandler {
    async fn handle(&self, _request: &EmailRequest) -> Result<(), MessagingError> {
        let previous = self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());

        match self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail => Err(MessagingError::Handler("smtp unavailable".to_string())),
            Behavior::FailTimes(n) if previous < n => {
                Err(MessagingError::Handler("smtp unavailable".to_string()))
            }
            Behavior::FailTimes(_) => Ok(()),
            Behavior::Panic => panic!("handler blew up"),
            Behavior::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }
}
