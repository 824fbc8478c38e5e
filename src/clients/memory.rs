use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::{
    clients::broker::{DeliveryStream, MessageBroker},
    error::MessagingError,
    models::{
        delivery::{Headers, InboundMessage, PublishOptions},
        routing::topic_matches,
        topology::{BindingSpec, DEFAULT_EXCHANGE, ExchangeKind, QueueSpec, Topology},
    },
};

/// A message sitting in an in-memory queue.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    seq: u64,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub persistent: bool,
    pub redelivered: bool,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<BindingSpec>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    next_seq: u64,
}

struct Inner {
    state: Mutex<State>,
    connected: AtomicBool,
}

enum Next {
    Message(InboundMessage),
    Wait(Arc<Notify>),
    Closed,
}

/// Single-process broker with the routing semantics the core relies on:
/// default and topic exchanges, per-queue TTL, dead-letter targets,
/// ack/reject/requeue. Backs the test suite; the binary always talks to
/// RabbitMQ.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                connected: AtomicBool::new(true),
            }),
        }
    }

    /// Ready messages of `queue`, head first.
    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn depth(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    /// Every subsequent operation fails with a transport error and open
    /// consumer streams end.
    pub fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        for queue in self.state().queues.values() {
            queue.notify.notify_waiters();
        }
    }

    pub fn reconnect(&self) {
        self.inner.connected.store(true, Ordering::SeqCst);
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_connected(&self) -> Result<(), MessagingError> {
        if self.inner.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MessagingError::Transport("In-memory broker is disconnected".to_string()))
        }
    }

    fn route(
        &self,
        state: &mut State,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
    ) -> Result<usize, MessagingError> {
        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            vec![routing_key.to_string()]
        } else {
            let kind = state.exchanges.get(exchange).copied().ok_or_else(|| {
                MessagingError::Transport(format!("no exchange '{}' in vhost", exchange))
            })?;

            let mut targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange)
                .filter(|b| match kind {
                    ExchangeKind::Topic => topic_matches(&b.pattern, routing_key),
                    ExchangeKind::Direct => b.pattern == routing_key,
                })
                .map(|b| b.queue.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        let mut delivered = 0;
        for queue in targets {
            if state.queues.contains_key(&queue) {
                let mut copy = message.clone();
                copy.routing_key = routing_key.to_string();
                self.enqueue(state, &queue, copy);
                delivered += 1;
            }
        }

        if delivered == 0 {
            debug!(exchange, routing_key, "Message unroutable, dropped");
        }

        Ok(delivered)
    }

    fn enqueue(&self, state: &mut State, queue: &str, mut message: StoredMessage) {
        state.next_seq += 1;
        message.seq = state.next_seq;
        let seq = message.seq;

        let Some(target) = state.queues.get_mut(queue) else {
            return;
        };

        target.ready.push_back(message);
        target.notify.notify_one();

        if let Some(ttl) = target.spec.message_ttl_ms {
            let broker = self.clone();
            let queue = queue.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ttl)).await;
                broker.expire(&queue, seq);
            });
        }
    }

    fn expire(&self, queue: &str, seq: u64) {
        let mut state = self.state();

        let expired = state.queues.get_mut(queue).and_then(|q| {
            let position = q.ready.iter().position(|m| m.seq == seq)?;
            q.ready.remove(position)
        });

        if let Some(message) = expired {
            debug!(queue, "Message TTL expired");
            self.dead_letter(&mut state, queue, message);
        }
    }

    fn dead_letter(&self, state: &mut State, queue: &str, message: StoredMessage) {
        let target = state
            .queues
            .get(queue)
            .and_then(|q| q.spec.dead_letter.clone());

        match target {
            Some(target) => {
                let mut message = message;
                message.redelivered = false;
                if let Err(e) = self.route(state, &target.exchange, &target.routing_key, message) {
                    warn!(queue, error = %e, "Dead-lettering failed, message dropped");
                }
            }
            None => debug!(queue, "No dead-letter target, message dropped"),
        }
    }

    fn next(&self, queue: &str) -> Next {
        if self.ensure_connected().is_err() {
            return Next::Closed;
        }

        let mut guard = self.state();
        let state = &mut *guard;
        state.next_tag += 1;
        let tag = state.next_tag;

        let Some(q) = state.queues.get_mut(queue) else {
            return Next::Closed;
        };

        match q.ready.pop_front() {
            Some(message) => {
                let inbound = InboundMessage {
                    delivery_tag: tag,
                    routing_key: message.routing_key.clone(),
                    body: message.body.clone(),
                    headers: message.headers.clone(),
                    redelivered: message.redelivered,
                };
                state.unacked.insert(
                    tag,
                    Unacked {
                        queue: queue.to_string(),
                        message,
                    },
                );
                Next::Message(inbound)
            }
            None => Next::Wait(Arc::clone(&q.notify)),
        }
    }

    fn take_unacked(&self, state: &mut State, delivery_tag: u64) -> Result<Unacked, MessagingError> {
        state.unacked.remove(&delivery_tag).ok_or_else(|| {
            MessagingError::Transport(format!("unknown delivery tag {}", delivery_tag))
        })
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn declare(&self, topology: &Topology) -> Result<(), MessagingError> {
        self.ensure_connected()?;
        let mut state = self.state();

        for exchange in &topology.exchanges {
            state.exchanges.insert(exchange.name.clone(), exchange.kind);
        }

        for spec in &topology.queues {
            state
                .queues
                .entry(spec.name.clone())
                .or_insert_with(|| QueueState {
                    spec: spec.clone(),
                    ready: VecDeque::new(),
                    notify: Arc::new(Notify::new()),
                });
        }

        for binding in &topology.bindings {
            if !state.bindings.contains(binding) {
                state.bindings.push(binding.clone());
            }
        }

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<(), MessagingError> {
        self.ensure_connected()?;
        let mut state = self.state();

        let message = StoredMessage {
            seq: 0,
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            headers: options.headers,
            persistent: options.persistent,
            redelivered: false,
        };

        self.route(&mut state, exchange, routing_key, message)?;
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, MessagingError> {
        self.ensure_connected()?;

        if !self.state().queues.contains_key(queue) {
            return Err(MessagingError::Transport(format!("no queue '{}' in vhost", queue)));
        }

        let deliveries = stream::unfold(
            (self.clone(), queue.to_string()),
            |(broker, queue)| async move {
                loop {
                    match broker.next(&queue) {
                        Next::Message(message) => return Some((Ok(message), (broker, queue))),
                        Next::Wait(notify) => notify.notified().await,
                        Next::Closed => return None,
                    }
                }
            },
        );

        Ok(Box::pin(deliveries))
    }

    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.ensure_connected()?;
        let mut state = self.state();
        self.take_unacked(&mut state, delivery_tag)?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        self.ensure_connected()?;
        let mut state = self.state();
        let Unacked { queue, mut message } = self.take_unacked(&mut state, delivery_tag)?;

        if requeue {
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_front(message);
                q.notify.notify_one();
            }
        } else {
            self.dead_letter(&mut state, &queue, message);
        }

        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}
