/// The default (nameless) direct exchange every queue is bound to by name.
pub const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

/// Where the broker moves a message that is rejected or expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTarget {
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub dead_letter: Option<DeadLetterTarget>,
    pub message_ttl_ms: Option<u64>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter: None,
            message_ttl_ms: None,
        }
    }

    /// Dead-letter through the default exchange straight into `queue`.
    pub fn dead_letter_to(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter = Some(DeadLetterTarget {
            exchange: DEFAULT_EXCHANGE.to_string(),
            routing_key: queue.into(),
        });
        self
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.message_ttl_ms = Some(ttl_ms);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub pattern: String,
}

/// Queue names of one retry-capable notification channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationQueues {
    pub main: String,
    pub retry: String,
    pub dead: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Durable topic exchange with one durable queue bound by `pattern`.
    pub fn with_event_subscription(
        mut self,
        exchange: impl Into<String>,
        queue: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        let exchange = exchange.into();
        let queue = queue.into();

        if !self.exchanges.iter().any(|e| e.name == exchange) {
            self.exchanges.push(ExchangeSpec {
                name: exchange.clone(),
                kind: ExchangeKind::Topic,
                durable: true,
            });
        }

        self.queues.push(QueueSpec::durable(queue.clone()));
        self.bindings.push(BindingSpec {
            queue,
            exchange,
            pattern: pattern.into(),
        });
        self
    }

    /// `main` rejects into `retry`; `retry` expires back into `main` after
    /// `retry_delay_ms`; `dead` is only ever written by the pipeline.
    pub fn with_retry_channel(mut self, queues: &NotificationQueues, retry_delay_ms: u64) -> Self {
        self.queues
            .push(QueueSpec::durable(queues.main.clone()).dead_letter_to(queues.retry.clone()));
        self.queues.push(
            QueueSpec::durable(queues.retry.clone())
                .dead_letter_to(queues.main.clone())
                .with_ttl(retry_delay_ms),
        );
        self.queues.push(QueueSpec::durable(queues.dead.clone()));
        self
    }

    pub fn queue(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.iter().find(|q| q.name == name)
    }
}
