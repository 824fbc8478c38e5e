use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::models::{
    retry::{RetryConfig, RetryPolicy},
    routing::RoutingKeys,
    topology::{NotificationQueues, Topology},
};

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub rabbitmq_url: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default = "default_user_events_exchange")]
    pub user_events_exchange: String,
    #[serde(default = "default_user_replica_queue")]
    pub user_replica_queue: String,
    #[serde(default = "default_user_routing_pattern")]
    pub user_routing_pattern: String,
    #[serde(default = "default_user_created_key")]
    pub user_created_key: String,
    #[serde(default = "default_user_updated_key")]
    pub user_updated_key: String,
    #[serde(default = "default_user_deleted_key")]
    pub user_deleted_key: String,

    #[serde(default = "default_email_main_queue")]
    pub email_main_queue: String,
    #[serde(default = "default_email_retry_queue")]
    pub email_retry_queue: String,
    #[serde(default = "default_email_dead_queue")]
    pub email_dead_queue: String,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// 0 disables the per-attempt timeout.
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
    #[serde(default = "default_requeue_delay_ms")]
    pub requeue_delay_ms: u64,

    /// Absent: replica rows are kept in memory.
    pub database_url: Option<String>,

    /// Absent: notification deliveries are not deduplicated.
    pub redis_url: Option<String>,
    #[serde(default = "default_idempotency_ttl_seconds")]
    pub idempotency_ttl_seconds: u64,
    #[serde(default = "default_redis_write_attempts")]
    pub redis_write_attempts: u32,
    #[serde(default = "default_redis_initial_delay_ms")]
    pub redis_initial_delay_ms: u64,
    #[serde(default = "default_redis_max_delay_ms")]
    pub redis_max_delay_ms: u64,

    #[serde(default = "default_template_service_url")]
    pub template_service_url: String,
    #[serde(default = "default_template_fetch_attempts")]
    pub template_fetch_attempts: u32,
    #[serde(default = "default_template_initial_delay_ms")]
    pub template_initial_delay_ms: u64,
    #[serde(default = "default_template_max_delay_ms")]
    pub template_max_delay_ms: u64,
    #[serde(default = "default_template_backoff_multiplier")]
    pub template_backoff_multiplier: u64,

    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    #[serde(default)]
    pub smtp_tls: bool,

    #[serde(default = "default_true")]
    pub run_replica_consumer: bool,
    #[serde(default = "default_true")]
    pub run_notification_consumer: bool,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.worker_concurrency == 0 {
            return Err(anyhow!("WORKER_CONCURRENCY must be at least 1"));
        }

        if !self.routing_keys().covered_by(&self.user_routing_pattern) {
            return Err(anyhow!(
                "USER_ROUTING_PATTERN '{}' does not cover every user routing key",
                self.user_routing_pattern
            ));
        }

        let queues = self.notification_queues();
        if queues.main == queues.retry || queues.main == queues.dead || queues.retry == queues.dead {
            return Err(anyhow!("Email main, retry and dead queues must be distinct"));
        }

        if i32::try_from(self.retry_delay_ms).is_err() {
            return Err(anyhow!("RETRY_DELAY_MS is too large for a queue TTL"));
        }

        Ok(())
    }

    pub fn routing_keys(&self) -> RoutingKeys {
        RoutingKeys {
            created: self.user_created_key.clone(),
            updated: self.user_updated_key.clone(),
            deleted: self.user_deleted_key.clone(),
        }
    }

    pub fn notification_queues(&self) -> NotificationQueues {
        NotificationQueues {
            main: self.email_main_queue.clone(),
            retry: self.email_retry_queue.clone(),
            dead: self.email_dead_queue.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_count,
            retry_delay_ms: self.retry_delay_ms,
        }
    }

    pub fn template_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.template_fetch_attempts,
            initial_delay_ms: self.template_initial_delay_ms,
            max_delay_ms: self.template_max_delay_ms,
            backoff_multiplier: self.template_backoff_multiplier,
        }
    }

    /// Backoff for delivery-status writes to Redis.
    pub fn redis_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.redis_write_attempts,
            initial_delay_ms: self.redis_initial_delay_ms,
            max_delay_ms: self.redis_max_delay_ms,
            backoff_multiplier: 2,
        }
    }

    pub fn topology(&self) -> Topology {
        Topology::new()
            .with_event_subscription(
                self.user_events_exchange.clone(),
                self.user_replica_queue.clone(),
                self.user_routing_pattern.clone(),
            )
            .with_retry_channel(&self.notification_queues(), self.retry_delay_ms)
    }
}

fn default_prefetch_count() -> u16 {
    10
}

fn default_service_name() -> String {
    "event-bus".to_string()
}

fn default_user_events_exchange() -> String {
    "user-events".to_string()
}

fn default_user_replica_queue() -> String {
    "content-service.user-replica".to_string()
}

fn default_user_routing_pattern() -> String {
    "user.*".to_string()
}

fn default_user_created_key() -> String {
    "user.created".to_string()
}

fn default_user_updated_key() -> String {
    "user.updated".to_string()
}

fn default_user_deleted_key() -> String {
    "user.deleted".to_string()
}

fn default_email_main_queue() -> String {
    "notification.email.main".to_string()
}

fn default_email_retry_queue() -> String {
    "notification.email.retry".to_string()
}

fn default_email_dead_queue() -> String {
    "notification.email.dead".to_string()
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_handler_timeout_ms() -> u64 {
    30_000
}

fn default_requeue_delay_ms() -> u64 {
    1000
}

fn default_idempotency_ttl_seconds() -> u64 {
    86_400
}

fn default_redis_write_attempts() -> u32 {
    3
}

fn default_redis_initial_delay_ms() -> u64 {
    50
}

fn default_redis_max_delay_ms() -> u64 {
    500
}

fn default_template_service_url() -> String {
    "http://localhost:8084".to_string()
}

fn default_template_fetch_attempts() -> u32 {
    3
}

fn default_template_initial_delay_ms() -> u64 {
    200
}

fn default_template_max_delay_ms() -> u64 {
    2000
}

fn default_template_backoff_multiplier() -> u64 {
    2
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    1025
}

fn default_true() -> bool {
    true
}

fn default_worker_concurrency() -> usize {
    1
}

fn default_server_port() -> u16 {
    8080
}
