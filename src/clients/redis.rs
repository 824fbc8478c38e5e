use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    models::{retry::RetryConfig, status::IdempotencyStatus},
    utils::retry_with_backoff,
};

/// Remembers which notification envelopes were already delivered.
#[async_trait]
pub trait IdempotencyGuard: Send + Sync {
    async fn check(&self, message_id: &Uuid) -> Result<IdempotencyStatus, Error>;

    async fn mark_as_sent(&self, message_id: &Uuid) -> Result<(), Error>;

    async fn mark_as_failed(&self, message_id: &Uuid) -> Result<(), Error>;
}

pub struct RedisIdempotencyGuard {
    connection: MultiplexedConnection,
    ttl_seconds: u64,
    retry_config: RetryConfig,
}

impl RedisIdempotencyGuard {
    pub async fn connect(
        redis_url: &str,
        ttl_seconds: u64,
        retry_config: RetryConfig,
    ) -> Result<Self, Error> {
        info!("Connecting to Redis");

        let client =
            Client::open(redis_url).map_err(|e| anyhow!("Failed to create redis client: {}", e))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| anyhow!("Failed to connect to redis: {}", e))?;

        info!("Redis connection established");

        Ok(Self {
            connection,
            ttl_seconds,
            retry_config,
        })
    }

    pub async fn ping(&self) -> Result<(), Error> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Redis ping failed: {}", e))?;
        Ok(())
    }

    fn key(message_id: &Uuid) -> String {
        format!("notification:delivered:{}", message_id)
    }
}

#[async_trait]
impl IdempotencyGuard for RedisIdempotencyGuard {
    async fn check(&self, message_id: &Uuid) -> Result<IdempotencyStatus, Error> {
        let key = Self::key(message_id);
        let mut conn = self.connection.clone();

        let value: Option<String> = conn
            .get(&key)
            .await
            .map_err(|e| anyhow!("Failed to get cached value: {}", e))?;

        let status = IdempotencyStatus::from_stored(value.as_deref());
        if status == IdempotencyStatus::NotFound && value.is_some() {
            warn!(key = %key, "Unknown idempotency status, treating as not found");
        }

        Ok(status)
    }

    async fn mark_as_sent(&self, message_id: &Uuid) -> Result<(), Error> {
        let key = Self::key(message_id);

        let value = IdempotencyStatus::Sent.to_string();

        retry_with_backoff(&self.retry_config, || {
            let key = key.clone();
            let value = value.clone();
            let mut conn = self.connection.clone();
            let ttl = self.ttl_seconds;

            async move {
                conn.set_ex::<_, _, ()>(&key, value, ttl)
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .await
        .map_err(|e| anyhow!("mark_as_sent failed: {}", e))?;

        Ok(())
    }

    async fn mark_as_failed(&self, message_id: &Uuid) -> Result<(), Error> {
        let key = Self::key(message_id);
        let mut conn = self.connection.clone();

        conn.set_ex::<_, _, ()>(&key, IdempotencyStatus::Failed.to_string(), self.ttl_seconds)
            .await
            .map_err(|e| anyhow!("Failed to mark value as failed: {}", e))?;

        Ok(())
    }
}
