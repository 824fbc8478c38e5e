use std::{collections::HashMap, sync::Arc, time::Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    clients::{broker::MessageBroker, redis::RedisIdempotencyGuard, store::ReplicaStore},
    models::health::{HealthCheckResponse, HealthStatus, ServiceHealth},
};

const CRITICAL: [&str; 2] = ["message_broker", "replica_store"];

pub struct HealthChecker {
    broker: Arc<dyn MessageBroker>,
    store: Arc<dyn ReplicaStore>,
    redis: Option<Arc<RedisIdempotencyGuard>>,
}

impl HealthChecker {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        store: Arc<dyn ReplicaStore>,
        redis: Option<Arc<RedisIdempotencyGuard>>,
    ) -> Self {
        Self {
            broker,
            store,
            redis,
        }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        checks.insert("message_broker".to_string(), self.check_broker().await);
        checks.insert("replica_store".to_string(), self.check_store().await);

        if let Some(redis) = &self.redis {
            checks.insert("cache_service".to_string(), check_redis(redis).await);
        }

        HealthCheckResponse {
            status: determine_overall_status(&checks),
            timestamp: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            checks,
        }
    }

    async fn check_broker(&self) -> ServiceHealth {
        let start = Instant::now();

        if self.broker.is_connected().await {
            let elapsed = start.elapsed().as_millis() as u64;
            debug!(response_time_ms = elapsed, "Broker health check passed");
            ServiceHealth::healthy(elapsed)
        } else {
            warn!("Broker connection is down");
            ServiceHealth::unhealthy("Connection closed".to_string())
        }
    }

    async fn check_store(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.store.health_check().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Replica store health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Replica store health check failed");
                ServiceHealth::unhealthy(format!("Health check query failed: {}", e))
            }
        }
    }
}

async fn check_redis(redis: &RedisIdempotencyGuard) -> ServiceHealth {
    let start = Instant::now();

    match redis.ping().await {
        Ok(()) => {
            let elapsed = start.elapsed().as_millis() as u64;
            debug!(response_time_ms = elapsed, "Redis health check passed");
            ServiceHealth::healthy(elapsed)
        }
        // Delivery dedup is best effort; the pipeline keeps running without it.
        Err(e) => {
            warn!(error = %e, "Redis ping failed");
            ServiceHealth::degraded(format!("Ping failed: {}", e))
        }
    }
}

fn determine_overall_status(checks: &HashMap<String, ServiceHealth>) -> HealthStatus {
    let critical_unhealthy = checks
        .iter()
        .filter(|(name, _)| CRITICAL.contains(&name.as_str()))
        .any(|(_, health)| health.status != HealthStatus::Healthy);

    let has_degraded = checks
        .values()
        .any(|health| health.status != HealthStatus::Healthy);

    if critical_unhealthy {
        HealthStatus::Unhealthy
    } else if has_degraded {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
