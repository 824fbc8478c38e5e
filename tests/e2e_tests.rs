use std::time::{Duration, Instant};

use anyhow::Result;
use event_bus::{
    clients::{
        broker::MessageBroker,
        database::PostgresReplicaStore,
        rbmq::RabbitMqClient,
        redis::{IdempotencyGuard, RedisIdempotencyGuard},
        store::ReplicaStore,
    },
    error::MessagingError,
    models::{
        delivery::{HeaderValue, PublishOptions, RETRY_COUNT_HEADER},
        retry::RetryConfig,
        status::IdempotencyStatus,
        topology::{DEFAULT_EXCHANGE, NotificationQueues, Topology},
        user::{ReplicaWrite, UserReplica, WriteOutcome},
    },
};
use futures_util::StreamExt;
use tokio::time::timeout;
use uuid::Uuid;

/// These tests talk to live services. Each one is skipped when its URL is
/// not configured.
fn service_url(var: &str) -> Option<String> {
    dotenvy::dotenv().ok();
    let url = std::env::var(var).ok().filter(|url| !url.is_empty());
    if url.is_none() {
        println!("{} not set, skipping", var);
    }
    url
}

fn unique_queues() -> NotificationQueues {
    let suffix = Uuid::new_v4().simple().to_string();
    NotificationQueues {
        main: format!("e2e.{}.main", suffix),
        retry: format!("e2e.{}.retry", suffix),
        dead: format!("e2e.{}.dead", suffix),
    }
}

fn unique_user_id() -> i64 {
    i64::from(rand::random::<u32>()) + 1
}

fn replica(user_id: i64, public_id: &str, roles: &str) -> UserReplica {
    UserReplica {
        user_id,
        public_id: public_id.to_string(),
        roles: roles.to_string(),
    }
}

/// Test: Headers survive a real RabbitMQ round trip
#[tokio::test]
async fn test_rabbitmq_round_trip_keeps_retry_headers() -> Result<()> {
    let Some(url) = service_url("RABBITMQ_URL") else {
        return Ok(());
    };
    let broker = RabbitMqClient::connect(&url, 1).await?;
    let queues = unique_queues();

    broker
        .declare(&Topology::new().with_retry_channel(&queues, 200))
        .await?;

    let options = PublishOptions::persistent()
        .with_retry_count(2)
        .with_failure_reason("smtp unavailable");
    broker
        .publish(DEFAULT_EXCHANGE, &queues.main, b"payload", options)
        .await?;

    let mut deliveries = broker.consume(&queues.main, "e2e-round-trip").await?;
    let delivery = timeout(Duration::from_secs(5), deliveries.next())
        .await?
        .expect("delivery")?;

    assert_eq!(delivery.body, b"payload");
    assert_eq!(delivery.retry_count(), 2);
    assert_eq!(delivery.failure_reason(), Some("smtp unavailable"));

    broker.acknowledge(delivery.delivery_tag).await?;

    Ok(())
}

/// Test: A rejected message comes back to the main queue once the retry TTL expires
#[tokio::test]
async fn test_rabbitmq_rejected_message_returns_after_ttl() -> Result<()> {
    let Some(url) = service_url("RABBITMQ_URL") else {
        return Ok(());
    };
    let broker = RabbitMqClient::connect(&url, 1).await?;
    let queues = unique_queues();
    let retry_delay = Duration::from_millis(300);

    broker
        .declare(&Topology::new().with_retry_channel(&queues, retry_delay.as_millis() as u64))
        .await?;
    broker
        .publish(
            DEFAULT_EXCHANGE,
            &queues.main,
            b"payload",
            PublishOptions::persistent().with_retry_count(1),
        )
        .await?;

    let mut deliveries = broker.consume(&queues.main, "e2e-ttl").await?;

    let first = timeout(Duration::from_secs(5), deliveries.next())
        .await?
        .expect("first delivery")?;
    let rejected_at = Instant::now();
    broker.reject(first.delivery_tag, false).await?;

    let second = timeout(Duration::from_secs(5), deliveries.next())
        .await?
        .expect("second delivery")?;

    assert!(rejected_at.elapsed() >= retry_delay);
    assert_eq!(second.body, b"payload");
    // The broker's own x-death bookkeeping is dropped; our count is untouched.
    assert!(!second.headers.contains_key("x-death"));
    assert_eq!(second.headers.get(RETRY_COUNT_HEADER), Some(&HeaderValue::Int(1)));

    broker.acknowledge(second.delivery_tag).await?;

    Ok(())
}

/// Test: Replica writes against Postgres are idempotent
#[tokio::test]
async fn test_postgres_replica_writes_are_idempotent() -> Result<()> {
    let Some(url) = service_url("DATABASE_URL") else {
        return Ok(());
    };
    let store = PostgresReplicaStore::connect(&url).await?;
    store.health_check().await?;

    let user_id = unique_user_id();
    let public_id = format!("e2e_{}", Uuid::new_v4());
    let created = replica(user_id, &public_id, "ROLE_USER");

    assert_eq!(
        store.apply(ReplicaWrite::CreateIfAbsent(created.clone())).await?,
        WriteOutcome::Applied
    );
    assert_eq!(
        store.apply(ReplicaWrite::CreateIfAbsent(created.clone())).await?,
        WriteOutcome::AlreadyApplied
    );

    let promoted = replica(user_id, &public_id, "ROLE_USER,ROLE_ADMIN");
    assert_eq!(
        store.apply(ReplicaWrite::Upsert(promoted.clone())).await?,
        WriteOutcome::Applied
    );
    assert_eq!(
        store.apply(ReplicaWrite::Upsert(promoted.clone())).await?,
        WriteOutcome::AlreadyApplied
    );
    assert_eq!(store.find(user_id).await?, Some(promoted));

    assert_eq!(
        store.apply(ReplicaWrite::DeleteIfPresent(user_id)).await?,
        WriteOutcome::Applied
    );
    assert_eq!(
        store.apply(ReplicaWrite::DeleteIfPresent(user_id)).await?,
        WriteOutcome::AlreadyApplied
    );
    assert_eq!(store.find(user_id).await?, None);

    Ok(())
}

/// Test: Inserting a new user with a public id held by another row is a conflict
#[tokio::test]
async fn test_postgres_upsert_with_taken_public_id_conflicts() -> Result<()> {
    let Some(url) = service_url("DATABASE_URL") else {
        return Ok(());
    };
    let store = PostgresReplicaStore::connect(&url).await?;

    let owner = unique_user_id();
    let public_id = format!("e2e_{}", Uuid::new_v4());
    store
        .apply(ReplicaWrite::CreateIfAbsent(replica(owner, &public_id, "ROLE_USER")))
        .await?;

    let result = store
        .apply(ReplicaWrite::Upsert(replica(owner.wrapping_add(1), &public_id, "ROLE_USER")))
        .await;

    assert!(matches!(result, Err(MessagingError::Conflict(_))));

    store.apply(ReplicaWrite::DeleteIfPresent(owner)).await?;

    Ok(())
}

/// Test: Delivery markers written to Redis read back
#[tokio::test]
async fn test_redis_guard_tracks_delivery_status() -> Result<()> {
    let Some(url) = service_url("REDIS_URL") else {
        return Ok(());
    };
    let retry = RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 10,
        max_delay_ms: 50,
        backoff_multiplier: 2,
    };
    let guard = RedisIdempotencyGuard::connect(&url, 60, retry).await?;
    guard.ping().await?;

    let sent = Uuid::new_v4();
    let failed = Uuid::new_v4();

    assert_eq!(guard.check(&sent).await?, IdempotencyStatus::NotFound);

    guard.mark_as_sent(&sent).await?;
    guard.mark_as_failed(&failed).await?;

    assert_eq!(guard.check(&sent).await?, IdempotencyStatus::Sent);
    assert_eq!(guard.check(&failed).await?, IdempotencyStatus::Failed);

    Ok(())
}
