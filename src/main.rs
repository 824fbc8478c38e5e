use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result};
use event_bus::{
    api::{AppState, run_api_server},
    clients::{
        broker::MessageBroker,
        database::PostgresReplicaStore,
        email::{EmailNotificationHandler, SmtpSender},
        health::HealthChecker,
        rbmq::RabbitMqClient,
        redis::{IdempotencyGuard, RedisIdempotencyGuard},
        store::{InMemoryReplicaStore, ReplicaStore},
        template::TemplateServiceClient,
    },
    config::Config,
    consumers::{notification::RetryPipeline, replica::ReplicaConsumer},
    logging::init_logging,
    worker::spawn_workers,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;

    init_logging(&config.service_name, "info");

    let broker: Arc<dyn MessageBroker> =
        Arc::new(RabbitMqClient::connect(&config.rabbitmq_url, config.prefetch_count).await?);
    broker.declare(&config.topology()).await?;

    let store: Arc<dyn ReplicaStore> = match &config.database_url {
        Some(url) => Arc::new(PostgresReplicaStore::connect(url).await?),
        None => {
            warn!("DATABASE_URL not set, keeping the user replica in memory");
            Arc::new(InMemoryReplicaStore::new())
        }
    };

    let redis = match &config.redis_url {
        Some(url) => Some(Arc::new(
            RedisIdempotencyGuard::connect(
                url,
                config.idempotency_ttl_seconds,
                config.redis_retry_config(),
            )
            .await?,
        )),
        None => None,
    };

    let requeue_delay = Duration::from_millis(config.requeue_delay_ms);
    let mut workers = Vec::new();

    if config.run_replica_consumer {
        let consumer = Arc::new(ReplicaConsumer::new(store.clone(), config.routing_keys()));
        workers.extend(spawn_workers(
            broker.clone(),
            consumer,
            &config.user_replica_queue,
            config.worker_concurrency,
            requeue_delay,
        ));
    }

    if config.run_notification_consumer {
        let templates =
            TemplateServiceClient::new(&config.template_service_url, config.template_retry_config())?;
        let sender = SmtpSender::new(
            &config.smtp_host,
            config.smtp_port,
            config.smtp_username.clone(),
            config.smtp_password.clone(),
            config.smtp_tls,
        )?;
        let handler = Arc::new(EmailNotificationHandler::new(templates, Arc::new(sender)));

        let mut pipeline =
            RetryPipeline::new(handler, config.notification_queues(), config.retry_policy())
                .with_handler_timeout(Duration::from_millis(config.handler_timeout_ms));
        if let Some(guard) = &redis {
            pipeline = pipeline.with_idempotency_guard(guard.clone() as Arc<dyn IdempotencyGuard>);
        }

        workers.extend(spawn_workers(
            broker.clone(),
            Arc::new(pipeline),
            &config.email_main_queue,
            config.worker_concurrency,
            requeue_delay,
        ));
    }

    info!(workers = workers.len(), "Consumers started");

    let state = Arc::new(AppState {
        health_checker: HealthChecker::new(broker, store, redis),
    });

    run_api_server(config.server_port, state).await
}
