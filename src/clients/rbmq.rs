use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind as AmqpExchangeKind,
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
};
use tracing::{debug, info};

use crate::{
    clients::broker::{DeliveryStream, MessageBroker},
    error::MessagingError,
    models::{
        delivery::{HeaderValue, Headers, InboundMessage, PublishOptions},
        topology::{DEFAULT_EXCHANGE, ExchangeKind, QueueSpec, Topology},
    },
};

const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub struct RabbitMqClient {
    connection: Connection,
    channel: Channel,
}

impl RabbitMqClient {
    pub async fn connect(rabbitmq_url: &str, prefetch_count: u16) -> Result<Self, MessagingError> {
        info!("Connecting to RabbitMQ");

        let connection = Connection::connect(rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|e| MessagingError::Transport(format!("Failed to connect to RabbitMQ: {}", e)))?;

        let channel = connection.create_channel().await.map_err(|e| {
            MessagingError::Transport(format!("RabbitMQ channel creation failed: {}", e))
        })?;

        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| MessagingError::Transport(format!("Failed to set up QoS: {}", e)))?;

        info!(prefetch_count, "RabbitMQ channel ready");

        Ok(Self {
            connection,
            channel,
        })
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), MessagingError> {
        let arguments = queue_arguments(spec)?;

        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| {
                MessagingError::Transport(format!("Failed to declare queue {}: {}", spec.name, e))
            })?;

        debug!(queue = %spec.name, ttl_ms = ?spec.message_ttl_ms, "Queue declared");

        Ok(())
    }
}

#[async_trait]
impl MessageBroker for RabbitMqClient {
    async fn declare(&self, topology: &Topology) -> Result<(), MessagingError> {
        for exchange in &topology.exchanges {
            let kind = match exchange.kind {
                ExchangeKind::Topic => AmqpExchangeKind::Topic,
                ExchangeKind::Direct => AmqpExchangeKind::Direct,
            };

            self.channel
                .exchange_declare(
                    &exchange.name,
                    kind,
                    ExchangeDeclareOptions {
                        durable: exchange.durable,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    MessagingError::Transport(format!(
                        "Failed to declare exchange {}: {}",
                        exchange.name, e
                    ))
                })?;

            debug!(exchange = %exchange.name, "Exchange declared");
        }

        for queue in &topology.queues {
            self.declare_queue(queue).await?;
        }

        for binding in &topology.bindings {
            self.channel
                .queue_bind(
                    &binding.queue,
                    &binding.exchange,
                    &binding.pattern,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    MessagingError::Transport(format!(
                        "Failed to bind {} to {}: {}",
                        binding.queue, binding.exchange, e
                    ))
                })?;

            debug!(
                queue = %binding.queue,
                exchange = %binding.exchange,
                pattern = %binding.pattern,
                "Queue bound"
            );
        }

        info!(
            exchanges = topology.exchanges.len(),
            queues = topology.queues.len(),
            bindings = topology.bindings.len(),
            "Topology declared"
        );

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<(), MessagingError> {
        let mut properties = BasicProperties::default().with_content_type("application/json".into());

        if options.persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        if !options.headers.is_empty() {
            properties = properties.with_headers(to_field_table(&options.headers));
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| MessagingError::Transport(format!("Failed to publish message: {}", e)))?;

        let target = if exchange == DEFAULT_EXCHANGE {
            "(default)"
        } else {
            exchange
        };

        debug!(
            exchange = target,
            routing_key,
            persistent = options.persistent,
            "Message published"
        );

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, MessagingError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Transport(format!("Failed to create consumer: {}", e)))?;

        info!(queue, consumer_tag, "Consumer created for queue");

        Ok(Box::pin(consumer.map(|delivery| {
            delivery.map(to_inbound).map_err(MessagingError::from)
        })))
    }

    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| MessagingError::Transport(format!("Failed to acknowledge message: {}", e)))?;

        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| MessagingError::Transport(format!("Failed to reject message: {}", e)))?;

        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

/// `x-` arguments of a queue: dead-letter target and message TTL.
fn queue_arguments(spec: &QueueSpec) -> Result<FieldTable, MessagingError> {
    let mut arguments = FieldTable::default();

    if let Some(target) = &spec.dead_letter {
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(target.exchange.clone().into()),
        );
        arguments.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(target.routing_key.clone().into()),
        );
    }

    if let Some(ttl) = spec.message_ttl_ms {
        let ttl = i32::try_from(ttl).map_err(|_| {
            MessagingError::Transport(format!("Queue TTL {} ms out of range for {}", ttl, spec.name))
        })?;
        arguments.insert("x-message-ttl".into(), AMQPValue::LongInt(ttl));
    }

    Ok(arguments)
}

fn to_inbound(delivery: Delivery) -> InboundMessage {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();

    InboundMessage {
        delivery_tag: delivery.delivery_tag,
        routing_key: delivery.routing_key.as_str().to_string(),
        body: delivery.data,
        headers,
        redelivered: delivery.redelivered,
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();

    for (key, value) in headers {
        let value = match value {
            HeaderValue::Int(n) => AMQPValue::LongLongInt(*n),
            HeaderValue::Text(s) => AMQPValue::LongString(s.clone().into()),
        };
        table.insert(key.as_str().into(), value);
    }

    table
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::ShortShortInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::ShortShortUInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::ShortInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::ShortUInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::LongInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::LongUInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::LongLongInt(n) => HeaderValue::Int(*n),
                AMQPValue::ShortString(s) => HeaderValue::Text(s.as_str().to_string()),
                AMQPValue::LongString(s) => {
                    HeaderValue::Text(String::from_utf8_lossy(s.as_bytes()).into_owned())
                }
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}
