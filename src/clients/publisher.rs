use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info};

use crate::{
    clients::broker::MessageBroker,
    error::MessagingError,
    models::{
        delivery::PublishOptions,
        email::EmailRequest,
        envelope::{self, Envelope},
        routing::{RoutingKeys, UserEvent, validate_routing_key},
        topology::DEFAULT_EXCHANGE,
        user::UserData,
    },
};

/// Sends envelopes to the broker. Cheap to clone.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn MessageBroker>,
    service_name: String,
    user_events_exchange: String,
    routing_keys: RoutingKeys,
    notification_queue: String,
}

impl Publisher {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        service_name: impl Into<String>,
        user_events_exchange: impl Into<String>,
        routing_keys: RoutingKeys,
        notification_queue: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            service_name: service_name.into(),
            user_events_exchange: user_events_exchange.into(),
            routing_keys,
            notification_queue: notification_queue.into(),
        }
    }

    /// Publish one envelope without waiting for a broker confirm.
    pub async fn publish<T: Serialize + Sync>(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope<T>,
        options: PublishOptions,
    ) -> Result<(), MessagingError> {
        validate_routing_key(routing_key)?;

        let body = envelope::encode(envelope)?;

        debug!(
            message_id = %envelope.message_id,
            exchange = %exchange,
            routing_key = %routing_key,
            persistent = options.persistent,
            "Publishing envelope"
        );

        self.broker
            .publish(exchange, routing_key, &body, options)
            .await
            .inspect_err(|e| {
                error!(
                    message_id = %envelope.message_id,
                    routing_key = %routing_key,
                    error = %e,
                    "Failed to publish envelope"
                );
            })
    }

    pub async fn publish_user_event(
        &self,
        event: UserEvent,
        user: UserData,
    ) -> Result<Envelope<serde_json::Value>, MessagingError> {
        let routing_key = self.routing_keys.key_for(event).to_string();

        // Deletions carry only the id.
        let payload = match event {
            UserEvent::Deleted => json!({ "id": user.id }),
            UserEvent::Created | UserEvent::Updated => serde_json::to_value(&user)
                .map_err(|e| MessagingError::Encode(e.to_string()))?,
        };

        let envelope = Envelope::event(routing_key.clone(), payload, self.service_name.clone());

        self.publish(
            &self.user_events_exchange,
            &routing_key,
            &envelope,
            PublishOptions::persistent(),
        )
        .await?;

        info!(
            message_id = %envelope.message_id,
            user_id = user.id,
            routing_key = %routing_key,
            "User event published"
        );

        Ok(envelope)
    }

    pub async fn publish_notification(
        &self,
        request: EmailRequest,
    ) -> Result<Envelope<EmailRequest>, MessagingError> {
        let envelope = Envelope::request("notification.email", request, self.service_name.clone());

        self.publish(
            DEFAULT_EXCHANGE,
            &self.notification_queue,
            &envelope,
            PublishOptions::persistent(),
        )
        .await?;

        info!(
            message_id = %envelope.message_id,
            template_id = %envelope.payload.template_id,
            queue = %self.notification_queue,
            "Notification queued"
        );

        Ok(envelope)
    }
}
