use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::{
    clients::store::ReplicaStore,
    consumers::MessageProcessor,
    error::MessagingError,
    models::{
        delivery::{Disposition, InboundMessage},
        envelope::{self, Envelope},
        routing::{RoutingKeys, UserEvent},
        user::{ReplicaWrite, UserData, UserRef, WriteOutcome},
    },
};

/// Keeps the local user replica in step with upstream user events.
pub struct ReplicaConsumer {
    store: Arc<dyn ReplicaStore>,
    routing_keys: RoutingKeys,
}

impl ReplicaConsumer {
    pub fn new(store: Arc<dyn ReplicaStore>, routing_keys: RoutingKeys) -> Self {
        Self {
            store,
            routing_keys,
        }
    }

    fn write_for(event: UserEvent, body: &[u8]) -> Result<ReplicaWrite, MessagingError> {
        Ok(match event {
            UserEvent::Created => ReplicaWrite::CreateIfAbsent(payload::<UserData>(body)?.into()),
            UserEvent::Updated => ReplicaWrite::Upsert(payload::<UserData>(body)?.into()),
            UserEvent::Deleted => ReplicaWrite::DeleteIfPresent(payload::<UserRef>(body)?.id),
        })
    }
}

fn payload<T: DeserializeOwned>(body: &[u8]) -> Result<T, MessagingError> {
    let envelope: Envelope<T> = envelope::decode(body)?;
    Ok(envelope.payload)
}

#[async_trait]
impl MessageProcessor for ReplicaConsumer {
    async fn process(&self, message: &InboundMessage) -> Disposition {
        let event = match self.routing_keys.resolve(&message.routing_key) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    routing_key = %message.routing_key,
                    delivery_tag = message.delivery_tag,
                    error = %e,
                    "Dropping user event with unrecognized routing key"
                );
                return Disposition::Reject;
            }
        };

        let write = match Self::write_for(event, &message.body) {
            Ok(write) => write,
            Err(e) => {
                warn!(
                    routing_key = %message.routing_key,
                    delivery_tag = message.delivery_tag,
                    error = %e,
                    "Rejecting undecodable user event"
                );
                return Disposition::Reject;
            }
        };

        debug!(routing_key = %message.routing_key, ?write, "Applying replica write");

        match self.store.apply(write).await {
            Ok(WriteOutcome::Applied) => {
                info!(routing_key = %message.routing_key, "Replica updated");
                Disposition::Ack
            }
            Ok(WriteOutcome::AlreadyApplied) => {
                debug!(
                    routing_key = %message.routing_key,
                    redelivered = message.redelivered,
                    "Replica already up to date"
                );
                Disposition::Ack
            }
            Err(e) if e.is_retriable() => {
                warn!(
                    routing_key = %message.routing_key,
                    error = %e,
                    "Replica store unavailable, requeueing"
                );
                Disposition::Requeue
            }
            Err(e) => {
                error!(
                    routing_key = %message.routing_key,
                    error = %e,
                    "Replica write cannot succeed, rejecting"
                );
                Disposition::Reject
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn deleted_payload_ignores_extra_fields() {
        let body = serde_json::to_vec(&json!({
            "message_id": "7d7b3f5e-2f4e-4c1a-9a55-0d7f3b0c2e11",
            "name": "user.deleted",
            "kind": "event",
            "payload": {"id": 7, "public_id": "gone"},
            "metadata": {"origin_service": "user-service", "emitted_at": "2024-01-01T00:00:00Z"}
        }))
        .unwrap();

        let write = ReplicaConsumer::write_for(UserEvent::Deleted, &body).unwrap();

        assert_eq!(write, ReplicaWrite::DeleteIfPresent(7));
    }

    #[test]
    fn created_payload_without_roles_fails_to_decode() {
        let body = serde_json::to_vec(&json!({
            "message_id": "7d7b3f5e-2f4e-4c1a-9a55-0d7f3b0c2e11",
            "name": "user.created",
            "kind": "event",
            "payload": {"id": 7, "public_id": "abc"},
            "metadata": {"origin_service": "user-service", "emitted_at": "2024-01-01T00:00:00Z"}
        }))
        .unwrap();

        assert!(ReplicaConsumer::write_for(UserEvent::Created, &body).is_err());
    }
}
