use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::{
    error::MessagingError,
    models::{
        delivery::{InboundMessage, PublishOptions},
        topology::Topology,
    },
};

pub type DeliveryStream =
    Pin<Box<dyn Stream<Item = Result<InboundMessage, MessagingError>> + Send + 'static>>;

/// Transport seam between the messaging core and a concrete broker.
///
/// Every method can block on broker I/O and fails with
/// `MessagingError::Transport` when the broker cannot be reached.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Declare exchanges, queues and bindings. Idempotent.
    async fn declare(&self, topology: &Topology) -> Result<(), MessagingError>;

    /// Send one message. Returns once it is handed to the transport; no
    /// publisher confirm is awaited.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<(), MessagingError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, MessagingError>;

    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), MessagingError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError>;

    async fn is_connected(&self) -> bool;
}
