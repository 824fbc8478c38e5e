use async_trait::async_trait;

use crate::models::delivery::{Disposition, InboundMessage};

pub mod notification;
pub mod replica;

/// Turns one delivery into a settlement decision. Never fails: every error
/// is resolved into a `Disposition`.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: &InboundMessage) -> Disposition;
}
