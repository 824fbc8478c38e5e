use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    error::MessagingError,
    models::user::{ReplicaWrite, UserReplica, WriteOutcome},
};

/// Persistence of the user replica. Owned exclusively by the replica consumer.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Apply one idempotent write. Returns once it has committed.
    async fn apply(&self, write: ReplicaWrite) -> Result<WriteOutcome, MessagingError>;

    async fn find(&self, user_id: i64) -> Result<Option<UserReplica>, MessagingError>;

    async fn health_check(&self) -> Result<(), MessagingError>;
}

#[derive(Default)]
pub struct InMemoryReplicaStore {
    rows: RwLock<HashMap<i64, UserReplica>>,
}

impl InMemoryReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl ReplicaStore for InMemoryReplicaStore {
    async fn apply(&self, write: ReplicaWrite) -> Result<WriteOutcome, MessagingError> {
        let mut rows = self.rows.write().await;

        match write {
            ReplicaWrite::CreateIfAbsent(replica) => {
                let exists = rows.contains_key(&replica.user_id)
                    || rows.values().any(|r| r.public_id == replica.public_id);

                if exists {
                    return Ok(WriteOutcome::AlreadyApplied);
                }

                rows.insert(replica.user_id, replica);
                Ok(WriteOutcome::Applied)
            }
            // An existing row only has its roles rewritten; the public id is
            // checked for uniqueness on insert.
            ReplicaWrite::Upsert(replica) => match rows.get_mut(&replica.user_id) {
                Some(existing) if existing.roles == replica.roles => {
                    Ok(WriteOutcome::AlreadyApplied)
                }
                Some(existing) => {
                    existing.roles = replica.roles;
                    Ok(WriteOutcome::Applied)
                }
                None => {
                    if rows.values().any(|r| r.public_id == replica.public_id) {
                        return Err(MessagingError::Conflict(format!(
                            "public id '{}' already belongs to another user",
                            replica.public_id
                        )));
                    }

                    rows.insert(replica.user_id, replica);
                    Ok(WriteOutcome::Applied)
                }
            },
            ReplicaWrite::DeleteIfPresent(user_id) => match rows.remove(&user_id) {
                Some(_) => Ok(WriteOutcome::Applied),
                None => Ok(WriteOutcome::AlreadyApplied),
            },
        }
    }

    async fn find(&self, user_id: i64) -> Result<Option<UserReplica>, MessagingError> {
        Ok(self.rows.read().await.get(&user_id).cloned())
    }

    async fn health_check(&self) -> Result<(), MessagingError> {
        Ok(())
    }
}
