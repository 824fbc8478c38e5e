use serde::{Deserialize, Serialize};

/// Payload of `user.created` and `user.updated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    pub id: i64,
    #[serde(alias = "publicId")]
    pub public_id: String,
    /// Delimited role string, e.g. `ROLE_USER,ROLE_ADMIN`. Stored verbatim.
    pub roles: String,
}

/// Payload of `user.deleted`. Any other field is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: i64,
}

/// Local projection of an upstream user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserReplica {
    pub user_id: i64,
    pub public_id: String,
    pub roles: String,
}

impl From<UserData> for UserReplica {
    fn from(data: UserData) -> Self {
        Self {
            user_id: data.id,
            public_id: data.public_id,
            roles: data.roles,
        }
    }
}

/// A write against the replica store. Every variant is idempotent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaWrite {
    /// Insert unless a row with the same id or public id exists.
    CreateIfAbsent(UserReplica),
    /// Insert if absent, otherwise replace the roles.
    Upsert(UserReplica),
    /// Remove if present.
    DeleteIfPresent(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    AlreadyApplied,
}
