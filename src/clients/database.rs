use async_trait::async_trait;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};

use crate::{
    clients::store::ReplicaStore,
    error::MessagingError,
    models::user::{ReplicaWrite, UserReplica, WriteOutcome},
};

/// Postgres-backed user replica.
pub struct PostgresReplicaStore {
    client: Client,
}

impl PostgresReplicaStore {
    pub async fn connect(database_url: &str) -> Result<Self, MessagingError> {
        info!("Connecting to PostgreSQL database");

        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| MessagingError::Store(format!("Failed to connect to database: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "Database connection error");
            }
        });

        let store = Self { client };
        store.run_migrations().await?;

        info!("PostgreSQL connection established");

        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), MessagingError> {
        self.client
            .batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS user_replicas (
                    id BIGINT PRIMARY KEY,
                    public_id TEXT NOT NULL UNIQUE,
                    roles TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_user_replicas_public_id ON user_replicas (public_id);
                "#,
            )
            .await
            .map_err(|e| MessagingError::Store(format!("Failed to create user_replicas table: {}", e)))?;

        Ok(())
    }
}

fn outcome(rows_affected: u64) -> WriteOutcome {
    if rows_affected == 0 {
        WriteOutcome::AlreadyApplied
    } else {
        WriteOutcome::Applied
    }
}

fn to_replica(row: &Row) -> UserReplica {
    UserReplica {
        user_id: row.get("id"),
        public_id: row.get("public_id"),
        roles: row.get("roles"),
    }
}

#[async_trait]
impl ReplicaStore for PostgresReplicaStore {
    async fn apply(&self, write: ReplicaWrite) -> Result<WriteOutcome, MessagingError> {
        let rows_affected = match &write {
            // No conflict target: a clash on either the id or the public id is a no-op.
            ReplicaWrite::CreateIfAbsent(replica) => {
                self.client
                    .execute(
                        "INSERT INTO user_replicas (id, public_id, roles) VALUES ($1, $2, $3) \
                         ON CONFLICT DO NOTHING",
                        &[&replica.user_id, &replica.public_id, &replica.roles],
                    )
                    .await?
            }
            ReplicaWrite::Upsert(replica) => {
                self.client
                    .execute(
                        "INSERT INTO user_replicas (id, public_id, roles) VALUES ($1, $2, $3) \
                         ON CONFLICT (id) DO UPDATE SET roles = EXCLUDED.roles \
                         WHERE user_replicas.roles IS DISTINCT FROM EXCLUDED.roles",
                        &[&replica.user_id, &replica.public_id, &replica.roles],
                    )
                    .await?
            }
            ReplicaWrite::DeleteIfPresent(user_id) => {
                self.client
                    .execute("DELETE FROM user_replicas WHERE id = $1", &[user_id])
                    .await?
            }
        };

        debug!(write = ?write, rows_affected, "Replica write committed");

        Ok(outcome(rows_affected))
    }

    async fn find(&self, user_id: i64) -> Result<Option<UserReplica>, MessagingError> {
        let row = self
            .client
            .query_opt(
                "SELECT id, public_id, roles FROM user_replicas WHERE id = $1",
                &[&user_id],
            )
            .await?;

        Ok(row.as_ref().map(to_replica))
    }

    async fn health_check(&self) -> Result<(), MessagingError> {
        self.client
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| MessagingError::Store(format!("Database health check failed: {}", e)))?;

        Ok(())
    }
}
