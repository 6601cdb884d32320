use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use crate::replica_storage::{RecordChange, ReplicaStore, StorageError, Transition, TransitionFn};
use crate::types::{DeadLetter, LocalUserRecord, SkipReason};

const USER_COLUMNS: &str =
    "local_id, external_id, username, email, first_name, last_name, role, created_at, updated_at";

/// PostgreSQL-backed user replica
/// Shares the `replica_users` table with the user CRUD API
pub struct PostgresReplicaStore {
    pool: Pool,
}

impl PostgresReplicaStore {
    /// Create the connection pool and verify the database is reachable
    pub async fn new(database_url: &str, max_size: usize) -> Result<Self, StorageError> {
        let config = database_url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| StorageError::ConfigurationError(format!("Invalid database URL: {e}")))?;

        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let manager = Manager::from_config(config, NoTls, manager_config);

        let pool = Pool::builder(manager)
            .max_size(max_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StorageError::ConnectionError(format!("Failed to create pool: {e}")))?;

        // Test connection
        let _client = pool.get().await.map_err(|e| {
            StorageError::ConnectionError(format!("Failed to get test connection: {e}"))
        })?;

        tracing::info!("PostgreSQL replica store connected (pool size {})", max_size);

        Ok(Self { pool })
    }

    async fn get_conn(&self) -> Result<deadpool_postgres::Client, StorageError> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::ConnectionError(format!("Failed to get connection: {e}")))
    }

    /// Create the replica tables and indexes if they do not exist yet
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        let client = self.get_conn().await?;

        tracing::info!("Running replica schema migrations...");
        let migration_sql = include_str!("../migrations/V1__replica_users.sql");
        client
            .batch_execute(migration_sql)
            .await
            .map_err(|e| StorageError::ConfigurationError(format!("Migration failed: {e}")))?;
        tracing::info!("Replica schema is up to date");

        Ok(())
    }

    pub fn close(&self) {
        self.pool.close();
    }

    fn row_to_record(row: &Row) -> LocalUserRecord {
        LocalUserRecord {
            local_id: row.get("local_id"),
            external_id: row.get("external_id"),
            username: row.get("username"),
            email: row.get("email"),
            first_name: row.get("first_name"),
            last_name: row.get("last_name"),
            role: row.get("role"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    async fn query_users(
        &self,
        filter: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<LocalUserRecord>, StorageError> {
        let client = self.get_conn().await?;
        let sql = format!("SELECT {USER_COLUMNS} FROM replica_users {filter}");

        let rows = client
            .query(sql.as_str(), params)
            .await
            .map_err(|e| StorageError::ReadError(format!("Failed to load users: {e}")))?;

        Ok(rows.iter().map(Self::row_to_record).collect())
    }
}

#[async_trait]
impl ReplicaStore for PostgresReplicaStore {
    async fn apply_transition(
        &self,
        external_id: Uuid,
        decide: &TransitionFn<'_>,
    ) -> Result<Transition, StorageError> {
        let mut client = self.get_conn().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| StorageError::WriteError(format!("Failed to begin transaction: {e}")))?;

        let row = tx
            .query_opt(
                format!("SELECT {USER_COLUMNS} FROM replica_users WHERE external_id = $1 FOR UPDATE")
                    .as_str(),
                &[&external_id],
            )
            .await
            .map_err(|e| StorageError::ReadError(format!("Failed to lock user: {e}")))?;

        let existing = row.as_ref().map(Self::row_to_record);
        let mut transition = decide(existing.as_ref());

        match &transition.change {
            RecordChange::Insert(record) => {
                let inserted = tx
                    .execute(
                        "INSERT INTO replica_users
                            (local_id, external_id, username, email, first_name, last_name, role, created_at, updated_at)
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                         ON CONFLICT (external_id) DO NOTHING",
                        &[
                            &record.local_id,
                            &record.external_id,
                            &record.username,
                            &record.email,
                            &record.first_name,
                            &record.last_name,
                            &record.role,
                            &record.created_at,
                            &record.updated_at,
                        ],
                    )
                    .await
                    .map_err(|e| StorageError::WriteError(format!("Failed to insert user: {e}")))?;

                if inserted == 0 {
                    transition = Transition::skip(SkipReason::AlreadyPresent);
                }
            }
            RecordChange::Update(record) => {
                tx.execute(
                    "UPDATE replica_users
                     SET username = $2, email = $3, first_name = $4, last_name = $5,
                         role = $6, updated_at = $7
                     WHERE local_id = $1",
                    &[
                        &record.local_id,
                        &record.username,
                        &record.email,
                        &record.first_name,
                        &record.last_name,
                        &record.role,
                        &record.updated_at,
                    ],
                )
                .await
                .map_err(|e| StorageError::WriteError(format!("Failed to update user: {e}")))?;
            }
            RecordChange::Delete { local_id } => {
                tx.execute("DELETE FROM replica_users WHERE local_id = $1", &[local_id])
                    .await
                    .map_err(|e| StorageError::WriteError(format!("Failed to delete user: {e}")))?;
            }
            RecordChange::Keep => {}
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::WriteError(format!("Failed to commit transition: {e}")))?;

        Ok(transition)
    }

    async fn get_by_external_id(
        &self,
        external_id: Uuid,
    ) -> Result<Option<LocalUserRecord>, StorageError> {
        Ok(self
            .query_users("WHERE external_id = $1", &[&external_id])
            .await?
            .into_iter()
            .next())
    }

    async fn get_by_local_id(
        &self,
        local_id: Uuid,
    ) -> Result<Option<LocalUserRecord>, StorageError> {
        Ok(self
            .query_users("WHERE local_id = $1", &[&local_id])
            .await?
            .into_iter()
            .next())
    }

    async fn find_by_username(&self, username: &str) -> Result<Vec<LocalUserRecord>, StorageError> {
        self.query_users("WHERE username = $1", &[&username]).await
    }

    async fn list_users(&self) -> Result<Vec<LocalUserRecord>, StorageError> {
        self.query_users("ORDER BY created_at, username", &[]).await
    }

    async fn count_users(&self) -> Result<u64, StorageError> {
        let client = self.get_conn().await?;
        let row = client
            .query_one("SELECT COUNT(*) FROM replica_users", &[])
            .await
            .map_err(|e| StorageError::ReadError(format!("Failed to count users: {e}")))?;

        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<(), StorageError> {
        let client = self.get_conn().await?;
        let deliveries = i64::try_from(letter.deliveries).unwrap_or(i64::MAX);

        client
            .execute(
                "INSERT INTO sync_dead_letters (id, subject, event_id, payload, reason, deliveries, recorded_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &letter.id,
                    &letter.subject,
                    &letter.event_id,
                    &letter.payload,
                    &letter.reason,
                    &deliveries,
                    &letter.recorded_at,
                ],
            )
            .await
            .map_err(|e| StorageError::WriteError(format!("Failed to record dead letter: {e}")))?;

        Ok(())
    }
}
