use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::{Result, StateStoreError, store::StateStore, store::pattern_to_like};

/// PostgreSQL-backed state store implementation.
///
/// Plain values live in `state_entries` with a nullable `expires_at`;
/// set members live in `state_set_members`. Expiry timestamps are computed by
/// the database clock so readers and writers agree on what is expired.
#[derive(Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    /// Creates a new PostgreSQL state store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a connection pool to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    async fn has_live_value(&self, key: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM state_entries
                WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            )
            "#,
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn has_set(&self, key: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM state_set_members WHERE key = $1)")
                .bind(key)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar(
            r#"
            SELECT value FROM state_entries
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        if value.is_none() && self.has_set(key).await? {
            return Err(StateStoreError::WrongType {
                key: key.to_string(),
            });
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM state_set_members WHERE key = $1")
            .bind(key)
            .execute(&mut *tx)
            .await?;

        // NULL seconds yield a NULL expiry, i.e. no TTL.
        sqlx::query(
            r#"
            INSERT INTO state_entries (key, value, expires_at)
            VALUES ($1, $2, NOW() + ($3::float8 * INTERVAL '1 second'))
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.map(|ttl| ttl.as_secs_f64()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let entries = sqlx::query(
            r#"
            DELETE FROM state_entries
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .execute(&mut *tx)
        .await?;
        // Expired leftovers go too, but do not count as a removal.
        sqlx::query("DELETE FROM state_entries WHERE key = $1")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        let members = sqlx::query("DELETE FROM state_set_members WHERE key = $1")
            .bind(key)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(entries.rows_affected() + members.rows_affected() > 0)
    }

    async fn keys_by_pattern(&self, pattern: &str) -> Result<Vec<String>> {
        let keys: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT key FROM state_entries
            WHERE key LIKE $1 ESCAPE '\' AND (expires_at IS NULL OR expires_at > NOW())
            UNION
            SELECT key FROM state_set_members
            WHERE key LIKE $1 ESCAPE '\'
            ORDER BY 1
            "#,
        )
        .bind(pattern_to_like(pattern))
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<()> {
        if self.has_live_value(key).await? {
            return Err(StateStoreError::WrongType {
                key: key.to_string(),
            });
        }

        sqlx::query(
            "INSERT INTO state_set_members (key, member) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(key)
        .bind(member)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        if self.has_live_value(key).await? {
            return Err(StateStoreError::WrongType {
                key: key.to_string(),
            });
        }

        let members: Vec<String> = sqlx::query_scalar(
            "SELECT member FROM state_set_members WHERE key = $1 ORDER BY member",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<()> {
        if self.has_live_value(key).await? {
            return Err(StateStoreError::WrongType {
                key: key.to_string(),
            });
        }

        sqlx::query("DELETE FROM state_set_members WHERE key = $1 AND member = $2")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
    #[tracing::instrument(skip(self))]
    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM state_entries WHERE expires_at IS NOT NULL AND expires_at <= NOW()",
        )
        .execute(&self.pool)
        .await?;
        tracing::debug!(purged = result.rows_affected(), "purged expired state entries");
        Ok(result.rows_affected())
    }
}
