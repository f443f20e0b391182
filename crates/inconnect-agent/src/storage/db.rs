//! Database connection and schema initialization.
//!
//! The schema is managed in-process rather than through migration files:
//! both tables are created idempotently on startup, and a legacy
//! single-shard database (no `shard_id` column) is upgraded in place.

use std::path::Path;

use sqlx::{Pool, Row, Sqlite};
use tracing::info;

pub use inconnect_core::db::DatabaseError;

const SLOTS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS slots (
    slot_id     INTEGER PRIMARY KEY,
    password    TEXT NOT NULL,
    status      TEXT NOT NULL,
    user_id     TEXT,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    shard_id    INTEGER NOT NULL DEFAULT 1
)";

const METADATA_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metadata (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  INTEGER NOT NULL
)";

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        let pool = inconnect_core::db::open_pool(path).await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        let pool = inconnect_core::db::open_pool_in_memory().await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        sqlx::query(SLOTS_SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        sqlx::query(METADATA_SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        self.ensure_shard_column().await?;

        info!("Database schema ready");
        Ok(())
    }

    /// Upgrade a pre-sharding `slots` table: add `shard_id` defaulting to 1
    /// so existing single-shard deployments keep their rows.
    async fn ensure_shard_column(&self) -> Result<(), DatabaseError> {
        let columns = sqlx::query("PRAGMA table_info(slots)")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        for column in &columns {
            let name: String = column
                .try_get("name")
                .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            if name == "shard_id" {
                return Ok(());
            }
        }

        sqlx::query("ALTER TABLE slots ADD COLUMN shard_id INTEGER NOT NULL DEFAULT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        info!("Added shard_id column to legacy slots table");
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}
