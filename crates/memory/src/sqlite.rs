//! SQLite storage backend.
//!
//! A single `entries` table keyed by the storage key. Prefix scans use
//! `substr` so keys containing `_` or `%` are matched literally.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use llamachat_core::error::StorageError;
use llamachat_core::storage::{Storage, StorageEntry};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::info;

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if missing) the database at `path`.
    ///
    /// Pass `":memory:"` for an ephemeral database.
    pub async fn new(path: &str) -> Result<Self, StorageError> {
        let ephemeral = path == ":memory:";
        let mut options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StorageError::Backend(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .synchronous(SqliteSynchronous::Normal);
        if !ephemeral {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to ":memory:" is its own database
        let mut pool_options = SqlitePoolOptions::new().max_connections(4);
        if ephemeral {
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to open SQLite: {e}")))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        info!("SQLite storage initialized at {path}");
        Ok(storage)
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                key        TEXT PRIMARY KEY NOT NULL,
                value      TEXT NOT NULL,
                timestamp  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(format!("entries table: {e}")))?;
        Ok(())
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<StorageEntry, StorageError> {
        let key: String = row.get("key");
        let ts: String = row.get("timestamp");
        let timestamp = DateTime::parse_from_rfc3339(&ts)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StorageError::Serialization {
                key: key.clone(),
                reason: format!("bad timestamp: {e}"),
            })?;
        Ok(StorageEntry {
            key,
            value: row.get("value"),
            timestamp,
        })
    }
}

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

#[async_trait]
impl Storage for SqliteStorage {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn store(&self, key: &str, value: String) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO entries (key, value, timestamp) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, timestamp = excluded.timestamp
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Option<StorageEntry>, StorageError> {
        let row = sqlx::query("SELECT key, value, timestamp FROM entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let result = sqlx::query("DELETE FROM entries WHERE substr(key, 1, length(?1)) = ?1")
            .bind(prefix)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn search_by_prefix(&self, prefix: &str) -> Result<Vec<StorageEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT key, value, timestamp FROM entries \
             WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_entry).collect()
    }
}
