// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL storage backend for the persistent tier.
//!
//! One append-mostly table; the latest record per key pair is the one
//! with the highest id, enforced by the service layer rather than a
//! unique constraint:
//!
//! ```sql
//! CREATE TABLE cache_entry (
//!   id BIGINT AUTO_INCREMENT PRIMARY KEY,
//!   primary_cache_key VARCHAR(255) NOT NULL,
//!   secondary_cache_key VARCHAR(255) NOT NULL,
//!   created BIGINT NOT NULL,      -- epoch millis
//!   expired BIGINT NOT NULL,      -- epoch millis
//!   cache_value TEXT NOT NULL     -- serialized value, size-bounded
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver hands MySQL TEXT columns back as BLOB, so text columns
//! are read as `String` first and then as `Vec<u8>`.

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;

use super::traits::{PersistedRecord, PersistentStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const SELECT_COLUMNS: &str =
    "SELECT id, primary_cache_key, secondary_cache_key, created, expired, cache_value FROM cache_entry";

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Create a new SQL store with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 1 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS cache_entry (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    primary_cache_key TEXT NOT NULL,
                    secondary_cache_key TEXT NOT NULL,
                    created INTEGER NOT NULL,
                    expired INTEGER NOT NULL,
                    cache_value TEXT NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_cache_entry_pair ON cache_entry (primary_cache_key, secondary_cache_key)",
                "CREATE INDEX IF NOT EXISTS idx_cache_entry_expired ON cache_entry (expired)",
            ]
        } else {
            &[r#"
                CREATE TABLE IF NOT EXISTS cache_entry (
                    id BIGINT AUTO_INCREMENT PRIMARY KEY,
                    primary_cache_key VARCHAR(255) NOT NULL,
                    secondary_cache_key VARCHAR(255) NOT NULL,
                    created BIGINT NOT NULL,
                    expired BIGINT NOT NULL,
                    cache_value TEXT NOT NULL,
                    INDEX idx_cache_entry_pair (primary_cache_key, secondary_cache_key),
                    INDEX idx_cache_entry_expired (expired)
                )
                "#]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }

        Ok(())
    }

    fn read_text(row: &AnyRow, column: &str) -> Result<String, StorageError> {
        row.try_get::<String, _>(column)
            .or_else(|_| {
                row.try_get::<Vec<u8>, _>(column)
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            })
            .map_err(|e| StorageError::Backend(format!("column {}: {}", column, e)))
    }

    fn record_from_row(row: &AnyRow) -> Result<PersistedRecord, StorageError> {
        let backend = |e: sqlx::Error| StorageError::Backend(e.to_string());
        Ok(PersistedRecord {
            id: row.try_get("id").map_err(backend)?,
            primary_key: Self::read_text(row, "primary_cache_key")?,
            secondary_key: Self::read_text(row, "secondary_cache_key")?,
            created_at: row.try_get("created").map_err(backend)?,
            expires_at: row.try_get("expired").map_err(backend)?,
            value: Self::read_text(row, "cache_value")?,
        })
    }

    fn records_from_rows(rows: &[AnyRow]) -> Result<Vec<PersistedRecord>, StorageError> {
        rows.iter().map(Self::record_from_row).collect()
    }
}

#[async_trait]
impl PersistentStore for SqlStore {
    async fn insert(
        &self,
        primary_key: &str,
        secondary_key: &str,
        value: &str,
        created_at: i64,
        expires_at: i64,
    ) -> Result<i64, StorageError> {
        const INSERT: &str =
            "INSERT INTO cache_entry (primary_cache_key, secondary_cache_key, created, expired, cache_value) VALUES (?, ?, ?, ?, ?)";
        let backend = |e: sqlx::Error| StorageError::Backend(e.to_string());

        // Any reports no last_insert_id for SQLite; ask for the id instead
        if self.is_sqlite {
            let sql = format!("{} RETURNING id", INSERT);
            let row = sqlx::query(&sql)
                .bind(primary_key)
                .bind(secondary_key)
                .bind(created_at)
                .bind(expires_at)
                .bind(value)
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?;
            return row.try_get::<i64, _>("id").map_err(backend);
        }

        let result = sqlx::query(INSERT)
            .bind(primary_key)
            .bind(secondary_key)
            .bind(created_at)
            .bind(expires_at)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        result
            .last_insert_id()
            .ok_or_else(|| StorageError::Backend("driver returned no insert id".to_string()))
    }

    async fn latest(&self, primary_key: &str, secondary_key: &str) -> Result<Option<PersistedRecord>, StorageError> {
        let sql = format!(
            "{} WHERE primary_cache_key = ? AND secondary_cache_key = ? ORDER BY id DESC LIMIT 1",
            SELECT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(primary_key)
            .bind(secondary_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn count_pair(&self, primary_key: &str, secondary_key: &str) -> Result<u64, StorageError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM cache_entry WHERE primary_cache_key = ? AND secondary_cache_key = ?",
        )
        .bind(primary_key)
        .bind(secondary_key)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let count: i64 = row.try_get("cnt").map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(count as u64)
    }

    async fn delete_pair(&self, primary_key: &str, secondary_key: &str) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM cache_entry WHERE primary_cache_key = ? AND secondary_cache_key = ?")
            .bind(primary_key)
            .bind(secondary_key)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn delete_primary(&self, primary_key: &str) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM cache_entry WHERE primary_cache_key = ?")
            .bind(primary_key)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn delete_record(&self, id: i64) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM cache_entry WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn collapse_duplicates(&self) -> Result<u64, StorageError> {
        // The derived table lets MySQL delete from the table it selects from.
        let result = sqlx::query(
            r#"
            DELETE FROM cache_entry WHERE id NOT IN (
                SELECT keep_id FROM (
                    SELECT MAX(id) AS keep_id FROM cache_entry
                    GROUP BY primary_cache_key, secondary_cache_key
                ) AS keepers
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn scan_after(&self, after_id: i64, limit: usize) -> Result<Vec<PersistedRecord>, StorageError> {
        let sql = format!("{} WHERE id > ? ORDER BY id LIMIT ?", SELECT_COLUMNS);
        let rows = sqlx::query(&sql)
            .bind(after_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Self::records_from_rows(&rows)
    }

    async fn expired(&self, now_ms: i64, limit: usize) -> Result<Vec<PersistedRecord>, StorageError> {
        let sql = format!("{} WHERE expired <= ? ORDER BY id LIMIT ?", SELECT_COLUMNS);
        let rows = sqlx::query(&sql)
            .bind(now_ms)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Self::records_from_rows(&rows)
    }

    async fn count_all(&self) -> Result<u64, StorageError> {
        let result = sqlx::query("SELECT COUNT(*) AS cnt FROM cache_entry")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let count: i64 = result.try_get("cnt").map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(count as u64)
    }
}
