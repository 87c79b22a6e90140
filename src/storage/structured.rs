// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed structured tier.
//!
//! The highest-capacity tier and the only one that survives a process
//! restart on its own. Schema:
//!
//! ```sql
//! CREATE TABLE relay_kv (
//!   key TEXT PRIMARY KEY,
//!   value BLOB NOT NULL,
//!   written_at INTEGER NOT NULL
//! )
//! ```

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use super::traits::{StorageError, StorageTier, TierKind};
use crate::resilience::retry::{retry, RetryConfig};

pub struct StructuredTier {
    pool: SqlitePool,
    url: String,
}

impl StructuredTier {
    /// Open (creating if needed) a database file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().to_string_lossy());
        Self::connect(&url).await
    }

    /// Connect to any sqlite URL, including `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        info!(url = %url, "Opening structured storage tier");

        // A single connection keeps `sqlite::memory:` coherent and serializes writers
        let pool = retry("structured_connect", &RetryConfig::startup(), || async {
            SqlitePoolOptions::new()
                .max_connections(1)
                .acquire_timeout(Duration::from_secs(10))
                .connect(url)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let tier = Self {
            pool,
            url: url.to_string(),
        };
        tier.init_schema().await?;
        Ok(tier)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relay_kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                written_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(format!("Failed to create relay_kv: {}", e)))?;
        Ok(())
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of stored keys.
    pub async fn count(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM relay_kv")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let n: i64 = row
            .try_get("n")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(n.max(0) as u64)
    }

    /// Close the pool, flushing SQLite's own journal.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl StorageTier for StructuredTier {
    fn kind(&self) -> TierKind {
        TierKind::Structured
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row = sqlx::query("SELECT value FROM relay_kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        match row {
            Some(row) => {
                let value: Vec<u8> = row
                    .try_get("value")
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO relay_kv (key, value, written_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, written_at = excluded.written_at",
        )
        .bind(key)
        .bind(value)
        .bind(crate::event::now_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        debug!(key, bytes = value.len(), "Structured tier write");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM relay_kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}
