// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed checkpoint store.
//!
//! Several namespaces can share one database file; each store instance owns
//! the row keyed by its namespace (`"db.coll"`).
//!
//! # Write-Through
//!
//! Every `save()` is an upsert that has committed when it returns. There is
//! no debounce: the capture engine relies on the position being durable
//! before it reads the next event.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when several capture processes
//! share the file. We handle this with:
//! - Automatic retry with exponential backoff
//! - Configurable max retries (default 5)

use super::{CheckpointStore, CloseFuture, LoadFuture};
use crate::error::{MigrationError, Result};
use crate::event::{Namespace, ResumePosition};
use crate::metrics;
use crate::store::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Checkpoint row for one namespace in a shared SQLite file.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    namespace: Namespace,
    key: String,
    path: String,
}

impl SqliteCheckpointStore {
    /// Open (creating if needed) the database at `path` and bind to `namespace`.
    pub async fn open(path: impl AsRef<Path>, namespace: Namespace) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, namespace = %namespace, "Opening checkpoint store");

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| MigrationError::Configuration(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Full)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                namespace TEXT PRIMARY KEY,
                position BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            key: namespace.to_string(),
            namespace,
            path: path_str,
        })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    async fn wal_checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("checkpoint_wal", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    async fn read(&self) -> Option<ResumePosition> {
        let pool = &self.pool;
        let key = self.key.as_str();
        let row: std::result::Result<Option<(Vec<u8>,)>, sqlx::Error> =
            execute_with_retry("checkpoint_load", || async {
                sqlx::query_as("SELECT position FROM checkpoints WHERE namespace = ?")
                    .bind(key)
                    .fetch_optional(pool)
                    .await
            })
            .await;

        match row {
            Ok(Some((bytes,))) => match ResumePosition::from_bytes(&bytes) {
                Ok(position) => {
                    debug!(namespace = %self.namespace, position = %position, "Loaded resume position");
                    Some(position)
                }
                Err(e) => {
                    warn!(namespace = %self.namespace, error = %e, "Stored position corrupt, treating as absent");
                    None
                }
            },
            Ok(None) => {
                info!(namespace = %self.namespace, "No stored position, starting from current position");
                None
            }
            Err(e) => {
                warn!(namespace = %self.namespace, error = %e, "Checkpoint read failed, treating as absent");
                None
            }
        }
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn load(&self) -> LoadFuture<'_> {
        Box::pin(self.read())
    }

    fn save(&self, position: &ResumePosition) -> BoxFuture<'_, ()> {
        let encoded = position.to_bytes();
        Box::pin(async move {
            let bytes = encoded?;
            let now = chrono::Utc::now().timestamp_millis();
            let pool = &self.pool;
            let key = self.key.as_str();
            let bytes = bytes.as_slice();

            let result = execute_with_retry("checkpoint_save", || async {
                sqlx::query(
                    r#"
                    INSERT INTO checkpoints (namespace, position, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(namespace) DO UPDATE SET
                        position = excluded.position,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(key)
                .bind(bytes)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            metrics::record_checkpoint_save(&self.namespace, result.is_ok());
            result?;
            Ok(())
        })
    }

    /// Checkpoint the WAL and close the pool.
    fn close(&self) -> CloseFuture<'_> {
        Box::pin(async move {
            if let Err(e) = self.wal_checkpoint().await {
                warn!(error = %e, "Failed to checkpoint WAL on close");
            }
            self.pool.close().await;
            info!(namespace = %self.namespace, "Checkpoint store closed");
        })
    }
}
