// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tailer resume positions.
//!
//! Stores the last `origin_seq` each Source Tailer appended to the global
//! log, in SQLite. This survives restarts of the origin and of the node.
//!
//! # Write-through commits
//!
//! A cursor is committed only after the GOL confirmed every append of the
//! batch it covers, and the commit goes to disk before the cache is updated.
//! A crash between the appends and the commit re-derives the same records on
//! restart; the GOL discards them as duplicates.
//!
//! ```text
//! fetch 6..=10 → append 6..=10 to GOL → commit cursor 10
//!                (crash here = re-fetch 6..=10, duplicates discarded)
//! ```
//!
//! ## Cursor Semantics
//!
//! The cursor stores the **last appended** origin sequence. On restart the
//! Tailer resumes from `cursor + 1`. A missing cursor is ambiguous (fresh
//! origin or lost state) and is resolved by the Tailer against the GOL's
//! per-origin watermark.

use crate::error::{GlobalSyncError, Result};
use crate::sqlite::{checkpoint, execute_with_retry, open_pool};
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Tailer cursor entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorEntry {
    pub origin_id: String,
    /// Last origin sequence appended to the GOL
    pub origin_seq: u64,
    pub updated_at: i64,
}

/// Persistent cursor storage backed by SQLite.
pub struct CursorStore {
    pool: SqlitePool,
    /// In-memory cache, always equal to what is on disk
    cache: Arc<RwLock<HashMap<String, u64>>>,
    path: String,
}

impl CursorStore {
    /// Create a new cursor store at the given path.
    ///
    /// Creates the database and tables if they don't exist.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing cursor store");

        let pool = open_pool(&path_str, true).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tailer_cursors (
                origin_id TEXT PRIMARY KEY,
                origin_seq INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT origin_id, origin_seq FROM tailer_cursors")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (origin_id, origin_seq) in rows {
            debug!(origin_id = %origin_id, origin_seq, "Loaded cursor from disk");
            cache.insert(origin_id, origin_seq as u64);
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored cursors from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            path: path_str,
        })
    }

    /// Get the cursor for an origin.
    ///
    /// Returns `None` if no cursor exists.
    pub async fn get(&self, origin_id: &str) -> Option<u64> {
        self.cache.read().await.get(origin_id).copied()
    }

    /// Durably commit the cursor for an origin.
    ///
    /// Retries on SQLITE_BUSY/SQLITE_LOCKED with exponential backoff. The
    /// cache only moves after the write succeeded.
    pub async fn commit(&self, origin_id: &str, origin_seq: u64) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;

        let result = execute_with_retry("cursor_commit", || async {
            sqlx::query(
                r#"
                INSERT INTO tailer_cursors (origin_id, origin_seq, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(origin_id) DO UPDATE SET
                    origin_seq = excluded.origin_seq,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(origin_id)
            .bind(origin_seq as i64)
            .bind(now)
            .execute(pool)
            .await
        })
        .await;

        crate::metrics::record_cursor_commit(origin_id, result.is_ok());
        result?;

        self.cache
            .write()
            .await
            .insert(origin_id.to_string(), origin_seq);
        debug!(origin_id = %origin_id, origin_seq, "Cursor committed");
        Ok(())
    }

    /// Delete cursor for an origin (e.g., when the origin is removed).
    pub async fn delete(&self, origin_id: &str) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("cursor_delete", || async {
            sqlx::query("DELETE FROM tailer_cursors WHERE origin_id = ?")
                .bind(origin_id)
                .execute(pool)
                .await
        })
        .await?;

        self.cache.write().await.remove(origin_id);
        info!(origin_id = %origin_id, "Deleted cursor");
        Ok(())
    }

    /// Get all cursors (for health/debugging).
    pub async fn get_all(&self) -> HashMap<String, u64> {
        self.cache.read().await.clone()
    }

    /// Read every cursor straight from disk, bypassing the cache.
    pub async fn entries(&self) -> Result<Vec<CursorEntry>> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT origin_id, origin_seq, updated_at FROM tailer_cursors ORDER BY origin_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(origin_id, origin_seq, updated_at)| CursorEntry {
                origin_id,
                origin_seq: origin_seq as u64,
                updated_at,
            })
            .collect())
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        checkpoint(&self.pool, "cursor_checkpoint").await
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Cursor store closed");
    }
}

impl std::fmt::Debug for CursorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorStore")
            .field("path", &self.path)
            .finish()
    }
}

/// Reject a cursor that claims more than the GOL ever received.
pub(crate) fn check_cursor_against_watermark(
    origin_id: &str,
    cursor: u64,
    watermark: Option<u64>,
) -> Result<()> {
    match watermark {
        Some(w) if cursor > w => Err(GlobalSyncError::resume(
            format!("tailer:{}", origin_id),
            format!(
                "cursor {} is ahead of the global log watermark {}; refusing to guess",
                cursor, w
            ),
        )),
        None if cursor > 0 => Err(GlobalSyncError::resume(
            format!("tailer:{}", origin_id),
            format!(
                "cursor {} exists but the global log has no records from this origin",
                cursor
            ),
        )),
        _ => Ok(()),
    }
}
