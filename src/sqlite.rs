// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared SQLite plumbing for the GOL, cursor store and destination store.
//!
//! Short statements go through [`execute_with_retry`], which absorbs
//! SQLITE_BUSY/SQLITE_LOCKED for a few attempts. Anything still failing
//! surfaces as [`GlobalSyncError::Store`] and the worker's own backoff loop
//! takes over.

use crate::error::{GlobalSyncError, Result};
use crate::resilience::RetryConfig;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// In-memory databases are per-connection; the pool is pinned to one.
pub const MEMORY_PATH: &str = ":memory:";

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// 10ms doubling to 500ms, five attempts in total.
fn busy_schedule() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        ..RetryConfig::worker(10, 500)
    }
}

/// SQLITE_BUSY or SQLITE_LOCKED, including their extended codes.
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = e else {
        return false;
    };
    match db_err.code().and_then(|code| code.parse::<i32>().ok()) {
        Some(code) => matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED),
        None => {
            let msg = db_err.message().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
    }
}

/// Run `f`, retrying while SQLite reports the database busy.
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let schedule = busy_schedule();
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "SQLite statement succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempt < schedule.max_attempts => {
                let delay = schedule.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "SQLite busy, retrying"
                );
                crate::metrics::sqlite_retries_total(operation);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation, attempt, "SQLite still busy, giving up");
                }
                return Err(e);
            }
        }
    }
}

/// Open a pool for `path`, creating the file if needed.
///
/// `":memory:"` gets a single shared connection so every query sees the
/// same database.
pub(crate) async fn open_pool(path: &str, wal_mode: bool) -> Result<SqlitePool> {
    let in_memory = path == MEMORY_PATH;
    let url = if in_memory {
        "sqlite::memory:".to_string()
    } else {
        format!("sqlite://{}?mode=rwc", path)
    };

    let mut options = SqliteConnectOptions::from_str(&url)
        .map_err(|e| GlobalSyncError::Config(format!("Invalid SQLite path '{}': {}", path, e)))?
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .create_if_missing(true);

    if wal_mode && !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let mut pool_options = SqlitePoolOptions::new();
    pool_options = if in_memory {
        pool_options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        pool_options.max_connections(4)
    };

    Ok(pool_options.connect_with(options).await?)
}

/// Force flush WAL to the main database file.
pub(crate) async fn checkpoint(pool: &SqlitePool, operation_name: &str) -> Result<()> {
    execute_with_retry(operation_name, || async {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(pool)
            .await
    })
    .await?;
    debug!(operation = operation_name, "WAL checkpoint complete");
    Ok(())
}
