// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Global Operation Log (GOL).
//!
//! Append-only, strictly ordered store of [`OperationRecord`]s contributed by
//! every Source Tailer and read by every Global Applier.
//!
//! # Sequencing
//!
//! `global_seq` is assigned under a single async mutex (the sequencer). The
//! record insert and the origin watermark update commit in one SQLite
//! transaction, so an append is either fully durable or not there at all.
//! The new head is published on a `watch` channel only after the commit.
//!
//! ```text
//! Tailer A ─┐                      ┌─► Applier X (read_batch / read_from)
//!           ├─► sequencer ─► SQLite ┤
//! Tailer B ─┘   (Mutex)      (WAL)  └─► Applier Y
//!                  │
//!                  └─► head watch ──► blocked readers wake up
//! ```
//!
//! # Duplicates and gaps
//!
//! Each origin has a watermark: the highest `origin_seq` appended. A record at
//! or below it is a duplicate and is discarded without error. A record that
//! skips past `watermark + 1` is a [`GlobalSyncError::SequenceGap`]. The
//! watermark lives in its own table so it survives retention.
//!
//! # Retention
//!
//! Destinations register as consumers and confirm their committed position.
//! [`GlobalLog::reclaim`] deletes records at or below the minimum confirmed
//! position. `max_records` is a soft bound: exceeding it is reported, but
//! records a consumer still needs are never reclaimed.

use crate::error::{GlobalSyncError, Result};
use crate::record::{
    compute_patch_hash, DocumentKey, Namespace, OpKind, OperationRecord, MAX_ORIGIN_TIMESTAMP,
};
use crate::sqlite::{checkpoint, execute_with_retry, open_pool};
use futures::stream::{self, Stream};
use sqlx::sqlite::SqlitePool;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored at this `global_seq`.
    Appended(u64),
    /// Already present. Carries the original `global_seq`, or 0 if it has
    /// since been reclaimed.
    Duplicate(u64),
}

impl AppendOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, AppendOutcome::Duplicate(_))
    }
}

/// Result of a batch read.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRead {
    Records(Vec<OperationRecord>),
    /// Records after `requested` were reclaimed; the oldest retained record
    /// is `oldest`.
    Trimmed { requested: u64, oldest: u64 },
}

/// Registered consumer and its confirmed position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerEntry {
    pub destination_id: String,
    pub position: u64,
    pub updated_at: i64,
}

#[derive(Debug, Default)]
struct Sequencer {
    head: u64,
    watermarks: HashMap<String, u64>,
    /// Last appended `origin_timestamp` per origin.
    timestamps: HashMap<String, u64>,
}

type RecordRow = (i64, String, i64, String, String, String, String, i64, String);

const SELECT_RECORDS: &str = r#"
    SELECT global_seq, origin_id, origin_seq, op_kind, namespace, document_key,
           patch, origin_timestamp, observed
    FROM gol_records
    WHERE global_seq > ?
    ORDER BY global_seq
    LIMIT ?
"#;

/// SQLite-backed Global Operation Log.
pub struct GlobalLog {
    pool: SqlitePool,
    sequencer: Mutex<Sequencer>,
    head_tx: watch::Sender<u64>,
    max_records: u64,
    path: String,
}

impl GlobalLog {
    /// Open (or create) the log at `path`. `":memory:"` is supported.
    pub async fn open(path: &str, max_records: u64) -> Result<Self> {
        info!(path = %path, "Opening global operation log");
        let pool = open_pool(path, true).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS gol_records (
                global_seq INTEGER PRIMARY KEY,
                origin_id TEXT NOT NULL,
                origin_seq INTEGER NOT NULL,
                op_kind TEXT NOT NULL,
                namespace TEXT NOT NULL,
                document_key TEXT NOT NULL,
                patch TEXT NOT NULL,
                origin_timestamp INTEGER NOT NULL,
                observed TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                UNIQUE (origin_id, origin_seq)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS gol_origins (
                origin_id TEXT PRIMARY KEY,
                last_origin_seq INTEGER NOT NULL,
                last_global_seq INTEGER NOT NULL,
                last_origin_timestamp INTEGER
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS gol_consumers (
                destination_id TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS gol_meta (key TEXT PRIMARY KEY, value INTEGER NOT NULL)",
        )
        .execute(&pool)
        .await?;

        let origins: Vec<(String, i64, Option<i64>)> = sqlx::query_as(
            "SELECT origin_id, last_origin_seq, last_origin_timestamp FROM gol_origins",
        )
        .fetch_all(&pool)
        .await?;
        let mut watermarks = HashMap::with_capacity(origins.len());
        let mut timestamps = HashMap::with_capacity(origins.len());
        for (origin, seq, ts) in origins {
            if let Some(ts) = ts {
                timestamps.insert(origin.clone(), ts as u64);
            }
            watermarks.insert(origin, seq as u64);
        }

        let (max_seq,): (Option<i64>,) = sqlx::query_as("SELECT MAX(global_seq) FROM gol_records")
            .fetch_one(&pool)
            .await?;
        let trimmed = read_trimmed_through(&pool).await?;
        let head = (max_seq.unwrap_or(0) as u64).max(trimmed);

        if head > 0 {
            info!(head, origins = watermarks.len(), "Restored global log");
        }
        crate::metrics::set_gol_head(head);

        let (head_tx, _) = watch::channel(head);
        Ok(Self {
            pool,
            sequencer: Mutex::new(Sequencer {
                head,
                watermarks,
                timestamps,
            }),
            head_tx,
            max_records,
            path: path.to_string(),
        })
    }

    /// Append one record, assigning the next `global_seq`.
    #[instrument(skip(self, record), fields(origin_id = %record.origin_id, origin_seq = record.origin_seq))]
    pub async fn append(&self, record: &OperationRecord) -> Result<AppendOutcome> {
        let mut seq = self.sequencer.lock().await;

        if let Some(&watermark) = seq.watermarks.get(&record.origin_id) {
            if record.origin_seq <= watermark {
                let existing = self
                    .find_duplicate(&record.origin_id, record.origin_seq, record)
                    .await?;
                crate::metrics::record_gol_append(&record.origin_id, "duplicate");
                debug!(existing, "Duplicate append discarded");
                return Ok(AppendOutcome::Duplicate(existing));
            }
            if record.origin_seq > watermark + 1 {
                return Err(GlobalSyncError::SequenceGap {
                    origin_id: record.origin_id.clone(),
                    expected: watermark + 1,
                    found: record.origin_seq,
                });
            }
        }

        // Replay recognizes applied writes by `(origin_id, origin_timestamp)`.
        // A repeated or backwards timestamp would be skipped everywhere.
        if record.origin_timestamp > MAX_ORIGIN_TIMESTAMP {
            return Err(GlobalSyncError::RecordParse(format!(
                "Timestamp {} from {} out of range",
                record.origin_timestamp, record.origin_id
            )));
        }
        if let Some(&previous) = seq.timestamps.get(&record.origin_id) {
            if record.origin_timestamp <= previous {
                crate::metrics::record_gol_append(&record.origin_id, "timestamp_regression");
                return Err(GlobalSyncError::TimestampRegression {
                    origin_id: record.origin_id.clone(),
                    origin_seq: record.origin_seq,
                    previous,
                    found: record.origin_timestamp,
                });
            }
        }

        let global_seq = seq.head + 1;
        let patch = serde_json::to_string(&record.patch)?;
        let observed = serde_json::to_string(&record.observed)?;
        let hash = compute_patch_hash(&record.patch);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO gol_records
                (global_seq, origin_id, origin_seq, op_kind, namespace, document_key,
                 patch, origin_timestamp, observed, content_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(global_seq as i64)
        .bind(&record.origin_id)
        .bind(record.origin_seq as i64)
        .bind(record.op_kind.as_str())
        .bind(record.namespace.as_str())
        .bind(record.document_key.as_str())
        .bind(&patch)
        .bind(record.origin_timestamp as i64)
        .bind(&observed)
        .bind(&hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO gol_origins
                (origin_id, last_origin_seq, last_global_seq, last_origin_timestamp)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(origin_id) DO UPDATE SET
                last_origin_seq = excluded.last_origin_seq,
                last_global_seq = excluded.last_global_seq,
                last_origin_timestamp = excluded.last_origin_timestamp
            "#,
        )
        .bind(&record.origin_id)
        .bind(record.origin_seq as i64)
        .bind(global_seq as i64)
        .bind(record.origin_timestamp as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        seq.head = global_seq;
        seq.watermarks
            .insert(record.origin_id.clone(), record.origin_seq);
        seq.timestamps
            .insert(record.origin_id.clone(), record.origin_timestamp);
        drop(seq);

        self.head_tx.send_replace(global_seq);
        crate::metrics::record_gol_append(&record.origin_id, "appended");
        crate::metrics::set_gol_head(global_seq);
        debug!(global_seq, "Record appended");
        Ok(AppendOutcome::Appended(global_seq))
    }

    /// Move an origin's watermark past operations the Tailer consumed
    /// without appending (non-global namespaces).
    ///
    /// Keeps gap detection exact across filtered stretches. Never moves the
    /// watermark backwards.
    pub async fn advance_origin(&self, origin_id: &str, through: u64) -> Result<()> {
        let mut seq = self.sequencer.lock().await;
        if let Some(&watermark) = seq.watermarks.get(origin_id) {
            if through <= watermark {
                return Ok(());
            }
        }

        let pool = &self.pool;
        execute_with_retry("gol_advance_origin", || async {
            sqlx::query(
                r#"
                INSERT INTO gol_origins (origin_id, last_origin_seq, last_global_seq)
                VALUES (?, ?, 0)
                ON CONFLICT(origin_id) DO UPDATE SET
                    last_origin_seq = MAX(last_origin_seq, excluded.last_origin_seq)
                "#,
            )
            .bind(origin_id)
            .bind(through as i64)
            .execute(pool)
            .await
        })
        .await?;

        seq.watermarks.insert(origin_id.to_string(), through);
        debug!(origin_id, through, "Origin watermark advanced past filtered operations");
        Ok(())
    }

    async fn find_duplicate(
        &self,
        origin_id: &str,
        origin_seq: u64,
        record: &OperationRecord,
    ) -> Result<u64> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT global_seq, content_hash FROM gol_records WHERE origin_id = ? AND origin_seq = ?",
        )
        .bind(origin_id)
        .bind(origin_seq as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((global_seq, hash)) => {
                if hash != record.content_hash() {
                    warn!(
                        origin_id,
                        origin_seq, "Duplicate delivery with different content; keeping original"
                    );
                }
                global_seq as u64
            }
            None => 0,
        })
    }

    /// Read up to `limit` records with `global_seq > after`.
    pub async fn read_batch(&self, after: u64, limit: usize) -> Result<LogRead> {
        let mut tx = self.pool.begin().await?;
        let trimmed: Option<(i64,)> =
            sqlx::query_as("SELECT value FROM gol_meta WHERE key = 'trimmed_through'")
                .fetch_optional(&mut *tx)
                .await?;
        let trimmed = trimmed.map(|(v,)| v as u64).unwrap_or(0);
        if after < trimmed {
            return Ok(LogRead::Trimmed {
                requested: after,
                oldest: trimmed + 1,
            });
        }

        let rows: Vec<RecordRow> = sqlx::query_as(SELECT_RECORDS)
            .bind(after as i64)
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        let records = rows
            .into_iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>>>()?;
        Ok(LogRead::Records(records))
    }

    /// Lazy ordered stream of records after `after`.
    ///
    /// Blocks while caught up instead of ending. Ends after yielding a
    /// [`GlobalSyncError::LogTrimmed`] if the position was reclaimed.
    pub fn read_from(
        &self,
        reader_id: &str,
        after: u64,
    ) -> impl Stream<Item = Result<OperationRecord>> + '_ {
        struct ReadState {
            position: u64,
            buffer: VecDeque<OperationRecord>,
            done: bool,
            reader_id: String,
        }

        let initial = ReadState {
            position: after,
            buffer: VecDeque::new(),
            done: false,
            reader_id: reader_id.to_string(),
        };

        stream::unfold(initial, move |mut state| async move {
            if state.done {
                return None;
            }
            loop {
                if let Some(record) = state.buffer.pop_front() {
                    state.position = record.global_seq;
                    return Some((Ok(record), state));
                }
                match self.read_batch(state.position, 256).await {
                    Ok(LogRead::Records(records)) if records.is_empty() => {
                        self.wait_for_head(state.position).await;
                    }
                    Ok(LogRead::Records(records)) => state.buffer.extend(records),
                    Ok(LogRead::Trimmed { requested, oldest }) => {
                        state.done = true;
                        let err = GlobalSyncError::LogTrimmed {
                            destination_id: state.reader_id.clone(),
                            requested,
                            oldest,
                        };
                        return Some((Err(err), state));
                    }
                    Err(e) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                }
            }
        })
    }

    async fn wait_for_head(&self, after: u64) {
        let mut rx = self.head_tx.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|head| *head > after).await;
    }

    /// Wait up to `timeout` for the head to move past `after`.
    pub async fn wait_for_append(&self, after: u64, timeout: Duration) -> bool {
        if self.head() > after {
            return true;
        }
        tokio::time::timeout(timeout, self.wait_for_head(after))
            .await
            .is_ok()
    }

    /// Subscribe to head changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.head_tx.subscribe()
    }

    pub fn head(&self) -> u64 {
        *self.head_tx.borrow()
    }

    /// Highest reclaimed `global_seq` (0 if nothing was reclaimed).
    pub async fn low_water_mark(&self) -> Result<u64> {
        read_trimmed_through(&self.pool).await
    }

    /// Highest `origin_seq` appended for `origin_id`.
    pub async fn origin_watermark(&self, origin_id: &str) -> Option<u64> {
        self.sequencer.lock().await.watermarks.get(origin_id).copied()
    }

    /// Number of retained records.
    pub async fn len(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM gol_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Register (or reset) a destination's confirmed position.
    pub async fn register_consumer(&self, destination_id: &str, position: u64) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;
        execute_with_retry("gol_register_consumer", || async {
            sqlx::query(
                r#"
                INSERT INTO gol_consumers (destination_id, position, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(destination_id) DO UPDATE SET
                    position = excluded.position,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(destination_id)
            .bind(position as i64)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;
        info!(destination_id, position, "Consumer registered");
        Ok(())
    }

    /// Confirm that `destination_id` durably applied everything up to `position`.
    ///
    /// Positions never move backwards through this call.
    pub async fn confirm(&self, destination_id: &str, position: u64) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;
        execute_with_retry("gol_confirm", || async {
            sqlx::query(
                r#"
                INSERT INTO gol_consumers (destination_id, position, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(destination_id) DO UPDATE SET
                    position = MAX(position, excluded.position),
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(destination_id)
            .bind(position as i64)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    pub async fn deregister_consumer(&self, destination_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM gol_consumers WHERE destination_id = ?")
            .bind(destination_id)
            .execute(&self.pool)
            .await?;
        info!(destination_id, "Consumer deregistered");
        Ok(())
    }

    pub async fn consumer_position(&self, destination_id: &str) -> Result<Option<u64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT position FROM gol_consumers WHERE destination_id = ?")
                .bind(destination_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(p,)| p as u64))
    }

    pub async fn consumers(&self) -> Result<Vec<ConsumerEntry>> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT destination_id, position, updated_at FROM gol_consumers ORDER BY destination_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(destination_id, position, updated_at)| ConsumerEntry {
                destination_id,
                position: position as u64,
                updated_at,
            })
            .collect())
    }

    /// Delete records every registered consumer has confirmed.
    ///
    /// Returns the number of records deleted. Without consumers nothing is
    /// reclaimed.
    pub async fn reclaim(&self) -> Result<u64> {
        let (min_position,): (Option<i64>,) =
            sqlx::query_as("SELECT MIN(position) FROM gol_consumers")
                .fetch_one(&self.pool)
                .await?;
        let Some(min_position) = min_position else {
            return Ok(0);
        };
        let through = (min_position.max(0) as u64).min(self.head());
        let already = self.low_water_mark().await?;
        if through <= already {
            self.report_capacity().await?;
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM gol_records WHERE global_seq <= ?")
            .bind(through as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query(
            r#"
            INSERT INTO gol_meta (key, value) VALUES ('trimmed_through', ?)
            ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)
            "#,
        )
        .bind(through as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if deleted > 0 {
            info!(through, deleted, "Reclaimed global log records");
            crate::metrics::record_gol_reclaimed(deleted);
        }
        self.report_capacity().await?;
        Ok(deleted)
    }

    async fn report_capacity(&self) -> Result<()> {
        let len = self.len().await?;
        crate::metrics::set_gol_length(len);
        if self.max_records > 0 && len > self.max_records {
            warn!(
                len,
                max_records = self.max_records,
                "Global log above capacity; a consumer is holding back retention"
            );
            crate::metrics::record_gol_over_capacity(len, self.max_records);
        }
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Checkpoint WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = checkpoint(&self.pool, "gol_checkpoint").await {
            warn!(error = %e, "Failed to checkpoint global log on close");
        }
        self.pool.close().await;
        info!("Global log closed");
    }
}

async fn read_trimmed_through(pool: &SqlitePool) -> Result<u64> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT value FROM gol_meta WHERE key = 'trimmed_through'")
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(v,)| v as u64).unwrap_or(0))
}

fn row_to_record(row: RecordRow) -> Result<OperationRecord> {
    let (global_seq, origin_id, origin_seq, op_kind, namespace, key, patch, ts, observed) = row;
    Ok(OperationRecord {
        global_seq: global_seq as u64,
        origin_id,
        origin_seq: origin_seq as u64,
        op_kind: op_kind.parse::<OpKind>()?,
        namespace: Namespace::new(namespace)?,
        document_key: DocumentKey(key),
        patch: serde_json::from_str(&patch)?,
        origin_timestamp: ts as u64,
        observed: serde_json::from_str(&observed)?,
    })
}
