// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Destination document store.
//!
//! One SQLite database per node holding:
//!
//! | Table | Content |
//! |-------|---------|
//! | `documents` | [`DocumentState`] per `(namespace, document_key)` as JSON |
//! | `local_oplog` | this node's local operation stream |
//! | `applier_positions` | replay checkpoint per destination |
//! | `conflicts` | the Conflicts Log ([`ConflictsLog`]) |
//! | `store_meta` | clock high-water mark, local stream trim point |
//!
//! # Two write paths
//!
//! ```text
//! client ──insert/update/delete──┐
//!                                ├─▶ write_lock ─▶ one transaction
//! Applier ──replay_batch─────────┘
//!
//! local write:  document + local_oplog entry            (re-enters the GOL)
//! replay:       documents + conflicts + checkpoint      (never re-enters)
//! ```
//!
//! Both paths serialize on the same lock, so a local write never interleaves
//! with a replay transaction. Replayed writes are tagged remote simply by not
//! going through `local_oplog`.
//!
//! # Resume safety
//!
//! The replay checkpoint commits in the same transaction as the batch
//! effects. After a crash the destination resumes from exactly what is on
//! disk; records at or below the checkpoint are skipped on re-delivery.

use crate::batch::ReplayReport;
use crate::clock::HybridClock;
use crate::conflict::{reconcile, Granularity, Outcome};
use crate::conflicts_log::ConflictsLog;
use crate::document::DocumentState;
use crate::error::{GlobalSyncError, Result};
use crate::record::{
    DocumentKey, Fields, LocalOperation, Namespace, OpKind, OperationRecord, Stamp,
};
use crate::source::{BoxFuture, OperationSource, SourceBatch};
use crate::sqlite::{checkpoint, execute_with_retry, open_pool};
use crate::topology::Topology;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

type OplogRow = (i64, String, String, String, String, i64, String);

/// SQLite-backed local collections of one node.
pub struct DocumentStore {
    origin_id: String,
    pool: SqlitePool,
    conflicts: ConflictsLog,
    clock: HybridClock,
    write_lock: Mutex<()>,
    /// Last `origin_seq` in `local_oplog`.
    oplog_tx: watch::Sender<u64>,
    path: String,
}

impl DocumentStore {
    /// Open (or create) the store for node `origin_id`.
    pub async fn open(origin_id: &str, path: &str, wal_mode: bool) -> Result<Self> {
        info!(origin_id, path = %path, "Opening document store");
        let pool = open_pool(path, wal_mode).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                namespace TEXT NOT NULL,
                document_key TEXT NOT NULL,
                state TEXT NOT NULL,
                live INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, document_key)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS local_oplog (
                origin_seq INTEGER PRIMARY KEY,
                op_kind TEXT NOT NULL,
                namespace TEXT NOT NULL,
                document_key TEXT NOT NULL,
                patch TEXT NOT NULL,
                origin_timestamp INTEGER NOT NULL,
                observed TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS applier_positions (
                destination_id TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS store_meta (key TEXT PRIMARY KEY, value INTEGER NOT NULL)",
        )
        .execute(&pool)
        .await?;

        let conflicts = ConflictsLog::open(pool.clone()).await?;

        let (max_seq,): (Option<i64>,) = sqlx::query_as("SELECT MAX(origin_seq) FROM local_oplog")
            .fetch_one(&pool)
            .await?;
        let trimmed = read_meta(&pool, "oplog_trimmed_through").await?;
        let last_seq = (max_seq.unwrap_or(0).max(0) as u64).max(trimmed);
        let clock = HybridClock::starting_at(read_meta(&pool, "clock").await?);

        if last_seq > 0 {
            info!(origin_id, last_seq, "Restored local operation stream");
        }

        let (oplog_tx, _) = watch::channel(last_seq);
        Ok(Self {
            origin_id: origin_id.to_string(),
            pool,
            conflicts,
            clock,
            write_lock: Mutex::new(()),
            oplog_tx,
            path: path.to_string(),
        })
    }

    /// Node identity stamped on local writes.
    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    pub fn conflicts(&self) -> &ConflictsLog {
        &self.conflicts
    }

    pub fn clock(&self) -> &HybridClock {
        &self.clock
    }

    // =========================================================================
    // Local write path
    // =========================================================================

    /// Insert a new document. Fails with `DuplicateKey` if it already exists.
    pub async fn insert(
        &self,
        namespace: &Namespace,
        key: &DocumentKey,
        document: Fields,
    ) -> Result<LocalOperation> {
        self.local_write(OpKind::Insert, namespace, key, document)
            .await?
            .ok_or_else(|| GlobalSyncError::Internal("insert produced no operation".into()))
    }

    /// Set fields on a document, creating it if absent.
    pub async fn update(
        &self,
        namespace: &Namespace,
        key: &DocumentKey,
        patch: Fields,
    ) -> Result<LocalOperation> {
        self.local_write(OpKind::Update, namespace, key, patch)
            .await?
            .ok_or_else(|| GlobalSyncError::Internal("update produced no operation".into()))
    }

    /// Delete a document. Deleting an absent document emits nothing.
    pub async fn delete(
        &self,
        namespace: &Namespace,
        key: &DocumentKey,
    ) -> Result<Option<LocalOperation>> {
        self.local_write(OpKind::Delete, namespace, key, Fields::new())
            .await
    }

    async fn local_write(
        &self,
        op_kind: OpKind,
        namespace: &Namespace,
        key: &DocumentKey,
        patch: Fields,
    ) -> Result<Option<LocalOperation>> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let state = load_state(&mut tx, namespace, key)
            .await?
            .unwrap_or_default();
        match op_kind {
            OpKind::Insert if state.is_live() => {
                return Err(GlobalSyncError::DuplicateKey {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                });
            }
            OpKind::Delete if !state.is_live() => {
                debug!(namespace = %namespace, document_key = %key, "Delete of absent document");
                return Ok(None);
            }
            _ => {}
        }

        let origin_seq = *self.oplog_tx.borrow() + 1;
        let op = LocalOperation {
            origin_seq,
            op_kind,
            namespace: namespace.clone(),
            document_key: key.clone(),
            patch,
            origin_timestamp: self.clock.tick(),
            observed: state.clock.clone(),
        };

        let record = OperationRecord::from_local(&self.origin_id, op.clone());
        let now = chrono::Utc::now().timestamp_millis();
        let next = reconcile(&state, &record, Granularity::Document, now).state;

        save_state(&mut tx, namespace, key, &next, now).await?;
        sqlx::query(
            r#"
            INSERT INTO local_oplog
                (origin_seq, op_kind, namespace, document_key, patch, origin_timestamp, observed)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(op.origin_seq as i64)
        .bind(op.op_kind.as_str())
        .bind(op.namespace.as_str())
        .bind(op.document_key.as_str())
        .bind(serde_json::to_string(&op.patch)?)
        .bind(op.origin_timestamp as i64)
        .bind(serde_json::to_string(&op.observed)?)
        .execute(&mut *tx)
        .await?;
        write_meta(&mut tx, "clock", self.clock.current()).await?;
        tx.commit().await?;

        self.oplog_tx.send_replace(origin_seq);
        crate::metrics::record_local_write(namespace.as_str(), op_kind.as_str());
        debug!(
            namespace = %namespace,
            document_key = %key,
            origin_seq,
            op = %op_kind,
            "Local write"
        );
        Ok(Some(op))
    }

    // =========================================================================
    // Replay path
    // =========================================================================

    /// Apply a batch of GOL records for `destination_id` in one transaction.
    ///
    /// Skips records at or below the stored checkpoint and records this node
    /// produced. Conflict Records and the new checkpoint commit together with
    /// the document changes.
    #[instrument(skip(self, records, topology), fields(destination_id = %destination_id, count = records.len()))]
    pub async fn replay_batch(
        &self,
        destination_id: &str,
        records: &[OperationRecord],
        topology: &Topology,
    ) -> Result<ReplayReport> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let checkpoint = read_position(&mut tx, destination_id).await?.unwrap_or(0);
        let mut report = ReplayReport {
            total: records.len(),
            last_position: checkpoint,
            ..Default::default()
        };

        for record in records {
            if record.global_seq <= report.last_position {
                report.skipped_replayed += 1;
                continue;
            }
            report.last_position = record.global_seq;

            if record.origin_id == self.origin_id {
                report.skipped_own += 1;
                continue;
            }

            self.clock.observe(record.origin_timestamp);
            let now = chrono::Utc::now().timestamp_millis();
            let state = load_state(&mut tx, &record.namespace, &record.document_key)
                .await?
                .unwrap_or_default();
            let granularity = topology.granularity(&record.namespace);
            let result = reconcile(&state, record, granularity, now);
            report.tally(result.outcome);

            if result.outcome != Outcome::AlreadyApplied {
                save_state(
                    &mut tx,
                    &record.namespace,
                    &record.document_key,
                    &result.state,
                    now,
                )
                .await?;
            }

            if let Some(mut conflict) = result.conflict {
                conflict.destination_id = destination_id.to_string();
                ConflictsLog::record_in(&mut tx, &conflict).await?;
                crate::metrics::record_conflict(
                    record.namespace.as_str(),
                    conflict.resolution.as_str(),
                );
                info!(
                    namespace = %record.namespace,
                    document_key = %record.document_key,
                    global_seq = record.global_seq,
                    origin_id = %record.origin_id,
                    resolution = %conflict.resolution,
                    "Conflict resolved"
                );
            }

            if let Some(anomaly) = result.anomaly {
                report.anomalies += 1;
                crate::metrics::record_anomaly(record.namespace.as_str());
                warn!(
                    namespace = %record.namespace,
                    document_key = %record.document_key,
                    global_seq = record.global_seq,
                    origin_id = %record.origin_id,
                    existing_fields = anomaly.existing.len(),
                    "{}",
                    anomaly.description
                );
            }
        }

        if report.last_position > checkpoint {
            write_position(&mut tx, destination_id, report.last_position).await?;
        }
        write_meta(&mut tx, "clock", self.clock.current()).await?;
        tx.commit().await?;

        debug!(
            applied = report.applied,
            conflicts = report.conflicts,
            skipped = report.skipped(),
            last_position = report.last_position,
            "Replay batch committed"
        );
        Ok(report)
    }

    /// Stored replay checkpoint for `destination_id`.
    pub async fn applier_position(&self, destination_id: &str) -> Result<Option<u64>> {
        let mut conn = self.pool.acquire().await?;
        read_position(&mut conn, destination_id).await
    }

    /// Overwrite the checkpoint (operator resync).
    pub async fn set_applier_position(&self, destination_id: &str, position: u64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut conn = self.pool.acquire().await?;
        write_position(&mut conn, destination_id, position).await?;
        info!(destination_id, position, "Applier checkpoint rewritten");
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Visible content, `None` if the document does not exist.
    pub async fn get(&self, namespace: &Namespace, key: &DocumentKey) -> Result<Option<Fields>> {
        Ok(self
            .state(namespace, key)
            .await?
            .and_then(|state| state.content()))
    }

    /// Full replicated state including markers and tombstones.
    pub async fn state(
        &self,
        namespace: &Namespace,
        key: &DocumentKey,
    ) -> Result<Option<DocumentState>> {
        let mut conn = self.pool.acquire().await?;
        load_state(&mut conn, namespace, key).await
    }

    /// Document-granularity version marker.
    pub async fn version_marker(
        &self,
        namespace: &Namespace,
        key: &DocumentKey,
    ) -> Result<Option<Stamp>> {
        Ok(self
            .state(namespace, key)
            .await?
            .and_then(|state| state.version_marker()))
    }

    /// Live documents of a collection, ordered by key.
    pub async fn list(&self, namespace: &Namespace) -> Result<Vec<(DocumentKey, Fields)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT document_key, state FROM documents
            WHERE namespace = ? AND live = 1
            ORDER BY document_key
            "#,
        )
        .bind(namespace.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for (key, state) in rows {
            let state: DocumentState = serde_json::from_str(&state)?;
            if let Some(content) = state.content() {
                out.push((DocumentKey(key), content));
            }
        }
        Ok(out)
    }

    pub async fn count(&self, namespace: &Namespace) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM documents WHERE namespace = ? AND live = 1")
                .bind(namespace.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    // =========================================================================
    // Local operation stream
    // =========================================================================

    /// Last `origin_seq` written locally.
    pub fn local_head(&self) -> u64 {
        *self.oplog_tx.borrow()
    }

    /// Read local operations after `after` without waiting.
    pub async fn read_local(&self, after: u64, limit: usize) -> Result<SourceBatch> {
        let mut tx = self.pool.begin().await?;
        let trimmed: Option<(i64,)> =
            sqlx::query_as("SELECT value FROM store_meta WHERE key = 'oplog_trimmed_through'")
                .fetch_optional(&mut *tx)
                .await?;
        let trimmed = trimmed.map(|(v,)| v.max(0) as u64).unwrap_or(0);
        if after < trimmed {
            return Ok(SourceBatch::Trimmed {
                requested: after,
                oldest: trimmed + 1,
            });
        }

        let rows: Vec<OplogRow> = sqlx::query_as(
            r#"
            SELECT origin_seq, op_kind, namespace, document_key, patch, origin_timestamp, observed
            FROM local_oplog
            WHERE origin_seq > ?
            ORDER BY origin_seq
            LIMIT ?
            "#,
        )
        .bind(after as i64)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let ops = rows
            .into_iter()
            .map(row_to_operation)
            .collect::<Result<Vec<_>>>()?;
        Ok(SourceBatch::Operations(ops))
    }

    async fn fetch_local(&self, after: u64, limit: usize, block: Duration) -> Result<SourceBatch> {
        if self.local_head() <= after && !block.is_zero() {
            // Timing out just means nothing new arrived.
            let _ = tokio::time::timeout(block, self.wait_for_local(after)).await;
        }
        self.read_local(after, limit).await
    }

    async fn wait_for_local(&self, after: u64) {
        let mut rx = self.oplog_tx.subscribe();
        let _ = rx.wait_for(|head| *head > after).await;
    }

    /// Drop local operations up to and including `through`.
    ///
    /// Models upstream retention: a Tailer still behind `through` sees a
    /// trimmed stream.
    pub async fn trim_local_oplog(&self, through: u64) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM local_oplog WHERE origin_seq <= ?")
            .bind(through as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query(
            r#"
            INSERT INTO store_meta (key, value) VALUES ('oplog_trimmed_through', ?)
            ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)
            "#,
        )
        .bind(through as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(origin_id = %self.origin_id, through, deleted, "Trimmed local operation stream");
        Ok(deleted)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Checkpoint WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = checkpoint(&self.pool, "store_checkpoint").await {
            warn!(error = %e, "Failed to checkpoint document store on close");
        }
        self.pool.close().await;
        info!("Document store closed");
    }
}

impl OperationSource for DocumentStore {
    fn origin_id(&self) -> &str {
        &self.origin_id
    }

    fn fetch(&self, after: u64, limit: usize, block: Duration) -> BoxFuture<'_, SourceBatch> {
        Box::pin(self.fetch_local(after, limit, block))
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("origin_id", &self.origin_id)
            .field("path", &self.path)
            .finish()
    }
}

async fn load_state(
    conn: &mut SqliteConnection,
    namespace: &Namespace,
    key: &DocumentKey,
) -> Result<Option<DocumentState>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT state FROM documents WHERE namespace = ? AND document_key = ?")
            .bind(namespace.as_str())
            .bind(key.as_str())
            .fetch_optional(&mut *conn)
            .await?;
    row.map(|(state,)| Ok(serde_json::from_str(&state)?))
        .transpose()
}

async fn save_state(
    conn: &mut SqliteConnection,
    namespace: &Namespace,
    key: &DocumentKey,
    state: &DocumentState,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO documents (namespace, document_key, state, live, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(namespace, document_key) DO UPDATE SET
            state = excluded.state,
            live = excluded.live,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(namespace.as_str())
    .bind(key.as_str())
    .bind(serde_json::to_string(state)?)
    .bind(state.is_live() as i64)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn read_position(conn: &mut SqliteConnection, destination_id: &str) -> Result<Option<u64>> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT position FROM applier_positions WHERE destination_id = ?")
            .bind(destination_id)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(row.map(|(p,)| p.max(0) as u64))
}

async fn write_position(
    conn: &mut SqliteConnection,
    destination_id: &str,
    position: u64,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp_millis();
    sqlx::query(
        r#"
        INSERT INTO applier_positions (destination_id, position, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(destination_id) DO UPDATE SET
            position = excluded.position,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(destination_id)
    .bind(position as i64)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn read_meta(pool: &SqlitePool, key: &str) -> Result<u64> {
    let row: Option<(i64,)> = execute_with_retry("store_read_meta", || async {
        sqlx::query_as("SELECT value FROM store_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await
    })
    .await?;
    Ok(row.map(|(v,)| v.max(0) as u64).unwrap_or(0))
}

async fn write_meta(conn: &mut SqliteConnection, key: &str, value: u64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO store_meta (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)
        "#,
    )
    .bind(key)
    .bind(i64::try_from(value).unwrap_or(i64::MAX))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn row_to_operation(row: OplogRow) -> Result<LocalOperation> {
    let (origin_seq, op_kind, namespace, key, patch, ts, observed) = row;
    Ok(LocalOperation {
        origin_seq: origin_seq as u64,
        op_kind: op_kind.parse::<OpKind>()?,
        namespace: Namespace::new(namespace)?,
        document_key: DocumentKey(key),
        patch: serde_json::from_str(&patch)?,
        origin_timestamp: ts as u64,
        observed: serde_json::from_str(&observed)?,
    })
}
