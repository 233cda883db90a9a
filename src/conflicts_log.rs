//! Conflicts Log: append-only audit trail of detected collisions.
//!
//! Every detected collision produces exactly one [`ConflictRecord`], even when
//! the resolution merged without visible loss. Records are partitioned by the
//! sibling conflicts namespace of the collection (`"<db>.<coll>.conflicts"`)
//! and are never updated or deleted here; retention belongs to the operator.
//!
//! The table lives in the destination store's database so a replay batch can
//! write its conflicts in the same transaction as its effects
//! ([`ConflictsLog::record_in`]).

use crate::conflict::Resolution;
use crate::error::Result;
use crate::record::{DocumentKey, Fields, Namespace, OperationRecord, Stamp};
use crate::sqlite::execute_with_retry;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use std::fmt;
use tracing::{debug, info};

/// Per-side outcome of a collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    /// Local version that the incoming write replaced.
    OldReplaced,
    /// Incoming version that took effect.
    New,
    /// Local version that was kept.
    Old,
    /// Incoming version that lost.
    NewIgnored,
    /// Both sides contributed.
    Merged,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::OldReplaced => "old_replaced",
            ConflictStatus::New => "new",
            ConflictStatus::Old => "old",
            ConflictStatus::NewIgnored => "new_ignored",
            ConflictStatus::Merged => "merged",
        }
    }
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detected collision. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub namespace: Namespace,
    pub document_key: DocumentKey,
    /// Visible content before the incoming record; `None` if absent.
    pub local_version: Option<Fields>,
    pub local_marker: Option<Stamp>,
    /// The incoming record, verbatim.
    pub incoming_version: OperationRecord,
    pub resolution: Resolution,
    pub local_status: ConflictStatus,
    pub incoming_status: ConflictStatus,
    /// Local values overwritten or removed by the incoming record.
    pub discarded_local: Fields,
    /// Incoming values that lost the tie-break.
    pub discarded_incoming: Fields,
    /// Epoch millis at the destination.
    pub detected_at: i64,
    pub destination_id: String,
}

impl ConflictRecord {
    pub fn conflicts_namespace(&self) -> String {
        self.namespace.conflicts()
    }
}

const CREATE_CONFLICTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS conflicts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conflicts_ns TEXT NOT NULL,
        destination_id TEXT NOT NULL,
        document_key TEXT NOT NULL,
        global_seq INTEGER NOT NULL,
        resolution TEXT NOT NULL,
        detected_at INTEGER NOT NULL,
        body TEXT NOT NULL
    )
"#;

const CREATE_CONFLICTS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS conflicts_by_ns ON conflicts (conflicts_ns, id)";

/// Reader and writer over the `conflicts` table.
#[derive(Clone)]
pub struct ConflictsLog {
    pool: SqlitePool,
}

impl ConflictsLog {
    /// Attach to `pool`, creating the table if needed.
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        sqlx::query(CREATE_CONFLICTS_TABLE).execute(&pool).await?;
        sqlx::query(CREATE_CONFLICTS_INDEX).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Append one conflict on its own.
    pub async fn record(&self, conflict: &ConflictRecord) -> Result<()> {
        let body = serde_json::to_string(conflict)?;
        let pool = &self.pool;
        execute_with_retry("conflicts_record", || async {
            insert_query(conflict, &body).execute(pool).await
        })
        .await?;
        info!(
            namespace = %conflict.namespace,
            document_key = %conflict.document_key,
            resolution = %conflict.resolution,
            "Conflict recorded"
        );
        Ok(())
    }

    /// Append one conflict inside a caller's transaction.
    pub async fn record_in(conn: &mut SqliteConnection, conflict: &ConflictRecord) -> Result<()> {
        let body = serde_json::to_string(conflict)?;
        insert_query(conflict, &body).execute(&mut *conn).await?;
        debug!(
            namespace = %conflict.namespace,
            document_key = %conflict.document_key,
            resolution = %conflict.resolution,
            "Conflict recorded in batch"
        );
        Ok(())
    }

    /// All conflicts for a collection, oldest first.
    pub async fn list(&self, namespace: &Namespace) -> Result<Vec<ConflictRecord>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT body FROM conflicts WHERE conflicts_ns = ? ORDER BY id")
                .bind(namespace.conflicts())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(body,)| Ok(serde_json::from_str(&body)?))
            .collect()
    }

    pub async fn count(&self, namespace: &Namespace) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM conflicts WHERE conflicts_ns = ?")
                .bind(namespace.conflicts())
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn count_all(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM conflicts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

fn insert_query<'q>(
    conflict: &'q ConflictRecord,
    body: &'q str,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    sqlx::query(
        r#"
        INSERT INTO conflicts
            (conflicts_ns, destination_id, document_key, global_seq, resolution, detected_at, body)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(conflict.conflicts_namespace())
    .bind(conflict.destination_id.as_str())
    .bind(conflict.document_key.as_str())
    .bind(conflict.incoming_version.global_seq as i64)
    .bind(conflict.resolution.as_str())
    .bind(conflict.detected_at)
    .bind(body)
}
