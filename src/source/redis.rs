// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote origin operation stream on Redis.
//!
//! A remote origin publishes its local operations to a Redis stream
//! (`{prefix}global_sync:{origin_id}:oplog`). Entry ids encode the origin
//! sequence as `0-{origin_seq}`, so the stream order is the origin order and
//! an exclusive range start resumes exactly after a cursor.
//!
//! # Entry layout
//!
//! | Field | Content |
//! |-------|---------|
//! | `seq` | origin sequence |
//! | `op` | `insert` / `update` / `delete` |
//! | `ns` | `<db>.<collection>` |
//! | `key` | document key |
//! | `patch` | JSON object, zstd-compressed above 1 KiB |
//! | `hash` | SHA-256 of the canonical patch JSON |
//! | `ts` | origin timestamp |
//! | `observed` | JSON version vector |
//!
//! # Stream Trimming
//!
//! Redis streams are trimmed with `MAXLEN`/`MINID`. When the oldest retained
//! entry is past `after + 1` the operations in between are gone and the fetch
//! returns [`SourceBatch::Trimmed`]. The Tailer treats that as a gap.
//!
//! # Content Hash Validation
//!
//! Every entry's patch is re-hashed after decompression. A mismatch is a
//! [`GlobalSyncError::RecordParse`]; the entry is never skipped, because a
//! skipped entry would be a hole in the origin's sequence.

use super::{BoxFuture, OperationSource, SourceBatch};
use crate::config::{SourceConfig, SourceKind};
use crate::error::{GlobalSyncError, Result};
use crate::record::{
    compute_patch_hash, DocumentKey, Fields, LocalOperation, Namespace, OpKind, VectorTime,
    MAX_ORIGIN_TIMESTAMP,
};
use crate::resilience::RetryConfig;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::io::Read;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// zstd magic bytes for decompression detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Patches larger than this are compressed on publish.
const COMPRESS_THRESHOLD: usize = 1024;

const ZSTD_LEVEL: i32 = 3;

type RawEntry = (String, HashMap<String, redis::Value>);

/// One remote origin's operation stream.
///
/// Connects lazily on the first fetch. `ConnectionManager` reconnects on its
/// own after a dropped connection; failures surface as retryable errors.
pub struct RedisSource {
    origin_id: String,
    redis_url: String,
    stream_key: String,
    retry: RetryConfig,
    conn: RwLock<Option<ConnectionManager>>,
    connected: AtomicBool,
}

impl RedisSource {
    pub fn new(
        origin_id: impl Into<String>,
        redis_url: impl Into<String>,
        stream_key: impl Into<String>,
    ) -> Self {
        Self {
            origin_id: origin_id.into(),
            redis_url: redis_url.into(),
            stream_key: stream_key.into(),
            retry: RetryConfig::startup(),
            conn: RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Build from a `SourceKind::Redis` config entry.
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        match (&config.kind, config.stream_key()) {
            (SourceKind::Redis { redis_url, .. }, Some(stream_key)) => {
                Ok(Self::new(&config.origin_id, redis_url, stream_key))
            }
            _ => Err(GlobalSyncError::Config(format!(
                "source '{}' is not a Redis source",
                config.origin_id
            ))),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Connect with retry. Used at node start; fetches connect lazily.
    pub async fn connect(&self) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.open_connection().await {
                Ok(conn) => {
                    *self.conn.write().await = Some(conn);
                    self.connected.store(true, Ordering::Release);
                    info!(origin_id = %self.origin_id, attempt, "Connected to origin stream");
                    return Ok(());
                }
                Err(e) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        origin_id = %self.origin_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn open_connection(&self) -> Result<ConnectionManager> {
        let client =
            Client::open(self.redis_url.as_str()).map_err(|e| GlobalSyncError::SourceConnection {
                origin_id: self.origin_id.clone(),
                message: format!("Invalid Redis URL: {}", e),
            })?;

        match timeout(self.retry.connection_timeout, client.get_connection_manager()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(GlobalSyncError::SourceConnection {
                origin_id: self.origin_id.clone(),
                message: e.to_string(),
            }),
            Err(_) => Err(GlobalSyncError::SourceConnection {
                origin_id: self.origin_id.clone(),
                message: format!(
                    "connection timed out after {}ms",
                    self.retry.connection_timeout.as_millis()
                ),
            }),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        if let Some(conn) = self.conn.read().await.clone() {
            return Ok(conn);
        }
        let conn = self.open_connection().await?;
        *self.conn.write().await = Some(conn.clone());
        self.connected.store(true, Ordering::Release);
        debug!(origin_id = %self.origin_id, "Lazily connected to origin stream");
        Ok(conn)
    }

    /// Publish one operation. Entry ids are explicit, so publishing the same
    /// sequence twice is rejected by Redis.
    pub async fn publish(&self, op: &LocalOperation) -> Result<()> {
        let mut conn = self.connection().await?;
        let fields = encode_entry(op)?;
        let _: String = conn
            .xadd(&self.stream_key, stream_id_for(op.origin_seq), &fields)
            .await
            .map_err(|e| GlobalSyncError::redis("XADD", e))?;
        Ok(())
    }

    /// Trim the stream so it starts at `origin_seq`.
    pub async fn trim_before(&self, origin_seq: u64) -> Result<u64> {
        let mut conn = self.connection().await?;
        let removed: u64 = redis::cmd("XTRIM")
            .arg(&self.stream_key)
            .arg("MINID")
            .arg(stream_id_for(origin_seq))
            .query_async(&mut conn)
            .await
            .map_err(|e| GlobalSyncError::redis("XTRIM", e))?;
        Ok(removed)
    }

    async fn oldest_seq(&self, conn: &mut ConnectionManager) -> Result<Option<u64>> {
        let result: Vec<RawEntry> = redis::cmd("XRANGE")
            .arg(&self.stream_key)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| GlobalSyncError::redis("XRANGE", e))?;

        result
            .first()
            .map(|(id, _)| seq_from_stream_id(id))
            .transpose()
    }

    async fn fetch_inner(&self, after: u64, limit: usize, block: Duration) -> Result<SourceBatch> {
        let mut conn = self.connection().await?;
        let result = self.fetch_with(&mut conn, after, limit, block).await;
        self.connected.store(result.is_ok(), Ordering::Release);
        result
    }

    async fn fetch_with(
        &self,
        conn: &mut ConnectionManager,
        after: u64,
        limit: usize,
        block: Duration,
    ) -> Result<SourceBatch> {
        if let Some(oldest) = self.oldest_seq(conn).await? {
            if oldest > after + 1 {
                warn!(
                    origin_id = %self.origin_id,
                    after,
                    oldest,
                    "Origin stream was trimmed past the tailer position"
                );
                return Ok(SourceBatch::Trimmed {
                    requested: after,
                    oldest,
                });
            }
        }

        // Catch-up: non-blocking XRANGE with an exclusive start.
        let entries: Vec<RawEntry> = redis::cmd("XRANGE")
            .arg(&self.stream_key)
            .arg(format!("({}", stream_id_for(after)))
            .arg("+")
            .arg("COUNT")
            .arg(limit)
            .query_async(conn)
            .await
            .map_err(|e| GlobalSyncError::redis("XRANGE", e))?;

        if !entries.is_empty() || block.is_zero() {
            return self.parse_entries(entries);
        }

        // Caught up: XREAD BLOCK timeout COUNT limit STREAMS key cursor
        let opts = StreamReadOptions::default()
            .block(block.as_millis().max(1) as usize)
            .count(limit);
        let reply: StreamReadReply = conn
            .xread_options(&[&self.stream_key], &[stream_id_for(after)], &opts)
            .await
            .map_err(|e| GlobalSyncError::redis("XREAD", e))?;

        let entries = reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|entry| (entry.id, entry.map))
            .collect();
        self.parse_entries(entries)
    }

    fn parse_entries(&self, entries: Vec<RawEntry>) -> Result<SourceBatch> {
        let mut ops = Vec::with_capacity(entries.len());
        for (id, fields) in entries {
            let op = parse_entry(&id, &fields)?;
            trace!(
                origin_id = %self.origin_id,
                stream_id = %id,
                origin_seq = op.origin_seq,
                "Parsed operation entry"
            );
            ops.push(op);
        }
        Ok(SourceBatch::Operations(ops))
    }
}

impl OperationSource for RedisSource {
    fn origin_id(&self) -> &str {
        &self.origin_id
    }

    fn fetch(&self, after: u64, limit: usize, block: Duration) -> BoxFuture<'_, SourceBatch> {
        Box::pin(self.fetch_inner(after, limit, block))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RedisSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSource")
            .field("origin_id", &self.origin_id)
            .field("stream_key", &self.stream_key)
            .finish()
    }
}

/// `0-{origin_seq}`
pub fn stream_id_for(origin_seq: u64) -> String {
    format!("0-{}", origin_seq)
}

/// Origin sequence carried in a stream id.
pub fn seq_from_stream_id(id: &str) -> Result<u64> {
    id.split_once('-')
        .and_then(|(_, seq)| seq.parse().ok())
        .ok_or_else(|| GlobalSyncError::RecordParse(format!("Malformed stream id: {}", id)))
}

/// Encode an operation as stream entry fields.
pub fn encode_entry(op: &LocalOperation) -> Result<Vec<(&'static str, Vec<u8>)>> {
    let patch_json = serde_json::to_vec(&op.patch)?;
    let patch = if patch_json.len() > COMPRESS_THRESHOLD {
        zstd::encode_all(&patch_json[..], ZSTD_LEVEL)
            .map_err(|e| GlobalSyncError::Internal(format!("zstd encode: {}", e)))?
    } else {
        patch_json
    };

    Ok(vec![
        ("seq", op.origin_seq.to_string().into_bytes()),
        ("op", op.op_kind.as_str().as_bytes().to_vec()),
        ("ns", op.namespace.as_str().as_bytes().to_vec()),
        ("key", op.document_key.as_str().as_bytes().to_vec()),
        ("patch", patch),
        ("hash", compute_patch_hash(&op.patch).into_bytes()),
        ("ts", op.origin_timestamp.to_string().into_bytes()),
        ("observed", serde_json::to_vec(&op.observed)?),
    ])
}

/// Parse one stream entry.
pub fn parse_entry(stream_id: &str, fields: &HashMap<String, redis::Value>) -> Result<LocalOperation> {
    let origin_seq: u64 = parse_number(fields, "seq")?;
    let id_seq = seq_from_stream_id(stream_id)?;
    if id_seq != origin_seq {
        return Err(GlobalSyncError::RecordParse(format!(
            "Entry {} carries seq {}",
            stream_id, origin_seq
        )));
    }

    let op_kind = OpKind::from_str(&get_string_field(fields, "op")?)?;
    let namespace = Namespace::new(get_string_field(fields, "ns")?)?;
    let document_key = DocumentKey(get_string_field(fields, "key")?);

    let raw_patch = get_bytes_field(fields, "patch")?;
    let patch: Fields = serde_json::from_slice(&maybe_decompress(&raw_patch)?)
        .map_err(|e| GlobalSyncError::RecordParse(format!("Invalid patch in {}: {}", stream_id, e)))?;

    if let Ok(expected) = get_string_field(fields, "hash") {
        let computed = compute_patch_hash(&patch);
        if computed != expected {
            return Err(GlobalSyncError::RecordParse(format!(
                "Content hash mismatch for {} '{}': expected {}, got {}",
                namespace, document_key, expected, computed
            )));
        }
    }

    let origin_timestamp: u64 = parse_number(fields, "ts")?;
    if origin_timestamp > MAX_ORIGIN_TIMESTAMP {
        return Err(GlobalSyncError::RecordParse(format!(
            "Timestamp {} in {} out of range",
            origin_timestamp, stream_id
        )));
    }
    let observed = match get_bytes_field(fields, "observed") {
        Ok(bytes) => serde_json::from_slice::<VectorTime>(&bytes).map_err(|e| {
            GlobalSyncError::RecordParse(format!("Invalid observed in {}: {}", stream_id, e))
        })?,
        Err(_) => VectorTime::new(),
    };

    Ok(LocalOperation {
        origin_seq,
        op_kind,
        namespace,
        document_key,
        patch,
        origin_timestamp,
        observed,
    })
}

fn parse_number(fields: &HashMap<String, redis::Value>, name: &str) -> Result<u64> {
    let raw = get_string_field(fields, name)?;
    raw.parse()
        .map_err(|_| GlobalSyncError::RecordParse(format!("Invalid {}: {}", name, raw)))
}

/// Extract a string field from a stream entry.
fn get_string_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<String> {
    let value = fields
        .get(name)
        .ok_or_else(|| GlobalSyncError::RecordParse(format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone())
            .map_err(|e| GlobalSyncError::RecordParse(format!("Invalid UTF-8 in {}: {}", name, e))),
        redis::Value::SimpleString(s) => Ok(s.clone()),
        _ => Err(GlobalSyncError::RecordParse(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}

/// Extract a bytes field from a stream entry.
fn get_bytes_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<Vec<u8>> {
    let value = fields
        .get(name)
        .ok_or_else(|| GlobalSyncError::RecordParse(format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => Ok(bytes.clone()),
        redis::Value::SimpleString(s) => Ok(s.as_bytes().to_vec()),
        _ => Err(GlobalSyncError::RecordParse(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| GlobalSyncError::Decompression(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| GlobalSyncError::Decompression(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}
