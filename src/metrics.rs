//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Source tailing (reads, appends, duplicates, gaps)
//! - The global log (head, length, retention)
//! - Replay (applied, skipped, conflicts, anomalies, lag)
//! - Circuit breakers and link state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `global_sync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use global_sync::metrics;
//! use std::time::Duration;
//!
//! metrics::record_source_read("rs-a", 42, Duration::from_millis(3));
//! metrics::record_conflict("shop.orders", "incoming_wins");
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Source Tailer
// =============================================================================

/// Record one fetch from an origin's operation stream.
pub fn record_source_read(origin_id: &str, count: usize, duration: Duration) {
    counter!("global_sync_source_reads_total", "origin_id" => origin_id.to_string()).increment(1);
    if count > 0 {
        counter!("global_sync_records_read_total", "origin_id" => origin_id.to_string())
            .increment(count as u64);
    }
    histogram!("global_sync_source_read_duration_seconds", "origin_id" => origin_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record the outcome of one tailed batch.
pub fn record_tailer_batch(
    origin_id: &str,
    appended: usize,
    duplicates: usize,
    filtered: usize,
    duration: Duration,
) {
    let origin = origin_id.to_string();
    counter!("global_sync_records_appended_total", "origin_id" => origin.clone())
        .increment(appended as u64);
    if duplicates > 0 {
        counter!("global_sync_records_duplicate_total", "origin_id" => origin.clone())
            .increment(duplicates as u64);
    }
    if filtered > 0 {
        counter!("global_sync_records_filtered_total", "origin_id" => origin.clone())
            .increment(filtered as u64);
    }
    histogram!("global_sync_tailer_batch_duration_seconds", "origin_id" => origin)
        .record(duration.as_secs_f64());
}

pub fn set_tailer_position(origin_id: &str, origin_seq: u64) {
    gauge!("global_sync_tailer_position", "origin_id" => origin_id.to_string())
        .set(origin_seq as f64);
}

/// The origin no longer holds operations the Tailer still needs.
pub fn record_sequence_gap(origin_id: &str) {
    counter!("global_sync_sequence_gaps_total", "origin_id" => origin_id.to_string()).increment(1);
}

/// Record cursor persistence.
pub fn record_cursor_commit(origin_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("global_sync_cursor_commits_total", "origin_id" => origin_id.to_string(), "status" => status).increment(1);
}

// =============================================================================
// Global Operation Log
// =============================================================================

/// Outcome is `appended` or `duplicate`.
pub fn record_gol_append(origin_id: &str, outcome: &str) {
    counter!(
        "global_sync_gol_appends_total",
        "origin_id" => origin_id.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn set_gol_head(global_seq: u64) {
    gauge!("global_sync_gol_head").set(global_seq as f64);
}

pub fn set_gol_length(len: u64) {
    gauge!("global_sync_gol_length").set(len as f64);
}

pub fn record_gol_reclaimed(count: u64) {
    counter!("global_sync_gol_reclaimed_total").increment(count);
}

/// The log holds more than its soft capacity because a consumer lags.
pub fn record_gol_over_capacity(len: u64, max_records: u64) {
    counter!("global_sync_gol_over_capacity_total").increment(1);
    gauge!("global_sync_gol_overflow_records").set(len.saturating_sub(max_records) as f64);
}

// =============================================================================
// Global Applier
// =============================================================================

/// Record one replay transaction.
pub fn record_replay_batch(
    destination_id: &str,
    total: usize,
    applied: usize,
    skipped: usize,
    conflicts: usize,
    duration: Duration,
) {
    let dest = destination_id.to_string();

    counter!("global_sync_replay_records_total", "destination_id" => dest.clone())
        .increment(total as u64);
    counter!("global_sync_records_applied_total", "destination_id" => dest.clone())
        .increment(applied as u64);
    if skipped > 0 {
        counter!("global_sync_records_skipped_total", "destination_id" => dest.clone())
            .increment(skipped as u64);
    }
    if conflicts > 0 {
        counter!("global_sync_replay_conflicts_total", "destination_id" => dest.clone())
            .increment(conflicts as u64);
    }

    histogram!("global_sync_replay_batch_duration_seconds", "destination_id" => dest.clone())
        .record(duration.as_secs_f64());
    histogram!("global_sync_replay_batch_size", "destination_id" => dest).record(total as f64);
}

pub fn record_conflict(namespace: &str, resolution: &str) {
    counter!(
        "global_sync_conflicts_total",
        "namespace" => namespace.to_string(),
        "resolution" => resolution.to_string()
    )
    .increment(1);
}

pub fn record_anomaly(namespace: &str) {
    counter!("global_sync_anomalies_total", "namespace" => namespace.to_string()).increment(1);
}

pub fn set_applier_position(destination_id: &str, position: u64) {
    gauge!("global_sync_applier_position", "destination_id" => destination_id.to_string())
        .set(position as f64);
}

/// Records between the GOL head and the destination's position.
pub fn set_applier_lag(destination_id: &str, lag_records: u64) {
    gauge!("global_sync_applier_lag_records", "destination_id" => destination_id.to_string())
        .set(lag_records as f64);
}

// =============================================================================
// Local writes
// =============================================================================

pub fn record_local_write(namespace: &str, op: &str) {
    counter!(
        "global_sync_local_writes_total",
        "namespace" => namespace.to_string(),
        "op" => op.to_string()
    )
    .increment(1);
}

// =============================================================================
// Persistence
// =============================================================================

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn sqlite_retries_total(operation: &str) {
    counter!("global_sync_sqlite_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Outcome is `success`, `failure` or `rejected`.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "global_sync_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// =============================================================================
// Node and links
// =============================================================================

/// Gauge for node state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("global_sync_engine_state").set(value);
}

/// 0=running, 1=stopped, 2=failed.
pub fn set_link_state(link: &str, state: &str) {
    let value = match state {
        "running" => 0.0,
        "stopped" => 1.0,
        "failed" => 2.0,
        _ => -1.0,
    };
    gauge!("global_sync_link_state", "link" => link.to_string()).set(value);
}

/// Record an error seen by a link worker.
pub fn record_link_error(link: &str, error_type: &str) {
    counter!(
        "global_sync_link_errors_total",
        "link" => link.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

// =============================================================================
// SLO Violation Metrics
// =============================================================================

/// `slo_type` is one of `source_read`, `batch_apply`, `apply_lag`.
pub fn record_slo_violation(link: &str, slo_type: &str, value: u64) {
    counter!(
        "global_sync_slo_violations_total",
        "link" => link.to_string(),
        "slo_type" => slo_type.to_string()
    )
    .increment(1);

    histogram!(
        "global_sync_slo_violation_value",
        "link" => link.to_string(),
        "slo_type" => slo_type.to_string()
    )
    .record(value as f64);
}
