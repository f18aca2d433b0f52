//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Capture throughput and feed resubscribes
//! - Replay outcomes per operation type
//! - Checkpoint persistence
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `migration_` and labelled with the
//! `namespace` (`db.coll`) they belong to:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track durations
//!
//! No exporter is installed by this crate. Without a recorder the macros are
//! no-ops; an embedding binary can install one (e.g. a Prometheus exporter).
//!
//! # Usage
//!
//! ```rust,no_run
//! use changestream_migration::event::Namespace;
//! use changestream_migration::metrics;
//! use std::time::Duration;
//!
//! let ns = Namespace::new("shop", "orders");
//! metrics::record_event_captured(&ns, "insert", 1_700_000_000_000_000);
//! metrics::record_apply(&ns, "insert", Duration::from_millis(3));
//! ```

use crate::event::Namespace;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record an event appended to the staging log.
pub fn record_event_captured(namespace: &Namespace, op: &str, sequence: i64) {
    counter!(
        "migration_events_captured_total",
        "namespace" => namespace.to_string(),
        "op" => op.to_string()
    )
    .increment(1);
    gauge!("migration_last_sequence", "namespace" => namespace.to_string()).set(sequence as f64);
}

/// Record a feed event that was not staged (unrecognized operation).
pub fn record_event_skipped(namespace: &Namespace, op: &str) {
    counter!(
        "migration_events_skipped_total",
        "namespace" => namespace.to_string(),
        "op" => op.to_string()
    )
    .increment(1);
}

/// Record staging append latency.
pub fn record_append_latency(namespace: &Namespace, duration: Duration) {
    histogram!("migration_append_duration_seconds", "namespace" => namespace.to_string())
        .record(duration.as_secs_f64());
}

/// Record a retried store operation during capture.
pub fn record_capture_retry(namespace: &Namespace, operation: &str) {
    counter!(
        "migration_capture_retries_total",
        "namespace" => namespace.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a resubscribe of the change feed after a transient failure.
pub fn record_feed_resubscribe(namespace: &Namespace) {
    counter!("migration_feed_resubscribes_total", "namespace" => namespace.to_string())
        .increment(1);
}

/// Record checkpoint persistence.
pub fn record_checkpoint_save(namespace: &Namespace, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "migration_checkpoint_saves_total",
        "namespace" => namespace.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a staged record applied to the destination.
pub fn record_apply(namespace: &Namespace, op: &str, duration: Duration) {
    counter!(
        "migration_records_applied_total",
        "namespace" => namespace.to_string(),
        "op" => op.to_string()
    )
    .increment(1);
    histogram!("migration_apply_duration_seconds", "namespace" => namespace.to_string())
        .record(duration.as_secs_f64());
}

/// Record a staged record set aside as an exception.
///
/// `reason` should be a short category (`duplicate_key`, `unrecognized_op`,
/// `missing_document`), not the free-text reason stored on the record.
pub fn record_exception(namespace: &Namespace, reason: &str) {
    counter!(
        "migration_records_exception_total",
        "namespace" => namespace.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Set the number of records still pending for a namespace.
pub fn set_replay_backlog(namespace: &Namespace, pending: u64) {
    gauge!("migration_replay_backlog", "namespace" => namespace.to_string()).set(pending as f64);
}
