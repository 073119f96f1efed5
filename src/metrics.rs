// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the offline sync engine.
//!
//! Uses the `metrics` crate for backend-agnostic collection. The host
//! application installs the exporter.
//!
//! # Metric Naming Convention
//! - `offline_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `kind`: insert, update, delete
//! - `outcome`: queued, collapsed, cancelled, success, error
//! - `status`: a push status (Complete, CancelledByNetworkError, ...)
//! - `action`: push, pull, purge

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a local mutation reaching the queue
pub fn record_enqueue(kind: &str, outcome: &str) {
    counter!(
        "offline_sync_operations_enqueued_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set the number of queued operations
pub fn set_pending_operations(count: i64) {
    gauge!("offline_sync_pending_operations").set(count as f64);
}

/// Record the terminal status of a push
pub fn record_push(status: &str) {
    counter!("offline_sync_push_total", "status" => status.to_string()).increment(1);
}

/// Record one replayed operation
pub fn record_pushed_item(table: &str, outcome: &str) {
    counter!(
        "offline_sync_pushed_items_total",
        "table" => table.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record one item applied by a pull (`upsert` or `delete`)
pub fn record_pulled_item(table: &str, action: &str) {
    counter!(
        "offline_sync_pulled_items_total",
        "table" => table.to_string(),
        "action" => action.to_string()
    )
    .increment(1);
}

/// Record a purge and the rows it removed
pub fn record_purge(table: &str, rows: u64, discarded_operations: u64) {
    counter!("offline_sync_purges_total", "table" => table.to_string()).increment(1);
    histogram!("offline_sync_purged_rows").record(rows as f64);
    if discarded_operations > 0 {
        counter!("offline_sync_discarded_operations_total", "table" => table.to_string())
            .increment(discarded_operations);
    }
}

/// Record a local store failure surfaced by an action
pub fn record_store_error(action: &str) {
    counter!("offline_sync_store_errors_total", "action" => action.to_string()).increment(1);
}

/// Record how long a push/pull/purge took
pub fn record_action_duration(action: &str, duration: Duration) {
    histogram!("offline_sync_action_seconds", "action" => action.to_string())
        .record(duration.as_secs_f64());
}

/// A timing guard that records the action's duration on drop
pub struct LatencyTimer {
    action: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(action: &'static str) -> Self {
        Self {
            action,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_action_duration(self.action, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    // Without a recorder installed these are no-ops; they must not panic.
    #[test]
    fn test_calls_without_recorder() {
        record_enqueue("insert", "queued");
        set_pending_operations(3);
        record_pushed_item("todo", "success");
        record_pulled_item("todo", "delete");
        record_purge("todo", 10, 2);
        record_store_error("push");
        let _t = LatencyTimer::new("pull");
    }

    #[test]
    fn test_push_outcomes_are_counted() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_push("Complete");
            record_push("Complete");
            record_push("CancelledByNetworkError");
        });

        let complete = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find_map(|(key, _, _, value)| {
                let key = key.key();
                let is_complete = key.name() == "offline_sync_push_total"
                    && key.labels().any(|l| l.key() == "status" && l.value() == "Complete");
                is_complete.then_some(value)
            });
        assert!(matches!(complete, Some(DebugValue::Counter(2))));
    }

    #[test]
    fn test_latency_timer_records_on_drop() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let _timer = LatencyTimer::new("purge");
        });

        let found = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .any(|(key, _, _, value)| {
                key.key().name() == "offline_sync_action_seconds" && matches!(value, DebugValue::Histogram(ref v) if v.len() == 1)
            });
        assert!(found);
    }
}
