// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for telemetry-relay.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `telemetry_relay_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size histograms
//!
//! # Labels
//! - `tier`: local, session, structured, header
//! - `reason`: count, size, time, manual, priority, teardown, retry
//! - `status`: success, error, rejected

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// INGESTION
// ═══════════════════════════════════════════════════════════════════════════

/// Record an event arriving at the pipeline entry point
pub fn record_ingest(status: &str) {
    counter!(
        "telemetry_relay_ingested_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a duplicate rejected by the deduplicator, by what matched
pub fn record_duplicate(matched_on: &str) {
    counter!(
        "telemetry_relay_duplicates_total",
        "matched_on" => matched_on.to_string()
    )
    .increment(1);
}

/// Set current dedup cache size
pub fn set_dedup_cache_entries(count: usize) {
    gauge!("telemetry_relay_dedup_cache_entries").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// BATCHING
// ═══════════════════════════════════════════════════════════════════════════

/// Record a batch handed to the flush sink
pub fn record_flush(reason: &str, status: &str) {
    counter!(
        "telemetry_relay_flushes_total",
        "reason" => reason.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record batch size
pub fn record_batch_size(reason: &str, count: usize) {
    histogram!(
        "telemetry_relay_batch_size",
        "reason" => reason.to_string()
    )
    .record(count as f64);
}

/// Record batch bytes
pub fn record_batch_bytes(reason: &str, bytes: usize) {
    histogram!(
        "telemetry_relay_batch_bytes",
        "reason" => reason.to_string()
    )
    .record(bytes as f64);
}

/// Set the current adaptive flush interval
pub fn set_flush_interval(interval: Duration) {
    gauge!("telemetry_relay_flush_interval_seconds").set(interval.as_secs_f64());
}

/// Record a teardown delivery attempt through the beacon path
pub fn record_beacon(accepted: bool) {
    counter!(
        "telemetry_relay_beacons_total",
        "status" => if accepted { "success" } else { "rejected" }
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// RETRY QUEUE
// ═══════════════════════════════════════════════════════════════════════════

/// Set queue depth
pub fn set_queue_depth(count: usize) {
    gauge!("telemetry_relay_queue_depth").set(count as f64);
}

/// Record the outcome of one queued item's delivery attempt
pub fn record_sync_attempt(status: &str) {
    counter!(
        "telemetry_relay_sync_attempts_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed sync pass
pub fn record_sync_pass(delivered: usize, failed: usize) {
    counter!("telemetry_relay_sync_passes_total").increment(1);
    histogram!("telemetry_relay_sync_pass_delivered").record(delivered as f64);
    histogram!("telemetry_relay_sync_pass_failed").record(failed as f64);
}

/// Record an item evicted from a full queue
pub fn record_queue_eviction() {
    counter!("telemetry_relay_queue_evictions_total").increment(1);
}

/// Record an item rejected because the queue is full of high-priority items
pub fn record_queue_rejection() {
    counter!("telemetry_relay_queue_rejections_total").increment(1);
}

/// Record an item that ran out of retries
pub fn record_item_exhausted() {
    counter!("telemetry_relay_items_exhausted_total").increment(1);
}

/// Record stale failed items purged at load
pub fn record_stale_purged(count: usize) {
    counter!("telemetry_relay_stale_purged_total").increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// STORAGE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a tier probe at startup
pub fn record_tier_probe(tier: &str, available: bool) {
    counter!(
        "telemetry_relay_tier_probes_total",
        "tier" => tier.to_string(),
        "status" => if available { "success" } else { "error" }
    )
    .increment(1);
}

/// Record a tier write
pub fn record_tier_write(tier: &str, ok: bool) {
    counter!(
        "telemetry_relay_tier_writes_total",
        "tier" => tier.to_string(),
        "status" => if ok { "success" } else { "error" }
    )
    .increment(1);
}

/// Record which tier served a read (`none` on a miss)
pub fn record_tier_read(tier: &str, hit: bool) {
    counter!(
        "telemetry_relay_tier_reads_total",
        "tier" => tier.to_string(),
        "status" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Record entries dropped to recover from a quota failure
pub fn record_quota_eviction(tier: &str, count: usize) {
    counter!(
        "telemetry_relay_quota_evictions_total",
        "tier" => tier.to_string()
    )
    .increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// LATENCY
// ═══════════════════════════════════════════════════════════════════════════

/// Record transport latency
pub fn record_latency(stage: &str, operation: &str, duration: Duration) {
    histogram!(
        "telemetry_relay_operation_seconds",
        "stage" => stage.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Records latency on drop
pub struct LatencyTimer {
    stage: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(stage: &'static str, operation: &'static str) -> Self {
        Self {
            stage,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.stage, self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    // Without a recorder installed these are no-ops; they only check nothing panics.

    #[test]
    fn test_ingest_metrics() {
        record_ingest("accepted");
        record_ingest("duplicate");
        record_duplicate("id");
        record_duplicate("fingerprint");
        set_dedup_cache_entries(42);
    }

    #[test]
    fn test_batch_metrics() {
        record_flush("count", "success");
        record_flush("time", "error");
        record_batch_size("count", 50);
        record_batch_bytes("count", 1024 * 10);
        set_flush_interval(Duration::from_millis(2500));
        record_beacon(true);
        record_beacon(false);
    }

    #[test]
    fn test_queue_metrics() {
        set_queue_depth(7);
        record_sync_attempt("success");
        record_sync_attempt("error");
        record_sync_pass(3, 1);
        record_queue_eviction();
        record_queue_rejection();
        record_item_exhausted();
        record_stale_purged(2);
    }

    #[test]
    fn test_storage_metrics() {
        record_tier_probe("structured", false);
        record_tier_write("local", true);
        record_tier_read("session", true);
        record_tier_read("none", false);
        record_quota_eviction("local", 3);
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("transport", "send");
            std::thread::sleep(Duration::from_micros(10));
        }
        // Timer recorded on drop
    }

    #[test]
    fn test_counters_reach_recorder() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_flush("manual", "success");
            record_flush("manual", "success");
            set_queue_depth(5);
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let flushes = snapshot
            .iter()
            .find(|(key, ..)| key.key().name() == "telemetry_relay_flushes_total")
            .map(|(.., value)| value.clone());
        assert_eq!(flushes, Some(&DebugValue::Counter(2)));

        let depth = snapshot
            .iter()
            .find(|(key, ..)| key.key().name() == "telemetry_relay_queue_depth")
            .map(|(.., value)| value.clone());
        assert!(matches!(depth, Some(DebugValue::Gauge(v)) if v.into_inner() == 5.0));
    }
}
