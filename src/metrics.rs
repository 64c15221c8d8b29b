// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for hydro-sync.
//!
//! Uses the `metrics` crate facade. The host process installs whichever
//! exporter it wants; without one every call is a no-op.
//!
//! # Naming
//! - `hydro_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: hot, warm, cold
//! - `job`: full_sync, incremental_sync, cache_refresh, ...
//! - `status`: success, error, timeout, rejected

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a tier operation outcome
pub fn record_tier_operation(tier: &str, operation: &str, status: &str) {
    counter!(
        "hydro_sync_tier_operations_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record tier operation latency
pub fn record_tier_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "hydro_sync_tier_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a tier call that ran past its deadline
pub fn record_tier_timeout(tier: &str, operation: &str) {
    counter!(
        "hydro_sync_tier_timeouts_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record which tier answered a read
pub fn record_read_served(tier: &str, degraded: bool) {
    counter!(
        "hydro_sync_reads_total",
        "tier" => tier.to_string(),
        "degraded" => degraded.to_string()
    )
    .increment(1);
}

/// Record an asynchronous back-fill into a higher tier
pub fn record_backfill(tier: &str, status: &str) {
    counter!(
        "hydro_sync_backfills_total",
        "tier" => tier.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record circuit breaker call outcome
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "hydro_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set backend health (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "hydro_sync_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Set number of readings waiting in the write buffer
pub fn set_buffer_depth(count: usize) {
    gauge!("hydro_sync_buffer_depth").set(count as f64);
}

/// Set backpressure level (0 = Normal .. 3 = Full)
pub fn set_backpressure_level(level: u8) {
    gauge!("hydro_sync_backpressure_level").set(level as f64);
}

/// Record a write-buffer flush
pub fn record_flush(rows: usize, duration: Duration, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("hydro_sync_flushes_total", "status" => status).increment(1);
    histogram!("hydro_sync_flush_rows").record(rows as f64);
    histogram!("hydro_sync_flush_seconds").record(duration.as_secs_f64());
}

/// Record readings refused at ingestion
pub fn record_ingest_rejected(reason: &str, count: usize) {
    counter!(
        "hydro_sync_ingest_rejected_total",
        "reason" => reason.to_string()
    )
    .increment(count as u64);
}

/// Record accepted readings
pub fn record_ingested(count: usize) {
    counter!("hydro_sync_ingested_total").increment(count as u64);
}

/// Record a batch moved to the dead-letter log
pub fn record_dead_letter(readings: usize) {
    counter!("hydro_sync_dead_letter_batches_total").increment(1);
    counter!("hydro_sync_dead_letter_readings_total").increment(readings as u64);
}

/// Set dead-letter batches awaiting replay
pub fn set_dead_letter_pending(count: u64) {
    gauge!("hydro_sync_dead_letter_pending").set(count as f64);
}

/// Record a dead-letter replay pass
pub fn record_dead_letter_replay(readings: usize, corrupt: usize) {
    counter!("hydro_sync_dead_letter_replayed_total").increment(readings as u64);
    if corrupt > 0 {
        counter!("hydro_sync_dead_letter_corrupt_total").increment(corrupt as u64);
    }
}

/// Record a cache lookup
pub fn record_cache_lookup(family: &str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!(
        "hydro_sync_cache_lookups_total",
        "family" => family.to_string(),
        "result" => result
    )
    .increment(1);
}

/// Record LRU evictions
pub fn record_cache_eviction(count: usize, bytes: usize) {
    counter!("hydro_sync_cache_evictions_total").increment(count as u64);
    counter!("hydro_sync_cache_evicted_bytes_total").increment(bytes as u64);
}

/// Record a cache write refused because an invalidation is newer
pub fn record_stale_write_rejected(family: &str) {
    counter!(
        "hydro_sync_cache_stale_writes_total",
        "family" => family.to_string()
    )
    .increment(1);
}

/// Set tracked cache footprint
pub fn set_cache_usage(entries: usize, bytes: usize) {
    gauge!("hydro_sync_cache_entries").set(entries as f64);
    gauge!("hydro_sync_cache_bytes").set(bytes as f64);
}

/// Record a finished job run
pub fn record_job_run(job: &str, status: &str, duration: Duration) {
    counter!(
        "hydro_sync_job_runs_total",
        "job" => job.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        "hydro_sync_job_seconds",
        "job" => job.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a scheduled run skipped because the previous one is still going
pub fn record_job_skipped(job: &str) {
    counter!(
        "hydro_sync_job_skipped_total",
        "job" => job.to_string()
    )
    .increment(1);
}

/// Record a manual trigger refused because the job is already running
pub fn record_job_conflict(job: &str) {
    counter!(
        "hydro_sync_job_conflicts_total",
        "job" => job.to_string()
    )
    .increment(1);
}

/// Record readings moved by a sync job
pub fn record_rows_synced(job: &str, rows: u64) {
    counter!(
        "hydro_sync_rows_synced_total",
        "job" => job.to_string()
    )
    .increment(rows);
}

/// Record anomalies found by a detection pass
pub fn record_anomalies_detected(metric: &str, severity: &str, count: usize) {
    counter!(
        "hydro_sync_anomalies_detected_total",
        "metric" => metric.to_string(),
        "severity" => severity.to_string()
    )
    .increment(count as u64);
}

/// Record a reading excluded by quality screening
pub fn record_quality_violation(kind: &str) {
    counter!(
        "hydro_sync_quality_violations_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record recomputed aggregate buckets
pub fn record_aggregates_refreshed(window: &str, count: usize) {
    counter!(
        "hydro_sync_aggregates_refreshed_total",
        "window" => window.to_string()
    )
    .increment(count as u64);
}

/// Record engine lifecycle transition
pub fn set_engine_state(state: &str) {
    counter!(
        "hydro_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records tier latency on drop
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_tier_latency(self.tier, self.operation, self.start.elapsed());
    }
}
