// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Caller-facing operations: ingestion, reads, anomalies, jobs, nodes.

use chrono::Utc;
use tracing::{debug, warn};

use crate::aggregation::{AggregateBucket, NodeSummary, WindowSize};
use crate::anomaly::{Anomaly, AnomalyFilter};
use crate::backpressure::BackpressureLevel;
use crate::cache::CacheKey;
use crate::error::EngineError;
use crate::nodes::MonitoringNode;
use crate::reading::{SensorReading, TimeRange};
use crate::resilience::dead_letter::{DeadLetterStats, ReplayReport};
use crate::router::{Freshness, ReadResponse, WriteAck};
use crate::scheduler::{JobInfo, SyncJobRecord};
use crate::storage::traits::{StoredBucket, Tier};
use crate::write_buffer::{FlushReason, FlushReport};

use super::{BatchResult, TelemetryEngine};

impl TelemetryEngine {
    // ---------------------------------------------------------------------
    // Ingestion
    // ---------------------------------------------------------------------

    /// Accept one reading into the write buffer.
    ///
    /// Refused with `Cancelled` once shutdown has begun and with
    /// `Backpressure` when the buffer is full.
    pub async fn ingest(&self, reading: SensorReading) -> Result<WriteAck, EngineError> {
        let state = self.state();
        if !state.accepts_writes() {
            crate::metrics::record_ingest_rejected("stopped", 1);
            return Err(EngineError::Cancelled(format!("engine is {}", state)));
        }
        self.router.write(reading).await
    }

    /// Accept a batch reading by reading. A refused reading does not stop
    /// the rest of the batch.
    pub async fn ingest_batch(&self, readings: Vec<SensorReading>) -> BatchResult {
        let total = readings.len();
        let mut accepted = 0;
        let mut rejected = Vec::new();
        let mut level = BackpressureLevel::Normal;

        for (index, reading) in readings.into_iter().enumerate() {
            match self.ingest(reading).await {
                Ok(ack) => {
                    accepted += 1;
                    level = ack.level;
                }
                Err(e) => {
                    level = self.buffer.level();
                    rejected.push((index, e.to_string()));
                }
            }
        }
        if !rejected.is_empty() {
            warn!(total, rejected = rejected.len(), "Batch partially refused");
        }
        BatchResult {
            total,
            accepted,
            rejected,
            level,
        }
    }

    /// Flush every buffered partition to Warm now.
    pub async fn flush(&self) -> FlushReport {
        self.buffer.flush_all(FlushReason::Manual).await
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Most recent reading of a node, with the tier that served it and how
    /// stale it may be.
    pub async fn get_latest(
        &self,
        node_id: &str,
        freshness: Freshness,
    ) -> Result<ReadResponse<SensorReading>, EngineError> {
        self.router.get_latest(node_id, freshness).await
    }

    /// Raw readings of a node in `range`.
    pub async fn get_readings(
        &self,
        node_id: &str,
        range: TimeRange,
        freshness: Freshness,
    ) -> Result<ReadResponse<Vec<SensorReading>>, EngineError> {
        self.router.read(node_id, range, freshness).await
    }

    /// Aggregate buckets of `window` granularity over `range`.
    pub async fn get_range(
        &self,
        node_id: &str,
        range: TimeRange,
        window: WindowSize,
    ) -> Result<ReadResponse<Vec<AggregateBucket>>, EngineError> {
        self.router.get_range(node_id, range, window).await
    }

    /// As [`get_range`](Self::get_range), keeping each bucket's `computed_at`.
    pub async fn get_buckets(
        &self,
        node_id: &str,
        range: TimeRange,
        window: WindowSize,
        freshness: Freshness,
    ) -> Result<ReadResponse<Vec<StoredBucket>>, EngineError> {
        self.router.read_buckets(node_id, window, range, freshness).await
    }

    /// Dashboard summary of a node: the cached copy kept by the cache
    /// refresh job, or a fresh computation from Warm.
    pub async fn get_summary(&self, node_id: &str) -> Result<NodeSummary, EngineError> {
        match self.cache.get_value::<NodeSummary>(&CacheKey::summary(node_id)).await {
            Ok(Some((summary, _))) => return Ok(summary),
            Ok(None) => {}
            Err(e) => debug!(node_id = %node_id, error = %e, "Summary cache lookup failed"),
        }
        self.aggregator.summarize(node_id, Utc::now()).await
    }

    // ---------------------------------------------------------------------
    // Anomalies
    // ---------------------------------------------------------------------

    pub async fn get_anomalies(&self, filter: &AnomalyFilter) -> Result<Vec<Anomaly>, EngineError> {
        self.detector.list(filter).await
    }

    pub async fn acknowledge_anomaly(&self, id: &str, note: &str) -> Result<Anomaly, EngineError> {
        self.detector.acknowledge(id, note).await
    }

    pub async fn resolve_anomaly(&self, id: &str, note: &str) -> Result<Anomaly, EngineError> {
        self.detector.resolve(id, note).await
    }

    // ---------------------------------------------------------------------
    // Jobs
    // ---------------------------------------------------------------------

    /// Start a run of `name` now. Returns its job id.
    pub fn trigger_job(&self, name: &str) -> Result<String, EngineError> {
        self.scheduler.trigger_job(name)
    }

    /// Most recent run of `name`; `None` when it never ran.
    pub fn job_status(&self, name: &str) -> Result<Option<SyncJobRecord>, EngineError> {
        self.scheduler.job_status(name)
    }

    /// Kept runs of `name`, newest first.
    pub fn job_history(&self, name: &str) -> Result<Vec<SyncJobRecord>, EngineError> {
        self.scheduler.history(name)
    }

    /// Up to `limit` persisted runs of `name`, newest first, including
    /// runs older than the in-memory history.
    pub async fn job_runs(&self, name: &str, limit: usize) -> Result<Vec<SyncJobRecord>, EngineError> {
        self.scheduler.stored_history(name, limit).await
    }

    /// Retry the last run of `name` if it was a failed manual run.
    pub fn retry_job(&self, name: &str) -> Result<String, EngineError> {
        self.scheduler.retry_job(name)
    }

    /// Wait for a run to finish and return its final record.
    pub async fn wait_for_job(&self, job_id: &str) -> Option<SyncJobRecord> {
        self.scheduler.wait_for(job_id).await
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        self.scheduler.jobs()
    }

    // ---------------------------------------------------------------------
    // Dead letters
    // ---------------------------------------------------------------------

    pub fn dead_letter_stats(&self) -> DeadLetterStats {
        self.dead_letters.stats()
    }

    /// Replay up to `limit` dead-lettered batches into Warm now.
    pub async fn replay_dead_letters(&self, limit: usize) -> Result<ReplayReport, EngineError> {
        if self.circuits.warm.state() != crate::resilience::circuit_breaker::CircuitState::Closed {
            return Err(EngineError::TransientTierUnavailable {
                tier: Tier::Warm,
                reason: "circuit open".to_string(),
            });
        }
        self.housekeeping.replay(limit).await
    }

    // ---------------------------------------------------------------------
    // Nodes
    // ---------------------------------------------------------------------

    /// Register a node ahead of its first reading.
    pub fn register_node(&self, node: MonitoringNode) {
        self.registry.register(node);
    }

    /// Stop tracking a node. Its data stays; it is never deleted.
    pub fn deactivate_node(&self, node_id: &str) -> Result<(), EngineError> {
        self.registry.deactivate(node_id)
    }

    pub fn node(&self, node_id: &str) -> Option<MonitoringNode> {
        self.registry.get(node_id)
    }

    pub fn nodes(&self) -> Vec<MonitoringNode> {
        self.registry.list()
    }
}
