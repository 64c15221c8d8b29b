// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The standard maintenance jobs.
//!
//! | name                 | cadence      | work                                         |
//! |----------------------|--------------|----------------------------------------------|
//! | `full_sync`          | daily 02:00  | Cold → Warm backfill over a trailing window  |
//! | `incremental_sync`   | every 5 min  | Warm → Cold from each node's high-water mark |
//! | `cache_refresh`      | hourly       | Hot summary keys recomputed from Warm        |
//! | `anomaly_sweep`      | every 15 min | detector over the trailing sweep window      |
//! | `data_quality_check` | daily 03:00  | node status from screening and silence       |
//! | `retention_cleanup`  | weekly       | Warm rows past retention, Cold-confirmed     |
//!
//! Every job works node by node and checks its cancellation token between
//! nodes, so a shutdown never leaves a node half-synced. A node that fails is
//! logged and the job carries on; the run is then reported failed.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::{JobContext, SyncJob, SyncScheduler};
use crate::aggregation::{ContinuousAggregator, WindowSize};
use crate::anomaly::AnomalyDetector;
use crate::cache::{CacheKey, CacheManager};
use crate::config::{QualityRules, RetentionPolicy, ScheduleConfig, TierTimeouts};
use crate::error::EngineError;
use crate::nodes::{MonitoringNode, NodeRegistry, NodeStatus};
use crate::quality;
use crate::reading::{from_millis, SensorReading, TimeRange};
use crate::resilience::circuit_breaker::TierCircuits;
use crate::resilience::guarded;
use crate::storage::traits::{SeriesTier, StorageError, Tier};
use crate::storage::Tiers;

pub const FULL_SYNC: &str = "full_sync";
pub const INCREMENTAL_SYNC: &str = "incremental_sync";
pub const CACHE_REFRESH: &str = "cache_refresh";
pub const ANOMALY_SWEEP: &str = "anomaly_sweep";
pub const DATA_QUALITY_CHECK: &str = "data_quality_check";
pub const RETENTION_CLEANUP: &str = "retention_cleanup";

/// Rows per upsert call when copying between tiers.
const SYNC_CHUNK: usize = 1_000;

/// Readings screened per node by the quality check.
const QUALITY_LOOKBACK_HOURS: i64 = 24;

/// Breaker- and deadline-guarded access to the series tiers.
#[derive(Clone)]
pub struct TierAccess {
    tiers: Tiers,
    circuits: Arc<TierCircuits>,
    timeouts: TierTimeouts,
}

impl TierAccess {
    pub fn new(tiers: Tiers, circuits: Arc<TierCircuits>, timeouts: TierTimeouts) -> Self {
        Self {
            tiers,
            circuits,
            timeouts,
        }
    }

    async fn call<T, F, Fut>(&self, tier: Tier, operation: &'static str, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(Arc<dyn SeriesTier>) -> Fut,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        let (series, budget) = match tier {
            Tier::Warm => (Arc::clone(&self.tiers.warm), self.timeouts.warm()),
            Tier::Cold => (Arc::clone(&self.tiers.cold), self.timeouts.cold()),
            Tier::Hot => return Err(EngineError::Config("hot tier holds no series".into())),
        };
        guarded(self.circuits.for_tier(tier), tier, operation, budget, || f(series))
            .await
            .map_err(|e| EngineError::from_tier(tier, e))
    }

    pub async fn range(&self, tier: Tier, node_id: &str, range: TimeRange) -> Result<Vec<SensorReading>, EngineError> {
        self.call(tier, "range_query", |s| async move { s.range_query(node_id, range).await })
            .await
    }

    pub async fn latest(&self, tier: Tier, node_id: &str) -> Result<Option<SensorReading>, EngineError> {
        self.call(tier, "latest", |s| async move { s.latest(node_id).await }).await
    }

    pub async fn count(&self, tier: Tier, node_id: &str, range: TimeRange) -> Result<u64, EngineError> {
        self.call(tier, "count_range", |s| async move { s.count_range(node_id, range).await })
            .await
    }

    pub async fn node_ids(&self, tier: Tier) -> Result<Vec<String>, EngineError> {
        self.call(tier, "node_ids", |s| async move { s.node_ids().await }).await
    }

    pub async fn delete_older_than(&self, tier: Tier, node_id: &str, older_than: DateTime<Utc>) -> Result<u64, EngineError> {
        self.call(tier, "delete_older_than", |s| async move {
            s.delete_older_than(node_id, older_than).await
        })
        .await
    }

    /// Upsert in chunks; each chunk is its own commit.
    pub async fn copy_into(&self, tier: Tier, rows: &[SensorReading]) -> Result<u64, EngineError> {
        let mut written = 0u64;
        for chunk in rows.chunks(SYNC_CHUNK) {
            let result = self.call(tier, "upsert", |s| async move { s.upsert(chunk).await }).await?;
            written += result.written as u64;
        }
        Ok(written)
    }
}

/// Handles every standard job draws from.
#[derive(Clone)]
pub struct JobDeps {
    pub access: TierAccess,
    pub registry: Arc<NodeRegistry>,
    pub cache: Arc<CacheManager>,
    pub aggregator: Arc<ContinuousAggregator>,
    pub detector: Arc<AnomalyDetector>,
    pub rules: QualityRules,
    pub retention: RetentionPolicy,
    pub schedule: ScheduleConfig,
    pub summary_ttl: Duration,
}

impl JobDeps {
    /// Nodes present in `tier` plus registered ones, minus deactivated nodes.
    async fn nodes_in(&self, tier: Tier) -> Result<Vec<String>, EngineError> {
        let mut ids: BTreeSet<String> = self.access.node_ids(tier).await?.into_iter().collect();
        ids.extend(self.registry.active_ids());
        Ok(ids
            .into_iter()
            .filter(|id| self.registry.get(id).map_or(true, |n| n.is_active()))
            .collect())
    }
}

/// Per-node failures of one run.
struct NodeFailures {
    job: &'static str,
    failed: Vec<(String, String)>,
}

impl NodeFailures {
    fn new(job: &'static str) -> Self {
        Self { job, failed: Vec::new() }
    }

    fn push(&mut self, node_id: &str, err: EngineError) {
        warn!(job = self.job, node_id = %node_id, error = %err, "Node failed");
        self.failed.push((node_id.to_string(), err.to_string()));
    }

    fn finish(self, processed: u64) -> Result<u64, EngineError> {
        if self.failed.is_empty() {
            return Ok(processed);
        }
        let detail = self
            .failed
            .iter()
            .map(|(node, err)| format!("{}: {}", node, err))
            .collect::<Vec<_>>()
            .join("; ");
        Err(EngineError::sync(
            self.job,
            format!("{} node(s) failed after {} records: {}", self.failed.len(), processed, detail),
        ))
    }
}

/// Recompute every bucket, in every window, that holds one of `stamps`.
async fn refresh_touched(
    aggregator: &ContinuousAggregator,
    node_id: &str,
    stamps: &[DateTime<Utc>],
) -> Result<usize, EngineError> {
    let touched: BTreeSet<(WindowSize, DateTime<Utc>)> = stamps
        .iter()
        .flat_map(|ts| WindowSize::ALL.into_iter().map(move |w| (w, w.align(*ts))))
        .collect();
    for (window, start) in &touched {
        aggregator.refresh_bucket(node_id, *window, *start).await?;
    }
    Ok(touched.len())
}

fn stop_if_cancelled(ctx: &JobContext, done: usize, total: usize) -> Result<(), EngineError> {
    if ctx.is_cancelled() {
        return Err(EngineError::Cancelled(format!(
            "{} stopped after {}/{} nodes",
            ctx.job_name, done, total
        )));
    }
    Ok(())
}

/// Idempotent Cold → Warm backfill over the trailing window.
pub struct FullSyncJob {
    deps: JobDeps,
}

impl FullSyncJob {
    pub fn new(deps: JobDeps) -> Self {
        Self { deps }
    }

    fn window(&self, now: DateTime<Utc>) -> TimeRange {
        let days = chrono::Duration::days(i64::from(self.deps.schedule.full_sync_window_days));
        TimeRange::trailing(days.min(self.deps.retention.warm()), now)
    }

    async fn sync_node(&self, node_id: &str, window: TimeRange) -> Result<u64, EngineError> {
        let access = &self.deps.access;
        let archived = access.range(Tier::Cold, node_id, window).await?;
        if archived.is_empty() {
            return Ok(0);
        }
        let present: HashSet<i64> = access
            .range(Tier::Warm, node_id, window)
            .await?
            .iter()
            .map(|r| r.timestamp.timestamp_millis())
            .collect();
        let missing: Vec<SensorReading> = archived
            .into_iter()
            .filter(|r| !present.contains(&r.timestamp.timestamp_millis()))
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }
        access.copy_into(Tier::Warm, &missing).await?;

        let stamps: Vec<DateTime<Utc>> = missing.iter().map(|r| r.timestamp).collect();
        self.deps.cache.invalidate_readings(node_id, &stamps).await;
        let refreshed = refresh_touched(&self.deps.aggregator, node_id, &stamps).await?;
        debug!(node_id = %node_id, rows = missing.len(), refreshed, "Warm gaps filled from Cold");
        Ok(missing.len() as u64)
    }
}

#[async_trait]
impl SyncJob for FullSyncJob {
    #[tracing::instrument(skip_all, fields(job = FULL_SYNC, job_id = %ctx.job_id))]
    async fn run(&self, ctx: JobContext) -> Result<u64, EngineError> {
        let window = self.window(Utc::now());
        let nodes = self.deps.nodes_in(Tier::Cold).await?;
        let mut failures = NodeFailures::new(FULL_SYNC);
        let mut synced = 0;
        for (done, node_id) in nodes.iter().enumerate() {
            stop_if_cancelled(&ctx, done, nodes.len())?;
            match self.sync_node(node_id, window).await {
                Ok(n) => synced += n,
                Err(e) => failures.push(node_id, e),
            }
        }
        crate::metrics::record_rows_synced(FULL_SYNC, synced);
        info!(nodes = nodes.len(), rows = synced, "Full sync pass complete");
        failures.finish(synced)
    }
}

/// Warm → Cold archival driven by a per-node high-water mark.
///
/// The mark is the newest timestamp known to be in Cold. After a restart it
/// is recovered from Cold itself. Each pass re-reads `overlap` before the
/// mark so readings that reached Warm late are still archived; Cold upserts
/// are idempotent.
pub struct IncrementalSyncJob {
    deps: JobDeps,
    overlap: chrono::Duration,
    marks: DashMap<String, DateTime<Utc>>,
}

impl IncrementalSyncJob {
    pub fn new(deps: JobDeps) -> Self {
        let overlap = chrono::Duration::from_std(Duration::from_secs(deps.schedule.incremental_sync_secs))
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        Self {
            deps,
            overlap,
            marks: DashMap::new(),
        }
    }

    pub fn high_water_mark(&self, node_id: &str) -> Option<DateTime<Utc>> {
        self.marks.get(node_id).map(|m| *m)
    }

    async fn mark_for(&self, node_id: &str) -> Result<Option<DateTime<Utc>>, EngineError> {
        if let Some(mark) = self.high_water_mark(node_id) {
            return Ok(Some(mark));
        }
        let recovered = self.deps.access.latest(Tier::Cold, node_id).await?.map(|r| r.timestamp);
        if let Some(mark) = recovered {
            debug!(node_id = %node_id, mark = %mark, "High-water mark recovered from Cold");
        }
        Ok(recovered)
    }

    async fn sync_node(&self, node_id: &str, now: DateTime<Utc>) -> Result<u64, EngineError> {
        let mark = self.mark_for(node_id).await?;
        let start = match mark {
            Some(mark) => mark - self.overlap,
            None => now - self.deps.retention.warm(),
        };
        let rows = self.deps.access.range(Tier::Warm, node_id, TimeRange::new(start, now)).await?;
        let Some(newest) = rows.iter().map(|r| r.timestamp).max() else {
            if let Some(mark) = mark {
                self.marks.insert(node_id.to_string(), mark);
            }
            return Ok(0);
        };

        self.deps.access.copy_into(Tier::Cold, &rows).await?;
        let advanced = mark.map_or(newest, |m| m.max(newest));
        self.marks.insert(node_id.to_string(), advanced);

        let stamps: Vec<DateTime<Utc>> = rows.iter().map(|r| r.timestamp).collect();
        refresh_touched(&self.deps.aggregator, node_id, &stamps).await?;
        Ok(rows.len() as u64)
    }
}

#[async_trait]
impl SyncJob for IncrementalSyncJob {
    #[tracing::instrument(skip_all, fields(job = INCREMENTAL_SYNC, job_id = %ctx.job_id))]
    async fn run(&self, ctx: JobContext) -> Result<u64, EngineError> {
        let now = Utc::now();
        let nodes = self.deps.nodes_in(Tier::Warm).await?;
        let mut failures = NodeFailures::new(INCREMENTAL_SYNC);
        let mut synced = 0;
        for (done, node_id) in nodes.iter().enumerate() {
            stop_if_cancelled(&ctx, done, nodes.len())?;
            match self.sync_node(node_id, now).await {
                Ok(n) => synced += n,
                Err(e) => failures.push(node_id, e),
            }
        }
        crate::metrics::record_rows_synced(INCREMENTAL_SYNC, synced);
        debug!(nodes = nodes.len(), rows = synced, "Incremental sync pass complete");
        failures.finish(synced)
    }
}

/// Recompute each active node's Hot summary from Warm, then drop expired
/// cache bookkeeping.
pub struct CacheRefreshJob {
    deps: JobDeps,
}

impl CacheRefreshJob {
    pub fn new(deps: JobDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl SyncJob for CacheRefreshJob {
    async fn run(&self, ctx: JobContext) -> Result<u64, EngineError> {
        let nodes = self.deps.registry.active_ids();
        let mut failures = NodeFailures::new(CACHE_REFRESH);
        let mut refreshed = 0;
        for (done, node_id) in nodes.iter().enumerate() {
            stop_if_cancelled(&ctx, done, nodes.len())?;
            let reservation = self.deps.cache.reserve();
            let summary = match self.deps.aggregator.summarize(node_id, Utc::now()).await {
                Ok(summary) => summary,
                Err(e) => {
                    failures.push(node_id, e);
                    continue;
                }
            };
            match self
                .deps
                .cache
                .set_reserved(&CacheKey::summary(node_id), &summary, self.deps.summary_ttl, reservation)
                .await
            {
                Ok(true) => refreshed += 1,
                Ok(false) => debug!(node_id = %node_id, "Summary superseded by a newer invalidation"),
                Err(e) => failures.push(node_id, EngineError::from_tier(Tier::Hot, e)),
            }
        }
        let purged = self.deps.cache.purge_expired();
        debug!(refreshed, purged, "Cache refresh complete");
        failures.finish(refreshed)
    }
}

/// Run the detector over the trailing sweep window of every active node.
pub struct AnomalySweepJob {
    deps: JobDeps,
}

impl AnomalySweepJob {
    pub fn new(deps: JobDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl SyncJob for AnomalySweepJob {
    async fn run(&self, ctx: JobContext) -> Result<u64, EngineError> {
        let detector = &self.deps.detector;
        let window = TimeRange::trailing(detector.config().sweep_window(), Utc::now());
        let nodes = self.deps.registry.active_ids();
        let report = detector.sweep_nodes(&nodes, window, &ctx.cancel).await;
        stop_if_cancelled(&ctx, report.nodes, nodes.len())?;

        info!(
            nodes = report.nodes,
            flagged = report.flagged,
            created = report.created,
            failed = report.failed.len(),
            "Anomaly sweep complete"
        );
        let mut failures = NodeFailures::new(ANOMALY_SWEEP);
        failures.failed = report.failed;
        failures.finish(report.created as u64)
    }
}

/// Derive node health: `Offline` after `offline_after` without a reading,
/// `Degraded` when the last day holds screening violations, else `Active`.
pub struct DataQualityCheckJob {
    deps: JobDeps,
}

impl DataQualityCheckJob {
    pub fn new(deps: JobDeps) -> Self {
        Self { deps }
    }

    async fn check_node(&self, node_id: &str, now: DateTime<Utc>) -> Result<u64, EngineError> {
        let registry = &self.deps.registry;
        if registry.get(node_id).is_none() {
            registry.register(MonitoringNode::new(node_id));
        }
        let last_seen = match registry.get(node_id).and_then(|n| n.last_reading_ts) {
            Some(ts) => Some(ts),
            None => self.deps.access.latest(Tier::Warm, node_id).await?.map(|r| r.timestamp),
        };
        let offline_after = chrono::Duration::minutes(i64::from(self.deps.schedule.offline_after_mins));
        if last_seen.map_or(true, |ts| now - ts > offline_after) {
            registry.set_status(node_id, NodeStatus::Offline);
            return Ok(0);
        }

        let lookback = TimeRange::trailing(chrono::Duration::hours(QUALITY_LOOKBACK_HOURS), now);
        let rows = self.deps.access.range(Tier::Warm, node_id, lookback).await?;
        let screened = quality::screen(&self.deps.rules, &rows, None);
        if screened.violations.is_empty() {
            registry.set_status(node_id, NodeStatus::Active);
        } else {
            warn!(
                node_id = %node_id,
                violations = screened.violations.len(),
                checked = rows.len(),
                first = %screened.violations[0],
                "Data quality violations"
            );
            registry.set_status(node_id, NodeStatus::Degraded);
        }
        Ok(rows.len() as u64)
    }
}

#[async_trait]
impl SyncJob for DataQualityCheckJob {
    async fn run(&self, ctx: JobContext) -> Result<u64, EngineError> {
        let now = Utc::now();
        let nodes = self.deps.nodes_in(Tier::Warm).await?;
        let mut failures = NodeFailures::new(DATA_QUALITY_CHECK);
        let mut checked = 0;
        for (done, node_id) in nodes.iter().enumerate() {
            stop_if_cancelled(&ctx, done, nodes.len())?;
            match self.check_node(node_id, now).await {
                Ok(n) => checked += n,
                Err(e) => failures.push(node_id, e),
            }
        }
        failures.finish(checked)
    }
}

/// Delete Warm rows past retention, and Cold rows when Cold retention is set.
///
/// A Warm row is deleted only once the same `(node, timestamp)` has been
/// read back from Cold. Rows missing from Cold are copied first; deletion
/// stops at the oldest row that still cannot be confirmed.
pub struct RetentionCleanupJob {
    deps: JobDeps,
}

impl RetentionCleanupJob {
    pub fn new(deps: JobDeps) -> Self {
        Self { deps }
    }

    async fn archived(&self, node_id: &str, expired: TimeRange) -> Result<HashSet<i64>, EngineError> {
        Ok(self
            .deps
            .access
            .range(Tier::Cold, node_id, expired)
            .await?
            .iter()
            .map(|r| r.timestamp.timestamp_millis())
            .collect())
    }

    async fn clean_warm(&self, node_id: &str, cutoff: DateTime<Utc>) -> Result<u64, EngineError> {
        let access = &self.deps.access;
        let old = access
            .range(Tier::Warm, node_id, TimeRange::new(from_millis(0), cutoff))
            .await?;
        let Some(oldest) = old.iter().map(|r| r.timestamp).min() else {
            return Ok(0);
        };
        // Cold is only asked about the span the expired Warm rows cover.
        let expired = TimeRange::new(oldest, cutoff);

        let mut archived = self.archived(node_id, expired).await?;
        let missing: Vec<SensorReading> = old
            .iter()
            .filter(|r| !archived.contains(&r.timestamp.timestamp_millis()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            info!(node_id = %node_id, rows = missing.len(), "Archiving expired Warm rows before cleanup");
            access.copy_into(Tier::Cold, &missing).await?;
            archived = self.archived(node_id, expired).await?;
        }

        let first_unconfirmed = old
            .iter()
            .map(|r| r.timestamp.timestamp_millis())
            .filter(|ms| !archived.contains(ms))
            .min();
        let delete_before = match first_unconfirmed {
            Some(ms) => {
                warn!(
                    node_id = %node_id,
                    first_unconfirmed = %from_millis(ms),
                    "Cold copy not confirmed, Warm cleanup stops early"
                );
                from_millis(ms)
            }
            None => cutoff,
        };

        let confirmed = old.iter().filter(|r| r.timestamp < delete_before).count() as u64;
        if confirmed == 0 {
            return Ok(0);
        }
        // Rows that reached Warm after the scan above are unconfirmed
        let present = access
            .count(Tier::Warm, node_id, TimeRange::new(from_millis(0), delete_before))
            .await?;
        if present != confirmed {
            warn!(node_id = %node_id, present, confirmed, "Warm changed during cleanup, skipping node");
            return Ok(0);
        }
        access.delete_older_than(Tier::Warm, node_id, delete_before).await
    }
}

#[async_trait]
impl SyncJob for RetentionCleanupJob {
    #[tracing::instrument(skip_all, fields(job = RETENTION_CLEANUP, job_id = %ctx.job_id))]
    async fn run(&self, ctx: JobContext) -> Result<u64, EngineError> {
        let now = Utc::now();
        let warm_cutoff = now - self.deps.retention.warm();
        let cold_cutoff = self
            .deps
            .retention
            .cold_days
            .map(|days| now - chrono::Duration::days(i64::from(days)));

        let nodes = self.deps.nodes_in(Tier::Warm).await?;
        let mut failures = NodeFailures::new(RETENTION_CLEANUP);
        let mut deleted = 0;
        for (done, node_id) in nodes.iter().enumerate() {
            stop_if_cancelled(&ctx, done, nodes.len())?;
            match self.clean_warm(node_id, warm_cutoff).await {
                Ok(n) => deleted += n,
                Err(e) => failures.push(node_id, e),
            }
            if let Some(cutoff) = cold_cutoff {
                match self.deps.access.delete_older_than(Tier::Cold, node_id, cutoff).await {
                    Ok(n) => deleted += n,
                    Err(e) => failures.push(node_id, e),
                }
            }
        }
        info!(nodes = nodes.len(), deleted, "Retention cleanup complete");
        failures.finish(deleted)
    }
}

/// Register the six standard jobs with their configured cadences.
pub fn register_standard_jobs(scheduler: &Arc<SyncScheduler>, deps: &JobDeps) -> Result<(), EngineError> {
    let schedule = &deps.schedule;
    scheduler.register_job(FULL_SYNC, schedule.full_sync(), Arc::new(FullSyncJob::new(deps.clone())))?;
    scheduler.register_job(
        INCREMENTAL_SYNC,
        schedule.incremental_sync(),
        Arc::new(IncrementalSyncJob::new(deps.clone())),
    )?;
    scheduler.register_job(CACHE_REFRESH, schedule.cache_refresh(), Arc::new(CacheRefreshJob::new(deps.clone())))?;
    scheduler.register_job(ANOMALY_SWEEP, schedule.anomaly_sweep(), Arc::new(AnomalySweepJob::new(deps.clone())))?;
    scheduler.register_job(
        DATA_QUALITY_CHECK,
        schedule.quality_check(),
        Arc::new(DataQualityCheckJob::new(deps.clone())),
    )?;
    scheduler.register_job(
        RETENTION_CLEANUP,
        schedule.retention_cleanup(),
        Arc::new(RetentionCleanupJob::new(deps.clone())),
    )?;
    Ok(())
}
