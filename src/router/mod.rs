// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tier routing.
//!
//! # Reads
//!
//! ```text
//! Hot (50ms) ──miss──► Warm (500ms) ──miss/fail──► Cold (5s)
//!     │                    │                          │
//!     └ hit                └ back-fill Hot            └ back-fill Warm + Hot
//! ```
//!
//! Each tier call runs under its own deadline and circuit breaker, so a slow
//! or dead tier costs at most its budget before the next one is asked. A
//! failed tier on the way marks the response `degraded`; only when neither
//! Warm nor Cold can answer does a read fail, with
//! [`EngineError::AllTiersUnavailable`].
//!
//! Ranges that begin before the Warm retention cutoff are history reads and
//! go to Cold first.
//!
//! Back-fills run as tracked background tasks. The cache generation used by
//! a back-fill is reserved before the lower tier is read, so a flush that
//! lands in between makes the cache reject the back-fill.
//!
//! # Writes
//!
//! A write is queued in the [`WriteBuffer`] and, when it is the node's
//! newest reading, written through to the Hot tier's latest-value key.

pub mod response;

pub use response::{Freshness, ReadResponse, WriteAck};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::aggregation::{AggregateBucket, WindowSize};
use crate::cache::{CacheKey, CacheManager, Reservation};
use crate::config::{CacheConfig, QualityRules, RetentionPolicy, TierTimeouts};
use crate::error::EngineError;
use crate::nodes::NodeRegistry;
use crate::quality;
use crate::reading::{SensorReading, TimeRange};
use crate::resilience::circuit_breaker::TierCircuits;
use crate::resilience::guarded;
use crate::storage::traits::{StoredBucket, Tier};
use crate::storage::Tiers;
use crate::write_buffer::WriteBuffer;
use response::Failures;

/// Bucket reads spanning more buckets than this skip the cache.
const HOT_BUCKET_LOOKUP_LIMIT: usize = 288;

fn to_std(d: chrono::Duration) -> Duration {
    d.to_std().unwrap_or_default()
}

pub struct TierRouter {
    tiers: Tiers,
    circuits: Arc<TierCircuits>,
    timeouts: TierTimeouts,
    cache: Arc<CacheManager>,
    buffer: Arc<WriteBuffer>,
    registry: Arc<NodeRegistry>,
    retention: RetentionPolicy,
    cache_config: CacheConfig,
    rules: QualityRules,
    backfills: TaskTracker,
}

impl TierRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tiers: Tiers,
        circuits: Arc<TierCircuits>,
        timeouts: TierTimeouts,
        cache: Arc<CacheManager>,
        buffer: Arc<WriteBuffer>,
        registry: Arc<NodeRegistry>,
        retention: RetentionPolicy,
        cache_config: CacheConfig,
        rules: QualityRules,
    ) -> Self {
        Self {
            tiers,
            circuits,
            timeouts,
            cache,
            buffer,
            registry,
            retention,
            cache_config,
            rules,
            backfills: TaskTracker::new(),
        }
    }

    fn warm_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.retention.warm()
    }

    fn hot_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.retention.hot()
    }

    /// Readings of `node_id` in the buffer but not yet in Warm make Warm
    /// this far behind.
    fn buffer_lag(&self, node_id: &str, now: DateTime<Utc>) -> Duration {
        self.buffer
            .oldest_unflushed(node_id)
            .map(|at| to_std(now - at))
            .unwrap_or_default()
    }

    /// How far short of the requested end the archive's answer stops.
    fn cold_lag(rows: &[SensorReading], range: TimeRange, now: DateTime<Utc>) -> Duration {
        let horizon = range.end.min(now);
        let newest = rows.iter().map(|r| r.timestamp).max().unwrap_or(range.start);
        to_std(horizon - newest)
    }

    fn served<T>(&self, data: T, tier: Tier, staleness: Duration, degraded: bool) -> ReadResponse<T> {
        crate::metrics::record_read_served(tier.as_str(), degraded);
        let span = tracing::Span::current();
        span.record("tier", tier.as_str());
        span.record("degraded", degraded);
        ReadResponse {
            data,
            tier,
            staleness,
            degraded,
        }
    }

    async fn series_call<T, F, Fut>(
        &self,
        tier: Tier,
        operation: &'static str,
        f: F,
    ) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, crate::storage::traits::StorageError>>,
    {
        let budget = match tier {
            Tier::Hot => self.timeouts.hot(),
            Tier::Warm => self.timeouts.warm(),
            Tier::Cold => self.timeouts.cold(),
        };
        guarded(self.circuits.for_tier(tier), tier, operation, budget, f)
            .await
            .map_err(|e| EngineError::from_tier(tier, e))
    }

    /// Cold calls also stop when the caller cancels.
    async fn cold_call<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, crate::storage::traits::StorageError>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Cancelled(format!("cold {}", operation))),
            result = self.series_call(Tier::Cold, operation, f) => result,
        }
    }

    async fn warm_range(&self, node_id: &str, range: TimeRange) -> Result<Vec<SensorReading>, EngineError> {
        let warm = Arc::clone(&self.tiers.warm);
        self.series_call(Tier::Warm, "range_query", || async move { warm.range_query(node_id, range).await })
            .await
    }

    async fn cold_range(
        &self,
        node_id: &str,
        range: TimeRange,
        cancel: &CancellationToken,
    ) -> Result<Vec<SensorReading>, EngineError> {
        let cold = Arc::clone(&self.tiers.cold);
        self.cold_call("range_query", cancel, || async move { cold.range_query(node_id, range).await })
            .await
    }

    // ---------------------------------------------------------------------
    // Back-fill
    // ---------------------------------------------------------------------

    fn backfill_hot<T>(&self, key: CacheKey, value: T, ttl: Duration, reservation: Reservation)
    where
        T: serde::Serialize + Send + Sync + 'static,
    {
        let cache = Arc::clone(&self.cache);
        self.backfills.spawn(async move {
            match cache.set_reserved(&key, &value, ttl, reservation).await {
                Ok(true) => crate::metrics::record_backfill("hot", "stored"),
                Ok(false) => {
                    debug!(key = %key, "Back-fill superseded by a newer write");
                    crate::metrics::record_backfill("hot", "superseded");
                }
                Err(e) => {
                    debug!(key = %key, error = %e, "Hot back-fill failed");
                    crate::metrics::record_backfill("hot", "failed");
                }
            }
        });
    }

    /// Copy rows served by Cold back into Warm, limited to the Warm
    /// retention window.
    fn backfill_warm(&self, node_id: &str, rows: &[SensorReading], now: DateTime<Utc>) {
        let cutoff = self.warm_cutoff(now);
        let rows: Vec<SensorReading> = rows.iter().filter(|r| r.timestamp >= cutoff).cloned().collect();
        if rows.is_empty() {
            return;
        }
        let warm = Arc::clone(&self.tiers.warm);
        let circuits = Arc::clone(&self.circuits);
        let cache = Arc::clone(&self.cache);
        let budget = self.timeouts.warm();
        let node_id = node_id.to_string();
        self.backfills.spawn(async move {
            let to_write = rows.clone();
            let result = guarded(&circuits.warm, Tier::Warm, "backfill_upsert", budget, || async move {
                warm.upsert(&to_write).await
            })
            .await;
            match result {
                Ok(written) => {
                    let timestamps: Vec<_> = rows.iter().map(|r| r.timestamp).collect();
                    cache.invalidate_readings(&node_id, &timestamps).await;
                    debug!(node_id = %node_id, rows = written.written, "Warm back-filled from Cold");
                    crate::metrics::record_backfill("warm", "stored");
                }
                Err(e) => {
                    debug!(node_id = %node_id, error = %e, "Warm back-fill failed");
                    crate::metrics::record_backfill("warm", "failed");
                }
            }
        });
    }

    /// Wait until every back-fill started so far has finished.
    pub async fn settle(&self) {
        self.backfills.close();
        self.backfills.wait().await;
        self.backfills.reopen();
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Accept one reading.
    ///
    /// Fails only with `Backpressure` when the buffer is full. A Hot-tier
    /// failure during write-through is logged; the reading is still queued.
    #[tracing::instrument(skip(self, reading), fields(node_id = %reading.node_id))]
    pub async fn write(&self, reading: SensorReading) -> Result<WriteAck, EngineError> {
        let reading = reading.normalized();
        let enqueued = self.buffer.enqueue(reading.clone())?;

        let observation = self.registry.observe(&reading);
        if let Some(violation) = &observation.violation {
            crate::metrics::record_quality_violation(violation.kind.label());
            warn!(node_id = %reading.node_id, violation = %violation, "Data quality violation at ingestion");
        }

        let mut cached_latest = false;
        if observation.newest {
            let key = CacheKey::latest(&reading.node_id);
            match self.cache.set(&key, &reading, self.cache_config.latest_ttl()).await {
                Ok(stored) => cached_latest = stored,
                Err(e) => debug!(node_id = %reading.node_id, error = %e, "Latest write-through failed"),
            }
        }

        if let Some(reason) = enqueued.flush_due {
            // Detached; the per-node flush lock orders it with other flushes.
            drop(self.buffer.spawn_flush(reading.node_id.clone(), reason));
        }
        crate::metrics::record_ingested(1);

        Ok(WriteAck {
            level: enqueued.level,
            flush_started: enqueued.flush_due,
            cached_latest,
        })
    }

    // ---------------------------------------------------------------------
    // Raw reads
    // ---------------------------------------------------------------------

    /// Raw readings of one node in `range`.
    pub async fn read(
        &self,
        node_id: &str,
        range: TimeRange,
        freshness: Freshness,
    ) -> Result<ReadResponse<Vec<SensorReading>>, EngineError> {
        self.read_with_cancel(node_id, range, freshness, &CancellationToken::new())
            .await
    }

    /// As [`read`](Self::read); `cancel` aborts a pending Cold query.
    #[tracing::instrument(skip(self, cancel), fields(tier, degraded))]
    pub async fn read_with_cancel(
        &self,
        node_id: &str,
        range: TimeRange,
        freshness: Freshness,
        cancel: &CancellationToken,
    ) -> Result<ReadResponse<Vec<SensorReading>>, EngineError> {
        let now = Utc::now();
        if range.is_empty() {
            return Ok(self.served(Vec::new(), Tier::Warm, Duration::ZERO, false));
        }
        if range.start < self.warm_cutoff(now) {
            return self.read_history(node_id, range, cancel, now).await;
        }

        let mut failures = Failures::default();
        let key = CacheKey::range(node_id, range);

        if freshness.uses_hot() {
            match self.cache.get_value::<Vec<SensorReading>>(&key).await {
                Ok(Some((rows, entry))) => {
                    let age = to_std(entry.age(now));
                    if freshness.accepts(age) {
                        return Ok(self.served(rows, Tier::Hot, age, false));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(node_id = %node_id, error = %e, "Hot tier unavailable, reading through");
                    failures.push(Tier::Hot, e);
                }
            }
        }

        let cacheable = range.start >= self.hot_cutoff(now);
        let reservation = self.cache.reserve();

        let mut warm_empty = false;
        match self.warm_range(node_id, range).await {
            Ok(rows) if !rows.is_empty() => {
                if cacheable {
                    self.backfill_hot(key, rows.clone(), self.cache_config.range_ttl(), reservation);
                }
                let staleness = self.buffer_lag(node_id, now);
                return Ok(self.served(rows, Tier::Warm, staleness, failures.any()));
            }
            Ok(_) => warm_empty = true,
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "Warm read failed, falling back to Cold");
                failures.push(Tier::Warm, e);
            }
        }

        match self.cold_range(node_id, range, cancel).await {
            Ok(rows) => {
                if !rows.is_empty() {
                    self.backfill_warm(node_id, &rows, now);
                    if cacheable {
                        self.backfill_hot(key, rows.clone(), self.cache_config.range_ttl(), reservation);
                    }
                }
                let staleness = Self::cold_lag(&rows, range, now);
                Ok(self.served(rows, Tier::Cold, staleness, failures.any()))
            }
            Err(e @ EngineError::Cancelled(_)) => Err(e),
            Err(e) if warm_empty => {
                // Warm answered, just with nothing.
                warn!(node_id = %node_id, error = %e, "Cold read failed after empty Warm answer");
                let staleness = self.buffer_lag(node_id, now);
                Ok(self.served(Vec::new(), Tier::Warm, staleness, true))
            }
            Err(e) => {
                failures.push(Tier::Cold, e);
                Err(EngineError::AllTiersUnavailable {
                    node_id: node_id.to_string(),
                    attempts: failures.render(),
                })
            }
        }
    }

    /// Ranges reaching past Warm retention: Cold first, Warm as fallback.
    async fn read_history(
        &self,
        node_id: &str,
        range: TimeRange,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<ReadResponse<Vec<SensorReading>>, EngineError> {
        let mut failures = Failures::default();
        match self.cold_range(node_id, range, cancel).await {
            Ok(rows) => {
                let staleness = Self::cold_lag(&rows, range, now);
                return Ok(self.served(rows, Tier::Cold, staleness, false));
            }
            Err(e @ EngineError::Cancelled(_)) => return Err(e),
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "Cold history read failed, trying Warm");
                failures.push(Tier::Cold, e);
            }
        }
        match self.warm_range(node_id, range).await {
            Ok(rows) => {
                let staleness = self.buffer_lag(node_id, now);
                Ok(self.served(rows, Tier::Warm, staleness, true))
            }
            Err(e) => {
                failures.push(Tier::Warm, e);
                Err(EngineError::AllTiersUnavailable {
                    node_id: node_id.to_string(),
                    attempts: failures.render(),
                })
            }
        }
    }

    // ---------------------------------------------------------------------
    // Latest value
    // ---------------------------------------------------------------------

    /// Most recent reading of a node.
    ///
    /// `NotFound` when every tier answered and none knows the node;
    /// `AllTiersUnavailable` when no tier that answered had it and at least
    /// one failed.
    #[tracing::instrument(skip(self), fields(tier, degraded))]
    pub async fn get_latest(
        &self,
        node_id: &str,
        freshness: Freshness,
    ) -> Result<ReadResponse<SensorReading>, EngineError> {
        let now = Utc::now();
        let mut failures = Failures::default();
        let key = CacheKey::latest(node_id);

        if freshness.uses_hot() {
            match self.cache.get_value::<SensorReading>(&key).await {
                Ok(Some((reading, entry))) => {
                    let age = to_std(entry.age(now));
                    if freshness.accepts(age) {
                        return Ok(self.served(reading, Tier::Hot, age, false));
                    }
                }
                Ok(None) => {}
                Err(e) => failures.push(Tier::Hot, e),
            }
        }

        let reservation = self.cache.reserve();
        let warm = Arc::clone(&self.tiers.warm);
        match self
            .series_call(Tier::Warm, "latest", || async move { warm.latest(node_id).await })
            .await
        {
            Ok(Some(reading)) => {
                self.backfill_hot(key, reading.clone(), self.cache_config.latest_ttl(), reservation);
                let staleness = self.buffer_lag(node_id, now);
                return Ok(self.served(reading, Tier::Warm, staleness, failures.any()));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "Warm latest failed, falling back to Cold");
                failures.push(Tier::Warm, e);
            }
        }

        let cold = Arc::clone(&self.tiers.cold);
        let cancel = CancellationToken::new();
        match self
            .cold_call("latest", &cancel, || async move { cold.latest(node_id).await })
            .await
        {
            Ok(Some(reading)) => {
                self.backfill_warm(node_id, std::slice::from_ref(&reading), now);
                self.backfill_hot(key, reading.clone(), self.cache_config.latest_ttl(), reservation);
                let staleness = to_std(now - reading.timestamp);
                Ok(self.served(reading, Tier::Cold, staleness, failures.any()))
            }
            Ok(None) if !failures.failed(Tier::Warm) => Err(EngineError::NotFound {
                what: "reading",
                id: node_id.to_string(),
            }),
            Ok(None) => Err(EngineError::AllTiersUnavailable {
                node_id: node_id.to_string(),
                attempts: failures.render(),
            }),
            Err(e) => {
                failures.push(Tier::Cold, e);
                Err(EngineError::AllTiersUnavailable {
                    node_id: node_id.to_string(),
                    attempts: failures.render(),
                })
            }
        }
    }

    // ---------------------------------------------------------------------
    // Aggregates
    // ---------------------------------------------------------------------

    fn bucket_staleness(buckets: &[StoredBucket], now: DateTime<Utc>) -> Duration {
        buckets
            .iter()
            .map(|b| b.computed_at)
            .min()
            .map(|oldest| to_std(now - oldest))
            .unwrap_or_default()
    }

    fn finish_buckets(mut buckets: Vec<StoredBucket>) -> Vec<StoredBucket> {
        buckets.retain(|b| !b.bucket.is_empty());
        buckets.sort_by_key(|b| b.bucket.bucket_start);
        buckets
    }

    /// Compute the buckets at `starts` directly from raw rows.
    fn rollup_starts(
        &self,
        node_id: &str,
        window: WindowSize,
        starts: &[DateTime<Utc>],
        rows: &[SensorReading],
        now: DateTime<Utc>,
    ) -> Vec<StoredBucket> {
        let screened = quality::screen(&self.rules, rows, None);
        starts
            .iter()
            .map(|&start| StoredBucket {
                bucket: AggregateBucket::from_readings(node_id, window, start, &screened.accepted),
                computed_at: now,
            })
            .collect()
    }

    async fn hot_buckets(
        &self,
        node_id: &str,
        window: WindowSize,
        starts: &[DateTime<Utc>],
        freshness: Freshness,
        now: DateTime<Utc>,
        failures: &mut Failures,
    ) -> Option<Vec<StoredBucket>> {
        let mut found = Vec::with_capacity(starts.len());
        for &start in starts {
            let key = CacheKey::bucket(node_id, window, start);
            match self.cache.get_value::<StoredBucket>(&key).await {
                Ok(Some((bucket, entry))) if freshness.accepts(to_std(entry.age(now))) => found.push(bucket),
                Ok(_) => return None,
                Err(e) => {
                    failures.push(Tier::Hot, e);
                    return None;
                }
            }
        }
        Some(found)
    }

    async fn warm_buckets(
        &self,
        node_id: &str,
        window: WindowSize,
        range: TimeRange,
        starts: &[DateTime<Utc>],
        now: DateTime<Utc>,
    ) -> Result<Vec<StoredBucket>, EngineError> {
        let warm = Arc::clone(&self.tiers.warm);
        let stored = self
            .series_call(Tier::Warm, "bucket_range", || async move {
                warm.bucket_range(node_id, window, range).await
            })
            .await?;

        let mut by_start: BTreeMap<DateTime<Utc>, StoredBucket> =
            stored.into_iter().map(|b| (b.bucket.bucket_start, b)).collect();
        let missing: Vec<DateTime<Utc>> = starts.iter().copied().filter(|s| !by_start.contains_key(s)).collect();
        if !missing.is_empty() {
            let span = TimeRange::new(
                missing.first().copied().unwrap_or(range.start),
                missing.last().map(|s| *s + window.duration()).unwrap_or(range.end),
            );
            let rows = self.warm_range(node_id, span).await?;
            for b in self.rollup_starts(node_id, window, &missing, &rows, now) {
                by_start.insert(b.bucket.bucket_start, b);
            }
        }
        Ok(by_start.into_values().collect())
    }

    /// Rolled-up buckets of `window` overlapping `range`.
    ///
    /// Materialized buckets are preferred; gaps are computed from raw rows
    /// on the fly. Each bucket keeps its `computed_at`.
    #[tracing::instrument(skip(self), fields(tier, degraded))]
    pub async fn read_buckets(
        &self,
        node_id: &str,
        window: WindowSize,
        range: TimeRange,
        freshness: Freshness,
    ) -> Result<ReadResponse<Vec<StoredBucket>>, EngineError> {
        let now = Utc::now();
        let starts = window.starts_in(range);
        if starts.is_empty() {
            return Ok(self.served(Vec::new(), Tier::Warm, Duration::ZERO, false));
        }
        let mut failures = Failures::default();
        let within_warm = range.start >= self.warm_cutoff(now);

        if within_warm && freshness.uses_hot() && starts.len() <= HOT_BUCKET_LOOKUP_LIMIT {
            if let Some(found) = self.hot_buckets(node_id, window, &starts, freshness, now, &mut failures).await {
                let staleness = Self::bucket_staleness(&found, now);
                return Ok(self.served(Self::finish_buckets(found), Tier::Hot, staleness, false));
            }
        }

        if within_warm {
            match self.warm_buckets(node_id, window, range, &starts, now).await {
                Ok(found) => {
                    let staleness = Self::bucket_staleness(&found, now);
                    return Ok(self.served(Self::finish_buckets(found), Tier::Warm, staleness, failures.any()));
                }
                Err(e) => {
                    warn!(node_id = %node_id, window = %window, error = %e, "Warm aggregates failed, rolling up from Cold");
                    failures.push(Tier::Warm, e);
                }
            }
        }

        match self.cold_range(node_id, range, &CancellationToken::new()).await {
            Ok(rows) => {
                let found = self.rollup_starts(node_id, window, &starts, &rows, now);
                let staleness = Self::cold_lag(&rows, range, now);
                Ok(self.served(Self::finish_buckets(found), Tier::Cold, staleness, failures.any()))
            }
            Err(e) if !within_warm => {
                // History read: Warm may still hold the recent part.
                failures.push(Tier::Cold, e);
                match self.warm_buckets(node_id, window, range, &starts, now).await {
                    Ok(found) => {
                        let staleness = Self::bucket_staleness(&found, now);
                        Ok(self.served(Self::finish_buckets(found), Tier::Warm, staleness, true))
                    }
                    Err(e) => {
                        failures.push(Tier::Warm, e);
                        Err(EngineError::AllTiersUnavailable {
                            node_id: node_id.to_string(),
                            attempts: failures.render(),
                        })
                    }
                }
            }
            Err(e) => {
                failures.push(Tier::Cold, e);
                Err(EngineError::AllTiersUnavailable {
                    node_id: node_id.to_string(),
                    attempts: failures.render(),
                })
            }
        }
    }

    /// Plain buckets, for callers that do not need `computed_at`.
    pub async fn get_range(
        &self,
        node_id: &str,
        range: TimeRange,
        window: WindowSize,
    ) -> Result<ReadResponse<Vec<AggregateBucket>>, EngineError> {
        let response = self.read_buckets(node_id, window, range, Freshness::Any).await?;
        Ok(response.map(|buckets| buckets.into_iter().map(|b| b.bucket).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::resilience::circuit_breaker::CircuitConfig;
    use crate::resilience::dead_letter::DeadLetterLog;
    use crate::storage::memory::{MemoryHotStore, MemorySeriesStore};
    use crate::storage::traits::SeriesTier;
    use crate::write_buffer::FlushReason;

    struct Rig {
        router: TierRouter,
        buffer: Arc<WriteBuffer>,
        warm: Arc<MemorySeriesStore>,
        cold: Arc<MemorySeriesStore>,
    }

    fn rig() -> Rig {
        let hot = Arc::new(MemoryHotStore::new());
        let warm = Arc::new(MemorySeriesStore::warm());
        let cold = Arc::new(MemorySeriesStore::cold());
        let circuits = Arc::new(TierCircuits::uniform(CircuitConfig::test()));
        let timeouts = TierTimeouts::default();
        let cache = Arc::new(CacheManager::new(
            hot.clone(),
            Arc::clone(&circuits),
            &CacheConfig::default(),
            timeouts.hot(),
            Duration::from_secs(24 * 3600),
        ));
        let buffer = Arc::new(WriteBuffer::new(
            BufferConfig::default(),
            warm.clone(),
            Arc::clone(&circuits),
            timeouts.warm(),
            Arc::clone(&cache),
            Arc::new(DeadLetterLog::in_memory(100)),
        ));
        let router = TierRouter::new(
            Tiers::new(hot, warm.clone(), cold.clone()),
            circuits,
            timeouts,
            cache,
            Arc::clone(&buffer),
            Arc::new(NodeRegistry::new()),
            RetentionPolicy::default(),
            CacheConfig::default(),
            QualityRules::default(),
        );
        Rig {
            router,
            buffer,
            warm,
            cold,
        }
    }

    fn reading(mins_ago: i64, flow: f64) -> SensorReading {
        SensorReading::new("n1", Utc::now() - chrono::Duration::minutes(mins_ago))
            .with_flow(flow)
            .with_pressure(3.0)
            .with_temperature(10.0)
    }

    fn last_hours(h: i64) -> TimeRange {
        TimeRange::trailing(chrono::Duration::hours(h), Utc::now() + chrono::Duration::seconds(1))
    }

    #[tokio::test]
    async fn test_write_then_read_after_flush() {
        let rig = rig();
        let ack = rig.router.write(reading(5, 1.5)).await.unwrap();
        assert!(ack.cached_latest);
        assert!(ack.flush_started.is_none());

        rig.buffer.flush_node("n1", FlushReason::Manual).await.unwrap();
        let resp = rig.router.read("n1", last_hours(1), Freshness::Any).await.unwrap();
        assert_eq!(resp.tier, Tier::Warm);
        assert_eq!(resp.data.len(), 1);
        assert!(!resp.degraded);
    }

    #[tokio::test]
    async fn test_warm_read_is_backfilled_into_hot() {
        let rig = rig();
        rig.warm.upsert(&[reading(10, 1.0), reading(5, 2.0)]).await.unwrap();
        let range = last_hours(1);

        let first = rig.router.read("n1", range, Freshness::Any).await.unwrap();
        assert_eq!(first.tier, Tier::Warm);
        rig.router.settle().await;

        let second = rig.router.read("n1", range, Freshness::Any).await.unwrap();
        assert_eq!(second.tier, Tier::Hot);
        assert_eq!(second.data, first.data);

        let bypass = rig.router.read("n1", range, Freshness::Bypass).await.unwrap();
        assert_eq!(bypass.tier, Tier::Warm);
    }

    #[tokio::test]
    async fn test_empty_warm_falls_back_to_cold() {
        let rig = rig();
        rig.cold.upsert(&[reading(30, 4.0)]).await.unwrap();

        let resp = rig.router.read("n1", last_hours(1), Freshness::Any).await.unwrap();
        assert_eq!(resp.tier, Tier::Cold);
        assert_eq!(resp.data.len(), 1);
        assert!(!resp.degraded);

        rig.router.settle().await;
        assert_eq!(rig.warm.len(), 1, "Cold rows are back-filled into Warm");
    }

    #[tokio::test]
    async fn test_latest_prefers_write_through() {
        let rig = rig();
        rig.router.write(reading(2, 7.0)).await.unwrap();
        let latest = rig.router.get_latest("n1", Freshness::Any).await.unwrap();
        assert_eq!(latest.tier, Tier::Hot);
        assert_eq!(latest.data.flow_rate, 7.0);

        // An older reading arriving late does not replace it
        let ack = rig.router.write(reading(20, 1.0)).await.unwrap();
        assert!(!ack.cached_latest);
        let latest = rig.router.get_latest("n1", Freshness::Any).await.unwrap();
        assert_eq!(latest.data.flow_rate, 7.0);
    }

    #[tokio::test]
    async fn test_latest_unknown_node() {
        let rig = rig();
        let err = rig.router.get_latest("nope", Freshness::Any).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_history_reads_go_to_cold() {
        let rig = rig();
        let old = SensorReading::new("n1", Utc::now() - chrono::Duration::days(200)).with_flow(3.0);
        rig.cold.upsert(std::slice::from_ref(&old)).await.unwrap();

        let range = TimeRange::new(old.timestamp - chrono::Duration::hours(1), old.timestamp + chrono::Duration::hours(1));
        let resp = rig.router.read("n1", range, Freshness::Any).await.unwrap();
        assert_eq!(resp.tier, Tier::Cold);
        assert_eq!(resp.data, vec![old]);
        rig.router.settle().await;
        assert!(rig.warm.is_empty(), "history is not copied into Warm");
    }

    #[tokio::test]
    async fn test_buckets_fill_gaps_from_raw_rows() {
        let rig = rig();
        rig.warm.upsert(&[reading(10, 1.0), reading(9, 3.0)]).await.unwrap();

        let resp = rig.router.get_range("n1", last_hours(2), WindowSize::Hour).await.unwrap();
        assert_eq!(resp.tier, Tier::Warm);
        let total: u64 = resp.data.iter().map(|b| b.count()).sum();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_cancelled_cold_read() {
        let rig = rig();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = rig
            .router
            .read_with_cancel("n1", last_hours(1), Freshness::Bypass, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled(_)));
    }
}
