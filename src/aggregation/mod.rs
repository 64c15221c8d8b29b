// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Continuous aggregation.
//!
//! [`ContinuousAggregator::refresh_bucket`] recomputes one bucket from the
//! raw Warm rows in its span and overwrites whatever was stored before.
//! Nothing is ever incremented in place, so repeated or overlapping
//! refreshes converge on the same bucket. Each stored bucket carries its
//! `computed_at` so readers can see how old it is.

pub mod bucket;

pub use bucket::{AggregateBucket, MetricStats, WindowSize};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheManager};
use crate::config::QualityRules;
use crate::error::EngineError;
use crate::quality;
use crate::reading::{SensorReading, TimeRange};
use crate::resilience::circuit_breaker::TierCircuits;
use crate::resilience::guarded;
use crate::storage::traits::{SeriesTier, StoredBucket, Tier};

/// Per-node rollup kept in the Hot tier by the cache refresh job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub node_id: String,
    pub latest: Option<SensorReading>,
    /// Trailing hour ending at `computed_at`
    pub last_hour: AggregateBucket,
    /// Trailing day ending at `computed_at`
    pub last_day: AggregateBucket,
    pub computed_at: DateTime<Utc>,
}

pub struct ContinuousAggregator {
    warm: Arc<dyn SeriesTier>,
    circuits: Arc<TierCircuits>,
    warm_timeout: Duration,
    cache: Arc<CacheManager>,
    rules: QualityRules,
    aggregate_ttl: Duration,
}

impl ContinuousAggregator {
    pub fn new(
        warm: Arc<dyn SeriesTier>,
        circuits: Arc<TierCircuits>,
        warm_timeout: Duration,
        cache: Arc<CacheManager>,
        rules: QualityRules,
        aggregate_ttl: Duration,
    ) -> Self {
        Self {
            warm,
            circuits,
            warm_timeout,
            cache,
            rules,
            aggregate_ttl,
        }
    }

    async fn warm_rows(&self, node_id: &str, range: TimeRange) -> Result<Vec<SensorReading>, EngineError> {
        let warm = Arc::clone(&self.warm);
        let rows = guarded(&self.circuits.warm, Tier::Warm, "range_query", self.warm_timeout, || async move {
            warm.range_query(node_id, range).await
        })
        .await?;
        Ok(rows)
    }

    /// Cumulative total of the last accepted reading in the window-length
    /// span before `start`, so a counter decrease across the bucket edge is
    /// caught.
    async fn total_before(
        &self,
        node_id: &str,
        window: WindowSize,
        start: DateTime<Utc>,
    ) -> Result<Option<f64>, EngineError> {
        let before = TimeRange::new(start - window.duration(), start);
        let rows = self.warm_rows(node_id, before).await?;
        let screened = quality::screen(&self.rules, &rows, None);
        Ok(screened
            .accepted
            .iter()
            .max_by_key(|r| r.timestamp)
            .map(|r| r.total_flow))
    }

    /// Recompute and store the bucket of `window` containing `bucket_start`.
    #[tracing::instrument(skip(self), fields(rows))]
    pub async fn refresh_bucket(
        &self,
        node_id: &str,
        window: WindowSize,
        bucket_start: DateTime<Utc>,
    ) -> Result<StoredBucket, EngineError> {
        let start = window.align(bucket_start);
        let reservation = self.cache.reserve();

        let rows = self.warm_rows(node_id, window.span(start)).await?;
        tracing::Span::current().record("rows", rows.len());
        let seed = if rows.is_empty() {
            None
        } else {
            self.total_before(node_id, window, start).await?
        };
        let screened = quality::screen(&self.rules, &rows, seed);
        if !screened.violations.is_empty() {
            debug!(
                node_id = %node_id,
                excluded = screened.violations.len(),
                "Readings excluded from aggregate"
            );
        }

        let stored = StoredBucket {
            bucket: AggregateBucket::from_readings(node_id, window, start, &screened.accepted),
            computed_at: Utc::now(),
        };

        let warm = Arc::clone(&self.warm);
        let to_store = stored.clone();
        guarded(&self.circuits.warm, Tier::Warm, "upsert_bucket", self.warm_timeout, || async move {
            warm.upsert_bucket(&to_store.bucket, to_store.computed_at).await
        })
        .await?;

        let key = CacheKey::bucket(node_id, window, start);
        if let Err(e) = self
            .cache
            .set_reserved(&key, &stored, self.aggregate_ttl, reservation)
            .await
        {
            debug!(key = %key, error = %e, "Could not cache refreshed bucket");
        }
        crate::metrics::record_aggregates_refreshed(window.as_str(), 1);
        Ok(stored)
    }

    /// Refresh every bucket of `window` overlapping `range`.
    pub async fn refresh_range(
        &self,
        node_id: &str,
        window: WindowSize,
        range: TimeRange,
    ) -> Result<Vec<StoredBucket>, EngineError> {
        let mut out = Vec::new();
        for start in window.starts_in(range) {
            out.push(self.refresh_bucket(node_id, window, start).await?);
        }
        Ok(out)
    }

    /// Refresh all windows touched by `range`, finest first. Returns the
    /// number of buckets written.
    pub async fn refresh_all_windows(&self, node_id: &str, range: TimeRange) -> Result<usize, EngineError> {
        let mut written = 0;
        for window in WindowSize::ALL {
            written += self.refresh_range(node_id, window, range).await?.len();
        }
        Ok(written)
    }

    /// Materialized buckets, as stored.
    pub async fn stored_buckets(
        &self,
        node_id: &str,
        window: WindowSize,
        range: TimeRange,
    ) -> Result<Vec<StoredBucket>, EngineError> {
        let warm = Arc::clone(&self.warm);
        let buckets = guarded(&self.circuits.warm, Tier::Warm, "bucket_range", self.warm_timeout, || async move {
            warm.bucket_range(node_id, window, range).await
        })
        .await?;
        Ok(buckets)
    }

    /// Trailing hour/day summary of one node, computed from Warm.
    pub async fn summarize(&self, node_id: &str, now: DateTime<Utc>) -> Result<NodeSummary, EngineError> {
        let day = TimeRange::trailing(chrono::Duration::days(1), now);
        let rows = self.warm_rows(node_id, day).await?;
        let screened = quality::screen(&self.rules, &rows, None);
        if screened.accepted.is_empty() && !rows.is_empty() {
            warn!(node_id = %node_id, rows = rows.len(), "Every reading of the last day failed screening");
        }

        let latest = screened.accepted.iter().max_by_key(|r| r.timestamp).cloned();
        Ok(NodeSummary {
            node_id: node_id.to_string(),
            latest,
            last_hour: AggregateBucket::from_readings(
                node_id,
                WindowSize::Hour,
                now - chrono::Duration::hours(1),
                &screened.accepted,
            ),
            last_day: AggregateBucket::from_readings(node_id, WindowSize::Day, day.start, &screened.accepted),
            computed_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::resilience::circuit_breaker::CircuitConfig;
    use crate::storage::memory::{MemoryHotStore, MemorySeriesStore};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap()
    }

    fn reading(secs: i64, flow: f64, total: f64) -> SensorReading {
        SensorReading::new("n1", t0() + chrono::Duration::seconds(secs))
            .with_flow(flow)
            .with_pressure(4.0)
            .with_temperature(11.0)
            .with_total_flow(total)
    }

    fn setup() -> (ContinuousAggregator, Arc<MemorySeriesStore>, Arc<CacheManager>) {
        let warm = Arc::new(MemorySeriesStore::warm());
        let circuits = Arc::new(TierCircuits::uniform(CircuitConfig::test()));
        let cache = Arc::new(CacheManager::new(
            Arc::new(MemoryHotStore::new()),
            Arc::clone(&circuits),
            &CacheConfig::default(),
            Duration::from_secs(1),
            Duration::from_secs(3600),
        ));
        let agg = ContinuousAggregator::new(
            warm.clone(),
            circuits,
            Duration::from_secs(1),
            Arc::clone(&cache),
            QualityRules::default(),
            Duration::from_secs(600),
        );
        (agg, warm, cache)
    }

    #[tokio::test]
    async fn test_refresh_bucket_from_raw_rows() {
        let (agg, warm, _) = setup();
        warm.upsert(&[reading(0, 2.0, 10.0), reading(60, 4.0, 11.0), reading(400, 9.0, 12.0)])
            .await
            .unwrap();

        let stored = agg.refresh_bucket("n1", WindowSize::FiveMinutes, t0()).await.unwrap();
        assert_eq!(stored.bucket.count(), 2);
        assert_eq!(stored.bucket.flow_rate.avg, 3.0);
        assert_eq!(stored.bucket.consumption, 1.0);

        let persisted = warm
            .bucket_range("n1", WindowSize::FiveMinutes, WindowSize::FiveMinutes.span(t0()))
            .await
            .unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].bucket, stored.bucket);
    }

    #[tokio::test]
    async fn test_refresh_is_idempotent() {
        let (agg, warm, _) = setup();
        warm.upsert(&[reading(0, 2.0, 10.0), reading(30, 5.0, 10.5)]).await.unwrap();

        let a = agg.refresh_bucket("n1", WindowSize::Hour, t0()).await.unwrap();
        let b = agg.refresh_bucket("n1", WindowSize::Hour, t0()).await.unwrap();
        assert_eq!(
            serde_json::to_vec(&a.bucket).unwrap(),
            serde_json::to_vec(&b.bucket).unwrap()
        );
        assert!(b.computed_at >= a.computed_at);
    }

    #[tokio::test]
    async fn test_unaligned_start_is_aligned() {
        let (agg, warm, _) = setup();
        warm.upsert(&[reading(10, 1.0, 1.0)]).await.unwrap();
        let stored = agg
            .refresh_bucket("n1", WindowSize::Hour, t0() + chrono::Duration::minutes(17))
            .await
            .unwrap();
        assert_eq!(stored.bucket.bucket_start, t0());
    }

    #[tokio::test]
    async fn test_screened_rows_are_excluded() {
        let (agg, warm, _) = setup();
        warm.upsert(&[
            reading(0, 2.0, 10.0),
            reading(10, 2.0, 11.0).with_pressure(500.0),
            reading(20, 2.0, 12.0),
        ])
        .await
        .unwrap();
        let stored = agg.refresh_bucket("n1", WindowSize::FiveMinutes, t0()).await.unwrap();
        assert_eq!(stored.bucket.count(), 2);
    }

    #[tokio::test]
    async fn test_refreshed_bucket_is_cached() {
        let (agg, warm, cache) = setup();
        warm.upsert(&[reading(0, 2.0, 10.0)]).await.unwrap();
        agg.refresh_bucket("n1", WindowSize::Hour, t0()).await.unwrap();

        let (cached, _) = cache
            .get_value::<StoredBucket>(&CacheKey::bucket("n1", WindowSize::Hour, t0()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.bucket.count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_all_windows() {
        let (agg, warm, _) = setup();
        warm.upsert(&[reading(0, 1.0, 1.0), reading(600, 1.0, 2.0)]).await.unwrap();
        let range = TimeRange::new(t0(), t0() + chrono::Duration::minutes(15));
        // 3 five-minute buckets + 1 hour + 1 day
        assert_eq!(agg.refresh_all_windows("n1", range).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_summarize() {
        let (agg, warm, _) = setup();
        warm.upsert(&[reading(0, 1.0, 1.0), reading(1800, 3.0, 2.0)]).await.unwrap();
        let now = t0() + chrono::Duration::minutes(45);
        let summary = agg.summarize("n1", now).await.unwrap();
        assert_eq!(summary.latest.unwrap().timestamp, t0() + chrono::Duration::seconds(1800));
        assert_eq!(summary.last_hour.count(), 2);
        assert_eq!(summary.last_day.count(), 2);
    }

    #[tokio::test]
    async fn test_counter_decrease_across_bucket_edge_is_excluded() {
        let (agg, warm, _) = setup();
        warm.upsert(&[
            reading(-60, 2.0, 100.0),
            reading(0, 2.0, 90.0),
            reading(60, 2.0, 105.0),
        ])
        .await
        .unwrap();

        let stored = agg.refresh_bucket("n1", WindowSize::FiveMinutes, t0()).await.unwrap();
        assert_eq!(stored.bucket.count(), 1);
        assert_eq!(stored.bucket.total_flow.max, 105.0);
    }

    #[tokio::test]
    async fn test_counter_reset_at_bucket_edge_is_kept() {
        let (agg, warm, _) = setup();
        let mut reset = reading(0, 2.0, 1.0);
        reset.counter_reset = true;
        warm.upsert(&[reading(-60, 2.0, 100.0), reset, reading(60, 2.0, 3.0)])
            .await
            .unwrap();

        let stored = agg.refresh_bucket("n1", WindowSize::FiveMinutes, t0()).await.unwrap();
        assert_eq!(stored.bucket.count(), 2);
    }
}
