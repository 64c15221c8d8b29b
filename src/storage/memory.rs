// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory tier backends.
//!
//! Used when no backend URL is configured and throughout the test suites.
//! Both honour the same contracts as the Redis and SQL backends: expiry on
//! the Hot store, idempotent `(node_id, timestamp)` upsert on series stores.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;

use super::traits::{BatchWriteResult, HotTier, SeriesTier, StorageError, StoredBucket, Tier, TierClient};
use crate::aggregation::bucket::{AggregateBucket, WindowSize};
use crate::reading::{SensorReading, TimeRange};

/// DashMap-backed key-value store with per-key expiry.
pub struct MemoryHotStore {
    data: DashMap<String, (String, Option<Instant>)>,
}

impl MemoryHotStore {
    #[must_use]
    pub fn new() -> Self {
        Self { data: DashMap::new() }
    }

    /// Keys currently held, including ones that expired but were not yet read.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for MemoryHotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TierClient for MemoryHotStore {
    fn tier(&self) -> Tier {
        Tier::Hot
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[async_trait]
impl HotTier for MemoryHotStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();
        let expired = match self.data.get(key) {
            None => return Ok(None),
            Some(entry) => match entry.value() {
                (_, Some(deadline)) if *deadline <= now => true,
                (value, _) => return Ok(Some(value.clone())),
            },
        };
        if expired {
            self.data.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        let deadline = if ttl.is_zero() { None } else { Some(Instant::now() + ttl) };
        self.data.insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        let now = Instant::now();
        Ok(self.data.get(key).and_then(|entry| match entry.value().1 {
            Some(deadline) if deadline > now => Some(deadline - now),
            _ => None,
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError> {
        for key in keys {
            self.data.remove(key);
        }
        Ok(())
    }
}

type RowKey = (String, i64);
type BucketKey = (String, WindowSize, i64);

/// Ordered in-memory time-series store.
///
/// Serves as Warm or Cold depending on construction.
pub struct MemorySeriesStore {
    tier: Tier,
    rows: RwLock<BTreeMap<RowKey, SensorReading>>,
    buckets: RwLock<BTreeMap<BucketKey, StoredBucket>>,
}

impl MemorySeriesStore {
    #[must_use]
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            rows: RwLock::new(BTreeMap::new()),
            buckets: RwLock::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn warm() -> Self {
        Self::new(Tier::Warm)
    }

    #[must_use]
    pub fn cold() -> Self {
        Self::new(Tier::Cold)
    }

    /// Total rows across all nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    #[must_use]
    pub fn contains(&self, node_id: &str, ts: DateTime<Utc>) -> bool {
        self.rows.read().contains_key(&(node_id.to_string(), ts.timestamp_millis()))
    }

    fn node_rows(&self, node_id: &str, range: TimeRange) -> Vec<SensorReading> {
        if range.is_empty() {
            return Vec::new();
        }
        let lo = (node_id.to_string(), range.start_ms());
        let hi = (node_id.to_string(), range.end_ms());
        self.rows.read().range(lo..hi).map(|(_, r)| r.clone()).collect()
    }
}

#[async_trait]
impl TierClient for MemorySeriesStore {
    fn tier(&self) -> Tier {
        self.tier
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[async_trait]
impl SeriesTier for MemorySeriesStore {
    async fn upsert(&self, rows: &[SensorReading]) -> Result<BatchWriteResult, StorageError> {
        let mut data = self.rows.write();
        for row in rows {
            let key = row.key();
            data.insert((key.node_id, key.timestamp_ms), row.clone());
        }
        Ok(BatchWriteResult {
            batch_id: uuid::Uuid::new_v4().to_string(),
            written: rows.len(),
        })
    }

    async fn range_query(&self, node_id: &str, range: TimeRange) -> Result<Vec<SensorReading>, StorageError> {
        Ok(self.node_rows(node_id, range))
    }

    async fn latest(&self, node_id: &str) -> Result<Option<SensorReading>, StorageError> {
        let lo = (node_id.to_string(), i64::MIN);
        let hi = (node_id.to_string(), i64::MAX);
        Ok(self.rows.read().range(lo..=hi).next_back().map(|(_, r)| r.clone()))
    }

    async fn delete_older_than(&self, node_id: &str, older_than: DateTime<Utc>) -> Result<u64, StorageError> {
        let lo = (node_id.to_string(), i64::MIN);
        let hi = (node_id.to_string(), older_than.timestamp_millis());
        let mut data = self.rows.write();
        let doomed: Vec<RowKey> = data.range(lo..hi).map(|(k, _)| k.clone()).collect();
        for key in &doomed {
            data.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn count_range(&self, node_id: &str, range: TimeRange) -> Result<u64, StorageError> {
        if range.is_empty() {
            return Ok(0);
        }
        let lo = (node_id.to_string(), range.start_ms());
        let hi = (node_id.to_string(), range.end_ms());
        Ok(self.rows.read().range(lo..hi).count() as u64)
    }

    async fn node_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut ids: Vec<String> = self.rows.read().keys().map(|(node, _)| node.clone()).collect();
        ids.dedup();
        Ok(ids)
    }

    async fn upsert_bucket(&self, bucket: &AggregateBucket, computed_at: DateTime<Utc>) -> Result<(), StorageError> {
        let key = (bucket.node_id.clone(), bucket.window, bucket.bucket_start.timestamp_millis());
        self.buckets.write().insert(
            key,
            StoredBucket {
                bucket: bucket.clone(),
                computed_at,
            },
        );
        Ok(())
    }

    async fn bucket_range(
        &self,
        node_id: &str,
        window: WindowSize,
        range: TimeRange,
    ) -> Result<Vec<StoredBucket>, StorageError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let lo = (node_id.to_string(), window, range.start_ms());
        let hi = (node_id.to_string(), window, range.end_ms());
        Ok(self.buckets.read().range(lo..hi).map(|(_, b)| b.clone()).collect())
    }
}
