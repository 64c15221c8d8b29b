// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared fixtures: a fault-injecting tier wrapper and engine builders.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use hydro_sync::aggregation::{AggregateBucket, WindowSize};
use hydro_sync::storage::memory::{MemoryHotStore, MemorySeriesStore};
use hydro_sync::storage::traits::{BatchWriteResult, StoredBucket, TierClient};
use hydro_sync::{EngineConfig, HotTier, SensorReading, SeriesTier, StorageError, TelemetryEngine, Tier, Tiers, TimeRange};

/// Wraps a tier and fails or stalls its calls on demand.
///
/// `down` fails every call with `Unavailable`; `reject_writes` fails only
/// upserts; a non-zero delay sleeps before each call.
pub struct Chaos<S> {
    pub inner: Arc<S>,
    down: AtomicBool,
    reject_writes: AtomicBool,
    delay_ms: AtomicU64,
    calls: AtomicU64,
}

impl<S> Chaos<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner: Arc::new(inner),
            down: AtomicBool::new(false),
            reject_writes: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self, write: bool) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected outage".into()));
        }
        if write && self.reject_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: TierClient + 'static> TierClient for Chaos<S> {
    fn tier(&self) -> Tier {
        self.inner.tier()
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.enter(false).await?;
        self.inner.ping().await
    }
}

#[async_trait]
impl<S: HotTier + 'static> HotTier for Chaos<S> {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.enter(false).await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.enter(true).await?;
        self.inner.set(key, value, ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        self.enter(false).await?;
        self.inner.ttl(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.enter(true).await?;
        self.inner.delete(key).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError> {
        self.enter(true).await?;
        self.inner.delete_many(keys).await
    }
}

#[async_trait]
impl<S: SeriesTier + 'static> SeriesTier for Chaos<S> {
    async fn upsert(&self, rows: &[SensorReading]) -> Result<BatchWriteResult, StorageError> {
        self.enter(true).await?;
        self.inner.upsert(rows).await
    }

    async fn range_query(&self, node_id: &str, range: TimeRange) -> Result<Vec<SensorReading>, StorageError> {
        self.enter(false).await?;
        self.inner.range_query(node_id, range).await
    }

    async fn latest(&self, node_id: &str) -> Result<Option<SensorReading>, StorageError> {
        self.enter(false).await?;
        self.inner.latest(node_id).await
    }

    async fn delete_older_than(&self, node_id: &str, older_than: DateTime<Utc>) -> Result<u64, StorageError> {
        self.enter(true).await?;
        self.inner.delete_older_than(node_id, older_than).await
    }

    async fn count_range(&self, node_id: &str, range: TimeRange) -> Result<u64, StorageError> {
        self.enter(false).await?;
        self.inner.count_range(node_id, range).await
    }

    async fn node_ids(&self) -> Result<Vec<String>, StorageError> {
        self.enter(false).await?;
        self.inner.node_ids().await
    }

    async fn upsert_bucket(&self, bucket: &AggregateBucket, computed_at: DateTime<Utc>) -> Result<(), StorageError> {
        self.enter(true).await?;
        self.inner.upsert_bucket(bucket, computed_at).await
    }

    async fn bucket_range(
        &self,
        node_id: &str,
        window: WindowSize,
        range: TimeRange,
    ) -> Result<Vec<StoredBucket>, StorageError> {
        self.enter(false).await?;
        self.inner.bucket_range(node_id, window, range).await
    }
}

/// Engine whose three tiers can each be failed independently.
pub struct ChaosRig {
    pub engine: TelemetryEngine,
    pub hot: Arc<Chaos<MemoryHotStore>>,
    pub warm: Arc<Chaos<MemorySeriesStore>>,
    pub cold: Arc<Chaos<MemorySeriesStore>>,
}

/// Defaults with automatic scheduling off and fast flush retries.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.schedule.enabled = false;
    config.buffer.flush_max_retries = 1;
    config.buffer.flush_retry_initial_ms = 1;
    config.buffer.flush_retry_max_ms = 5;
    config
}

pub fn chaos_rig(config: EngineConfig) -> ChaosRig {
    let hot = Arc::new(Chaos::new(MemoryHotStore::new()));
    let warm = Arc::new(Chaos::new(MemorySeriesStore::warm()));
    let cold = Arc::new(Chaos::new(MemorySeriesStore::cold()));
    let tiers = Tiers::new(hot.clone(), warm.clone(), cold.clone());
    let engine = TelemetryEngine::new(config, tiers).expect("valid config");
    ChaosRig { engine, hot, warm, cold }
}

/// `count` readings one second apart, ending `end_secs_ago` seconds ago.
pub fn series(node: &str, count: usize, end_secs_ago: i64) -> Vec<SensorReading> {
    let end = Utc::now() - chrono::Duration::seconds(end_secs_ago);
    (0..count)
        .map(|i| {
            let ts = end - chrono::Duration::seconds((count - 1 - i) as i64);
            SensorReading::new(node, ts)
                .with_flow(20.0 + i as f64)
                .with_pressure(3.0)
                .with_total_flow(1_000.0 + i as f64)
        })
        .collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
