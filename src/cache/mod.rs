// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Hot-tier cache manager.
//!
//! Values live in the Hot tier as serialized [`CacheEntry`] records. This
//! process keeps an LRU index of what it wrote (key, generation, size) and
//! only serves a Hot entry whose generation matches the index, so an entry
//! that was invalidated, evicted or overwritten elsewhere reads as a miss.
//!
//! # Generations
//!
//! One monotonic counter hands out generations. Every write takes a fresh
//! one, and every invalidation takes one and records it as a floor for the
//! key (or for a whole node family). A write whose generation is below the
//! floor was started before the invalidation and is refused, which is what
//! keeps a slow back-fill from re-caching data a flush just replaced.
//!
//! ```text
//! reserve() ──► g=41          invalidate(K) ──► floor(K)=42
//!    │                                │
//!    └── set_reserved(K, g=41) ───────┴──► rejected (41 < 42)
//! ```

pub mod key;

pub use key::{CacheFamily, CacheKey};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::aggregation::bucket::WindowSize;
use crate::config::CacheConfig;
use crate::resilience::circuit_breaker::TierCircuits;
use crate::resilience::guarded;
use crate::storage::traits::{HotTier, StorageError, Tier};

/// Serialized form of a cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub ttl_expiry: DateTime<Utc>,
    pub generation: u64,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Time since the entry was written.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.stored_at).max(chrono::Duration::zero())
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub stale_rejections: u64,
    pub entries: usize,
    pub bytes: usize,
    pub budget_bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// A generation taken before a slow read, to be used by the write that
/// caches its result.
pub struct Reservation {
    generation: u64,
    outstanding: Arc<Mutex<BTreeMap<u64, usize>>>,
}

impl Reservation {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut outstanding = self.outstanding.lock();
        if let Some(count) = outstanding.get_mut(&self.generation) {
            *count -= 1;
            if *count == 0 {
                outstanding.remove(&self.generation);
            }
        }
    }
}

struct Tracked {
    generation: u64,
    bytes: usize,
    tick: u64,
    expires_at: Instant,
    node_id: String,
    family: CacheFamily,
}

#[derive(Default)]
struct LruIndex {
    entries: HashMap<String, Tracked>,
    order: BTreeMap<u64, String>,
    tick: u64,
    bytes: usize,
}

impl LruIndex {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &str) -> Option<(u64, Instant)> {
        let tick = self.next_tick();
        let tracked = self.entries.get_mut(key)?;
        self.order.remove(&tracked.tick);
        tracked.tick = tick;
        self.order.insert(tick, key.to_string());
        Some((tracked.generation, tracked.expires_at))
    }

    fn insert(&mut self, key: String, mut tracked: Tracked) {
        self.remove(&key);
        tracked.tick = self.next_tick();
        self.bytes += tracked.bytes;
        self.order.insert(tracked.tick, key.clone());
        self.entries.insert(key, tracked);
    }

    fn remove(&mut self, key: &str) -> Option<Tracked> {
        let tracked = self.entries.remove(key)?;
        self.order.remove(&tracked.tick);
        self.bytes -= tracked.bytes;
        Some(tracked)
    }

    /// Remove only if the tracked generation still matches.
    fn remove_if(&mut self, key: &str, generation: u64) -> bool {
        if self.entries.get(key).is_some_and(|t| t.generation == generation) {
            self.remove(key);
            true
        } else {
            false
        }
    }

    fn pop_lru(&mut self) -> Option<(String, Tracked)> {
        let (_, key) = self.order.pop_first()?;
        let tracked = self.entries.remove(&key)?;
        self.bytes -= tracked.bytes;
        Some((key, tracked))
    }

    fn keys_for(&self, node_id: &str, family: CacheFamily) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, t)| t.family == family && t.node_id == node_id)
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn expired(&self, now: Instant) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, t)| t.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Floors are pruned once this many accumulate.
const FLOOR_PRUNE_THRESHOLD: usize = 4_096;

pub struct CacheManager {
    hot: Arc<dyn HotTier>,
    circuits: Arc<TierCircuits>,
    timeout: Duration,
    budget_bytes: usize,
    max_ttl: Duration,

    generation: AtomicU64,
    outstanding: Arc<Mutex<BTreeMap<u64, usize>>>,
    key_floors: DashMap<String, u64>,
    family_floors: DashMap<(String, CacheFamily), u64>,
    index: Mutex<LruIndex>,

    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    stale_rejections: AtomicU64,
}

impl CacheManager {
    /// `max_ttl` caps every entry's lifetime (the Hot retention window).
    pub fn new(
        hot: Arc<dyn HotTier>,
        circuits: Arc<TierCircuits>,
        config: &CacheConfig,
        timeout: Duration,
        max_ttl: Duration,
    ) -> Self {
        // Seeded from the clock so generations keep rising across restarts.
        let seed = Utc::now().timestamp_micros().max(0) as u64;
        Self {
            hot,
            circuits,
            timeout,
            budget_bytes: config.memory_budget_bytes,
            max_ttl,
            generation: AtomicU64::new(seed),
            outstanding: Arc::new(Mutex::new(BTreeMap::new())),
            key_floors: DashMap::new(),
            family_floors: DashMap::new(),
            index: Mutex::new(LruIndex::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            stale_rejections: AtomicU64::new(0),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Take a generation now for a value that will be cached later.
    pub fn reserve(&self) -> Reservation {
        let mut outstanding = self.outstanding.lock();
        let generation = self.next_generation();
        *outstanding.entry(generation).or_insert(0) += 1;
        Reservation {
            generation,
            outstanding: Arc::clone(&self.outstanding),
        }
    }

    fn floor_for(&self, key: &CacheKey, rendered: &str) -> u64 {
        let key_floor = self.key_floors.get(rendered).map(|f| *f).unwrap_or(0);
        let family_floor = self
            .family_floors
            .get(&(key.node_id().to_string(), key.family()))
            .map(|f| *f)
            .unwrap_or(0);
        key_floor.max(family_floor)
    }

    fn raise_key_floor(&self, rendered: &str, generation: u64) {
        let mut floor = self.key_floors.entry(rendered.to_string()).or_insert(0);
        if *floor < generation {
            *floor = generation;
        }
    }

    async fn hot_call<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        guarded(&self.circuits.hot, Tier::Hot, operation, self.timeout, f).await
    }

    /// Cached entry for `key`, if this process wrote it and it is still current.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StorageError> {
        let rendered = key.render();
        let family = key.family().as_str();

        let tracked = self.index.lock().touch(&rendered);
        let live = match tracked {
            Some((generation, expires_at)) if expires_at > Instant::now() => Some(generation),
            Some((generation, _)) => {
                self.index.lock().remove_if(&rendered, generation);
                None
            }
            None => None,
        };
        let Some(generation) = live else {
            // Nothing servable, but an unreachable Hot tier still has to surface.
            self.hot_call("ttl", || self.hot.ttl(&rendered)).await?;
            self.record_miss(family);
            return Ok(None);
        };

        let raw = self.hot_call("get", || self.hot.get(&rendered)).await?;
        let entry = match raw {
            Some(raw) => match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(key = %rendered, error = %e, "Undecodable cache entry");
                    None
                }
            },
            None => None,
        };

        match entry {
            Some(entry)
                if entry.generation == generation && entry.generation >= self.floor_for(key, &rendered) =>
            {
                self.hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_lookup(family, true);
                Ok(Some(entry))
            }
            _ => {
                self.index.lock().remove_if(&rendered, generation);
                self.record_miss(family);
                Ok(None)
            }
        }
    }

    /// Typed lookup.
    pub async fn get_value<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<(T, CacheEntry)>, StorageError> {
        match self.get(key).await? {
            Some(entry) => {
                let value = entry.decode()?;
                Ok(Some((value, entry)))
            }
            None => Ok(None),
        }
    }

    fn record_miss(&self, family: &str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_lookup(family, false);
    }

    /// Authoritative write: newer than anything reserved before it.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T, ttl: Duration) -> Result<bool, StorageError> {
        let generation = self.next_generation();
        self.raise_key_floor(&key.render(), generation);
        self.store(key, value, ttl, generation).await
    }

    /// Write with a generation reserved before the value was read.
    ///
    /// Returns `Ok(false)` when an invalidation happened after the
    /// reservation; nothing is cached in that case.
    pub async fn set_reserved<T: Serialize + ?Sized>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Duration,
        reservation: Reservation,
    ) -> Result<bool, StorageError> {
        let stored = self.store(key, value, ttl, reservation.generation).await;
        drop(reservation);
        stored
    }

    async fn store<T: Serialize + ?Sized>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool, StorageError> {
        let rendered = key.render();
        let family = key.family();

        if generation < self.floor_for(key, &rendered) {
            self.reject_stale(&rendered, family, generation);
            return Ok(false);
        }

        let ttl = ttl.min(self.max_ttl);
        let now = Utc::now();
        let entry = CacheEntry {
            key: rendered.clone(),
            value: serde_json::to_value(value)?,
            ttl_expiry: now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
            generation,
            stored_at: now,
        };
        let payload = serde_json::to_string(&entry)?;
        let bytes = rendered.len() + payload.len();

        self.hot_call("set", || self.hot.set(&rendered, &payload, ttl)).await?;

        // An invalidation may have landed while the value was in flight.
        if generation < self.floor_for(key, &rendered) {
            self.reject_stale(&rendered, family, generation);
            if let Err(e) = self.hot_call("delete", || self.hot.delete(&rendered)).await {
                debug!(key = %rendered, error = %e, "Failed to drop stale cache write");
            }
            return Ok(false);
        }

        let mut evicted = Vec::new();
        {
            let mut index = self.index.lock();
            if index.entries.get(&rendered).is_some_and(|t| t.generation > generation)
                || generation < self.floor_for(key, &rendered)
            {
                return Ok(false);
            }
            index.insert(
                rendered.clone(),
                Tracked {
                    generation,
                    bytes,
                    tick: 0,
                    expires_at: Instant::now() + ttl,
                    node_id: key.node_id().to_string(),
                    family,
                },
            );
            while index.bytes > self.budget_bytes && index.entries.len() > 1 {
                match index.pop_lru() {
                    Some((k, t)) => evicted.push((k, t.bytes)),
                    None => break,
                }
            }
            crate::metrics::set_cache_usage(index.entries.len(), index.bytes);
        }

        if !evicted.is_empty() {
            let bytes: usize = evicted.iter().map(|(_, b)| b).sum();
            self.evictions.fetch_add(evicted.len() as u64, Ordering::Relaxed);
            crate::metrics::record_cache_eviction(evicted.len(), bytes);
            debug!(count = evicted.len(), bytes, "Evicted least recently used cache entries");
            let keys: Vec<String> = evicted.into_iter().map(|(k, _)| k).collect();
            if let Err(e) = self.hot_call("delete_many", || self.hot.delete_many(&keys)).await {
                debug!(keys = keys.len(), error = %e, "Failed to delete evicted keys");
            }
        }
        Ok(true)
    }

    fn reject_stale(&self, rendered: &str, family: CacheFamily, generation: u64) {
        self.stale_rejections.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_stale_write_rejected(family.as_str());
        debug!(key = %rendered, generation, "Refused cache write older than last invalidation");
    }

    /// Raise the key's floor and stop tracking it. Returns the rendered key.
    fn mark_invalid(&self, key: &CacheKey) -> String {
        let rendered = key.render();
        let generation = self.next_generation();
        self.raise_key_floor(&rendered, generation);
        self.index.lock().remove(&rendered);
        rendered
    }

    /// Raise the family floor and stop tracking its keys. Returns the keys
    /// this process had written.
    fn mark_family_invalid(&self, node_id: &str, family: CacheFamily) -> Vec<String> {
        let generation = self.next_generation();
        {
            let mut floor = self.family_floors.entry((node_id.to_string(), family)).or_insert(0);
            if *floor < generation {
                *floor = generation;
            }
        }
        let mut index = self.index.lock();
        let keys = index.keys_for(node_id, family);
        for k in &keys {
            index.remove(k);
        }
        keys
    }

    /// One Hot round trip for all keys. Failures are logged; the keys stop
    /// being served either way.
    async fn delete_keys(&self, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }
        if let Err(e) = self.hot_call("delete_many", || self.hot.delete_many(&keys)).await {
            warn!(keys = keys.len(), error = %e, "Hot tier delete failed during invalidation");
        }
    }

    /// Drop a key and refuse any write reserved before now.
    pub async fn invalidate(&self, key: &CacheKey) {
        let rendered = self.mark_invalid(key);
        self.delete_keys(vec![rendered]).await;
        self.maybe_prune_floors();
    }

    /// Invalidate every key of one family for a node, including keys this
    /// process does not track yet.
    pub async fn invalidate_family(&self, node_id: &str, family: CacheFamily) {
        let keys = self.mark_family_invalid(node_id, family);
        self.delete_keys(keys).await;
    }

    /// Invalidate what a Warm write of these readings can change: the
    /// node's range and summary keys plus every bucket key covering one of
    /// the timestamps.
    pub async fn invalidate_readings(&self, node_id: &str, timestamps: &[DateTime<Utc>]) {
        let mut buckets: Vec<CacheKey> = Vec::new();
        for ts in timestamps {
            for window in WindowSize::ALL {
                let key = CacheKey::bucket(node_id, window, window.align(*ts));
                if !buckets.contains(&key) {
                    buckets.push(key);
                }
            }
        }
        let mut keys: Vec<String> = buckets.iter().map(|k| self.mark_invalid(k)).collect();
        keys.extend(self.mark_family_invalid(node_id, CacheFamily::Range));
        keys.push(self.mark_invalid(&CacheKey::summary(node_id)));
        self.delete_keys(keys).await;
        self.maybe_prune_floors();
    }

    /// Forget expired entries and floors nothing can violate any more.
    pub fn purge_expired(&self) -> usize {
        let purged = {
            let mut index = self.index.lock();
            let expired = index.expired(Instant::now());
            for k in &expired {
                index.remove(k);
            }
            crate::metrics::set_cache_usage(index.entries.len(), index.bytes);
            expired.len()
        };
        self.prune_floors();
        purged
    }

    fn maybe_prune_floors(&self) {
        if self.key_floors.len() > FLOOR_PRUNE_THRESHOLD {
            self.prune_floors();
        }
    }

    /// A floor only matters to reservations older than it.
    fn prune_floors(&self) {
        let oldest = self.outstanding.lock().keys().next().copied();
        match oldest {
            None => {
                self.key_floors.clear();
                self.family_floors.clear();
            }
            Some(oldest) => {
                self.key_floors.retain(|_, floor| *floor > oldest);
                self.family_floors.retain(|_, floor| *floor > oldest);
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let index = self.index.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            stale_rejections: self.stale_rejections.load(Ordering::Relaxed),
            entries: index.entries.len(),
            bytes: index.bytes,
            budget_bytes: self.budget_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitConfig;
    use crate::storage::memory::MemoryHotStore;
    use chrono::TimeZone;

    fn manager_with(budget: usize) -> (CacheManager, Arc<MemoryHotStore>) {
        let hot = Arc::new(MemoryHotStore::new());
        let config = CacheConfig {
            memory_budget_bytes: budget,
            ..CacheConfig::default()
        };
        let manager = CacheManager::new(
            hot.clone(),
            Arc::new(TierCircuits::uniform(CircuitConfig::test())),
            &config,
            Duration::from_secs(1),
            Duration::from_secs(3600),
        );
        (manager, hot)
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (cache, _) = manager_with(1 << 20);
        let key = CacheKey::latest("n1");
        assert!(cache.set(&key, &42.5f64, Duration::from_secs(60)).await.unwrap());

        let (value, entry) = cache.get_value::<f64>(&key).await.unwrap().unwrap();
        assert_eq!(value, 42.5);
        assert_eq!(entry.key, "latest:n1");
        assert_eq!(cache.stats().hits, 1);

        assert!(cache.get(&CacheKey::latest("n2")).await.unwrap().is_none());
        assert_eq!(cache.stats().hit_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_miss_is_counted() {
        let (cache, _) = manager_with(1 << 20);
        assert!(cache.get(&CacheKey::latest("nope")).await.unwrap().is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    struct Unreachable;

    #[async_trait::async_trait]
    impl crate::storage::traits::TierClient for Unreachable {
        fn tier(&self) -> Tier {
            Tier::Hot
        }
        async fn ping(&self) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
    }

    #[async_trait::async_trait]
    impl HotTier for Unreachable {
        async fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn ttl(&self, _key: &str) -> Result<Option<Duration>, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_untracked_key_surfaces_unreachable_hot() {
        let cache = CacheManager::new(
            Arc::new(Unreachable),
            Arc::new(TierCircuits::uniform(CircuitConfig::test())),
            &CacheConfig::default(),
            Duration::from_secs(1),
            Duration::from_secs(3600),
        );
        assert!(cache.get(&CacheKey::latest("n1")).await.is_err());
        assert_eq!(cache.stats().misses, 0);
    }

    #[tokio::test]
    async fn test_invalidate_hides_entry() {
        let (cache, hot) = manager_with(1 << 20);
        let key = CacheKey::summary("n1");
        cache.set(&key, "v1", Duration::from_secs(60)).await.unwrap();
        cache.invalidate(&key).await;

        assert!(cache.get(&key).await.unwrap().is_none());
        assert!(hot.is_empty());
    }

    #[tokio::test]
    async fn test_reserved_write_before_invalidation_is_rejected() {
        let (cache, _) = manager_with(1 << 20);
        let key = CacheKey::bucket("n1", WindowSize::Hour, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());

        let stale = cache.reserve();
        cache.invalidate(&key).await;
        assert!(!cache.set_reserved(&key, "old", Duration::from_secs(60), stale).await.unwrap());
        assert!(cache.get(&key).await.unwrap().is_none());
        assert_eq!(cache.stats().stale_rejections, 1);

        let fresh = cache.reserve();
        assert!(cache.set_reserved(&key, "new", Duration::from_secs(60), fresh).await.unwrap());
        let (v, _) = cache.get_value::<String>(&key).await.unwrap().unwrap();
        assert_eq!(v, "new");
    }

    #[tokio::test]
    async fn test_family_invalidation_covers_untracked_keys() {
        let (cache, _) = manager_with(1 << 20);
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let key = CacheKey::range("n1", crate::reading::TimeRange::new(t0, t0 + chrono::Duration::hours(1)));

        let pending = cache.reserve();
        cache.invalidate_family("n1", CacheFamily::Range).await;
        assert!(!cache.set_reserved(&key, &[1, 2, 3], Duration::from_secs(60), pending).await.unwrap());

        // other nodes are untouched
        let other = CacheKey::range("n2", crate::reading::TimeRange::new(t0, t0 + chrono::Duration::hours(1)));
        let r = cache.reserve();
        assert!(cache.set_reserved(&other, &[1], Duration::from_secs(60), r).await.unwrap());
    }

    #[tokio::test]
    async fn test_authoritative_set_beats_older_reservation() {
        let (cache, _) = manager_with(1 << 20);
        let key = CacheKey::latest("n1");
        let backfill = cache.reserve();
        cache.set(&key, "write-through", Duration::from_secs(60)).await.unwrap();
        assert!(!cache.set_reserved(&key, "backfill", Duration::from_secs(60), backfill).await.unwrap());

        let (v, _) = cache.get_value::<String>(&key).await.unwrap().unwrap();
        assert_eq!(v, "write-through");
    }

    #[tokio::test]
    async fn test_lru_eviction_under_budget() {
        let (cache, hot) = manager_with(400);
        for i in 0..10 {
            let key = CacheKey::summary(format!("node-{}", i));
            cache.set(&key, "x".repeat(50).as_str(), Duration::from_secs(60)).await.unwrap();
        }
        let stats = cache.stats();
        assert!(stats.bytes <= 400);
        assert!(stats.evictions > 0);
        assert_eq!(hot.len(), stats.entries);
        // most recent survives
        assert!(cache.get(&CacheKey::summary("node-9")).await.unwrap().is_some());
        assert!(cache.get(&CacheKey::summary("node-0")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recently_read_entry_survives_eviction() {
        let (cache, _) = manager_with(600);
        let first = CacheKey::summary("first");
        cache.set(&first, "y".repeat(50).as_str(), Duration::from_secs(60)).await.unwrap();
        for i in 0..6 {
            cache.get(&first).await.unwrap();
            let key = CacheKey::summary(format!("n{}", i));
            cache.set(&key, "y".repeat(50).as_str(), Duration::from_secs(60)).await.unwrap();
        }
        assert!(cache.get(&first).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_independent_of_eviction() {
        let (cache, _) = manager_with(1 << 20);
        let key = CacheKey::latest("n1");
        cache.set(&key, &1, Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(cache.get(&key).await.unwrap().is_none());
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test]
    async fn test_invalidate_readings_hits_covering_buckets_only() {
        let (cache, _) = manager_with(1 << 20);
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let hit = CacheKey::bucket("n1", WindowSize::FiveMinutes, t0);
        let miss = CacheKey::bucket("n1", WindowSize::FiveMinutes, t0 + chrono::Duration::minutes(30));
        cache.set(&hit, &1, Duration::from_secs(60)).await.unwrap();
        cache.set(&miss, &2, Duration::from_secs(60)).await.unwrap();

        cache.invalidate_readings("n1", &[t0 + chrono::Duration::minutes(2)]).await;

        assert!(cache.get(&hit).await.unwrap().is_none());
        assert!(cache.get(&miss).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_clears_floors_without_reservations() {
        let (cache, _) = manager_with(1 << 20);
        cache.invalidate(&CacheKey::latest("n1")).await;
        assert_eq!(cache.purge_expired(), 0);
        assert!(cache.key_floors.is_empty());
    }
}
