// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Telemetry engine facade.
//!
//! [`TelemetryEngine`] wires the tiers, write buffer, router, cache,
//! aggregator, anomaly detector and scheduler together, owns their
//! background tasks, and exposes the caller API.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──start()──► Starting ──► Running ──shutdown()──► ShuttingDown ──► Stopped
//! ```
//!
//! The state is broadcast over a `watch` channel. Ingestion works from
//! `Created` on (readings wait in the buffer until the flusher starts or
//! `flush()` is called) and is refused once shutdown begins.

mod api;
mod lifecycle;
pub mod types;

pub use types::{BatchResult, EngineState, HealthCheck, ShutdownReport, TierHealth};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregation::ContinuousAggregator;
use crate::anomaly::{AnomalyDetector, AnomalyStore, LogSink, MemoryAnomalyStore, NotificationSink, SqlAnomalyStore};
use crate::cache::CacheManager;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::nodes::NodeRegistry;
use crate::resilience::circuit_breaker::TierCircuits;
use crate::resilience::dead_letter::DeadLetterLog;
use crate::router::TierRouter;
use crate::scheduler::jobs::{register_standard_jobs, JobDeps, TierAccess};
use crate::scheduler::{JobRecordStore, MemoryJobRecordStore, SqlJobRecordStore, SyncScheduler};
use crate::storage::memory::{MemoryHotStore, MemorySeriesStore};
use crate::storage::redis::RedisHotStore;
use crate::storage::sql::SqlSeriesStore;
use crate::storage::traits::{HotTier, SeriesTier, Tier};
use crate::storage::Tiers;

use lifecycle::Housekeeping;

/// The telemetry engine.
///
/// `Send + Sync`; share it behind an `Arc`. Every component it owns is
/// internally synchronized.
pub struct TelemetryEngine {
    config: EngineConfig,

    /// Engine state (broadcast to watchers)
    state: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    tiers: Tiers,
    circuits: Arc<TierCircuits>,
    registry: Arc<NodeRegistry>,
    cache: Arc<CacheManager>,
    dead_letters: Arc<DeadLetterLog>,
    buffer: Arc<crate::write_buffer::WriteBuffer>,
    router: TierRouter,
    aggregator: Arc<ContinuousAggregator>,
    detector: Arc<AnomalyDetector>,
    scheduler: Arc<SyncScheduler>,
    housekeeping: Housekeeping,

    /// Stops the flusher and the maintenance loop
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl TelemetryEngine {
    /// Build an engine over the given tiers, with an in-memory dead-letter
    /// log, anomaly store and job record store.
    ///
    /// The engine starts in `Created`. Call [`start()`](Self::start) to run
    /// the flusher and the scheduler.
    pub fn new(config: EngineConfig, tiers: Tiers) -> Result<Self, EngineError> {
        let dead_letters = Arc::new(DeadLetterLog::in_memory(config.dead_letter_max_batches));
        Self::with_parts(
            config,
            tiers,
            dead_letters,
            Arc::new(MemoryAnomalyStore::new()),
            Arc::new(MemoryJobRecordStore::new()),
            Arc::new(LogSink),
        )
    }

    /// Build an engine from explicit parts.
    pub fn with_parts(
        config: EngineConfig,
        tiers: Tiers,
        dead_letters: Arc<DeadLetterLog>,
        anomaly_store: Arc<dyn AnomalyStore>,
        job_store: Arc<dyn JobRecordStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        crate::metrics::set_engine_state(EngineState::Created.as_str());

        let circuits = Arc::new(TierCircuits::new());
        let registry = Arc::new(NodeRegistry::new());
        let hot_retention = config.retention.hot().to_std().unwrap_or(Duration::from_secs(3600));

        let cache = Arc::new(CacheManager::new(
            Arc::clone(&tiers.hot),
            Arc::clone(&circuits),
            &config.cache,
            config.timeouts.hot(),
            hot_retention,
        ));

        let buffer = Arc::new(crate::write_buffer::WriteBuffer::new(
            config.buffer.clone(),
            Arc::clone(&tiers.warm),
            Arc::clone(&circuits),
            config.timeouts.warm(),
            Arc::clone(&cache),
            Arc::clone(&dead_letters),
        ));

        let router = TierRouter::new(
            tiers.clone(),
            Arc::clone(&circuits),
            config.timeouts.clone(),
            Arc::clone(&cache),
            Arc::clone(&buffer),
            Arc::clone(&registry),
            config.retention.clone(),
            config.cache.clone(),
            config.quality.clone(),
        );

        let aggregator = Arc::new(ContinuousAggregator::new(
            Arc::clone(&tiers.warm),
            Arc::clone(&circuits),
            config.timeouts.warm(),
            Arc::clone(&cache),
            config.quality.clone(),
            config.cache.aggregate_ttl(),
        ));

        let detector = Arc::new(AnomalyDetector::new(
            Arc::clone(&tiers.warm),
            Arc::clone(&circuits),
            config.timeouts.warm(),
            config.anomaly.clone(),
            config.quality.clone(),
            anomaly_store,
            sink,
        ));

        let scheduler = Arc::new(SyncScheduler::with_store(
            config.job_history_len,
            config.schedule.enabled,
            job_store,
        ));
        let deps = JobDeps {
            access: TierAccess::new(tiers.clone(), Arc::clone(&circuits), config.timeouts.clone()),
            registry: Arc::clone(&registry),
            cache: Arc::clone(&cache),
            aggregator: Arc::clone(&aggregator),
            detector: Arc::clone(&detector),
            rules: config.quality.clone(),
            retention: config.retention.clone(),
            schedule: config.schedule.clone(),
            summary_ttl: config.cache.aggregate_ttl(),
        };
        register_standard_jobs(&scheduler, &deps)?;

        let housekeeping = Housekeeping {
            tiers: tiers.clone(),
            circuits: Arc::clone(&circuits),
            timeouts: config.timeouts.clone(),
            cache: Arc::clone(&cache),
            aggregator: Arc::clone(&aggregator),
            dead_letters: Arc::clone(&dead_letters),
        };

        Ok(Self {
            config,
            state: state_tx,
            state_rx,
            tiers,
            circuits,
            registry,
            cache,
            dead_letters,
            buffer,
            router,
            aggregator,
            detector,
            scheduler,
            housekeeping,
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Build an engine from the backend URLs in `config`.
    ///
    /// Missing URLs fall back to in-memory tiers. An unreachable Redis
    /// falls back to an in-memory Hot tier with a warning, since the Hot
    /// tier only caches; an unreachable Warm or Cold tier is an error.
    #[tracing::instrument(skip(config))]
    pub async fn connect(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let hot: Arc<dyn HotTier> = match &config.hot_url {
            Some(url) => match RedisHotStore::with_prefix(url, Some(&config.hot_prefix)).await {
                Ok(store) => {
                    info!("Hot tier connected (Redis)");
                    Arc::new(store)
                }
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, caching in process memory");
                    crate::metrics::set_backend_healthy("hot", false);
                    Arc::new(MemoryHotStore::new())
                }
            },
            None => Arc::new(MemoryHotStore::new()),
        };

        let warm: Arc<dyn SeriesTier> = match &config.warm_url {
            Some(url) => Arc::new(
                SqlSeriesStore::new(url, Tier::Warm)
                    .await
                    .map_err(|e| EngineError::from_tier(Tier::Warm, e))?,
            ),
            None => Arc::new(MemorySeriesStore::warm()),
        };

        let cold: Arc<dyn SeriesTier> = match &config.cold_url {
            Some(url) => Arc::new(
                SqlSeriesStore::new(url, Tier::Cold)
                    .await
                    .map_err(|e| EngineError::from_tier(Tier::Cold, e))?,
            ),
            None => Arc::new(MemorySeriesStore::cold()),
        };

        let dead_letters = match &config.dead_letter_path {
            Some(path) => DeadLetterLog::open(path, config.dead_letter_max_batches).await?,
            None => DeadLetterLog::in_memory(config.dead_letter_max_batches),
        };

        let anomaly_store: Arc<dyn AnomalyStore> = match &config.warm_url {
            Some(url) => Arc::new(
                SqlAnomalyStore::new(url)
                    .await
                    .map_err(|e| EngineError::from_tier(Tier::Warm, e))?,
            ),
            None => Arc::new(MemoryAnomalyStore::new()),
        };

        let job_store: Arc<dyn JobRecordStore> = match &config.warm_url {
            Some(url) => Arc::new(
                SqlJobRecordStore::new(url)
                    .await
                    .map_err(|e| EngineError::from_tier(Tier::Warm, e))?,
            ),
            None => Arc::new(MemoryJobRecordStore::new()),
        };

        let engine = Self::with_parts(
            config,
            Tiers::new(hot, warm, cold),
            Arc::new(dead_letters),
            anomaly_store,
            job_store,
            Arc::new(LogSink),
        )?;
        match engine.scheduler.restore_history().await {
            Ok(loaded) => info!(loaded, "Job history loaded"),
            Err(e) => warn!(error = %e, "Job history could not be loaded"),
        }
        Ok(engine)
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is running and accepting writes.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == EngineState::Running
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(state.as_str());
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn tiers(&self) -> &Tiers {
        &self.tiers
    }

    #[must_use]
    pub fn circuits(&self) -> &TierCircuits {
        &self.circuits
    }

    #[must_use]
    pub fn router(&self) -> &TierRouter {
        &self.router
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    #[must_use]
    pub fn aggregator(&self) -> &Arc<ContinuousAggregator> {
        &self.aggregator
    }

    #[must_use]
    pub fn dead_letters(&self) -> &Arc<DeadLetterLog> {
        &self.dead_letters
    }

    #[must_use]
    pub fn buffer_stats(&self) -> crate::write_buffer::BufferStats {
        self.buffer.stats()
    }

    /// Probe every tier in parallel and summarize engine health.
    #[tracing::instrument(skip(self))]
    pub async fn health_check(&self) -> HealthCheck {
        let (hot, warm, cold) = tokio::join!(
            self.housekeeping.probe(Tier::Hot),
            self.housekeeping.probe(Tier::Warm),
            self.housekeeping.probe(Tier::Cold),
        );
        for tier in [&hot, &warm, &cold] {
            crate::metrics::set_backend_healthy(tier.tier.as_str(), tier.connected);
        }

        let state = self.state();
        let level = self.buffer.level();
        let dead_letter_pending = self.dead_letters.stats().pending_batches;

        let mut running_jobs = Vec::new();
        let mut failed_jobs = Vec::new();
        for job in self.scheduler.jobs() {
            if job.running_job_id.is_some() {
                running_jobs.push(job.name.clone());
            }
            if job
                .last_run
                .as_ref()
                .is_some_and(|r| r.status == crate::scheduler::JobStatus::Failed)
            {
                failed_jobs.push(job.name);
            }
        }

        let accepting_writes = state.accepts_writes() && level.should_accept_writes();
        let tiers_ok = hot.is_available() && warm.is_available() && cold.is_available();
        let healthy = state == EngineState::Running && tiers_ok && dead_letter_pending == 0;
        let degraded = state == EngineState::Running && !healthy;

        HealthCheck {
            state,
            ready: state == EngineState::Running && accepting_writes,
            healthy,
            degraded,
            backpressure_level: level,
            accepting_writes,
            buffered_readings: self.buffer.pending(),
            dead_letter_pending,
            hot,
            warm,
            cold,
            cache: self.cache.stats(),
            running_jobs,
            failed_jobs,
        }
    }
}
