// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Hydro Sync
//!
//! Tiered data routing and synchronization for water-network telemetry.
//!
//! ## Architecture
//!
//! Readings from monitoring nodes flow through a write buffer into the
//! operational store and age out into the archive, while reads walk the
//! tiers from fastest to most complete:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Ingest Layer                         │
//! │  • ingest() / ingest_batch()                                │
//! │  • Backpressure once the write buffer fills                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               (per-node partitions, flushed by count/interval)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Hot: Redis / in-memory                     │
//! │  • Latest values, cached ranges, aggregate buckets          │
//! │  • Generation-checked writes, LRU within a memory budget    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                     (fallback on miss/timeout)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Warm: SQL time-series store                │
//! │  • Idempotent upserts keyed by (node_id, ts)                │
//! │  • Continuous aggregates: 5min / hour / day buckets         │
//! │  • Dead-letter log when flushes exhaust retries             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          (incremental sync; retention cleanup after archive)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Cold: SQL analytical archive               │
//! │  • Long-range history, back-fills Warm on read              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hydro_sync::{EngineConfig, Freshness, SensorReading, TelemetryEngine};
//! use chrono::Utc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), hydro_sync::EngineError> {
//!     let config = EngineConfig {
//!         hot_url: Some("redis://localhost:6379".into()),
//!         warm_url: Some("sqlite:warm.db?mode=rwc".into()),
//!         cold_url: Some("sqlite:cold.db?mode=rwc".into()),
//!         ..Default::default()
//!     };
//!
//!     let engine = TelemetryEngine::connect(config).await?;
//!     engine.start().await?;
//!
//!     engine
//!         .ingest(SensorReading::new("pump-7", Utc::now()).with_flow(42.0).with_pressure(3.4))
//!         .await?;
//!
//!     let latest = engine.get_latest("pump-7", Freshness::Any).await?;
//!     println!("{} from {} ({} ms stale)", latest.data.flow_rate, latest.tier, latest.staleness_ms());
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: The [`TelemetryEngine`] facade and its lifecycle
//! - [`router`]: Tier selection, fallback and back-fill for reads and writes
//! - [`write_buffer`]: Per-node ingestion buffer and flusher
//! - [`scheduler`]: Named recurring jobs and the standard sync jobs
//! - [`aggregation`]: Continuous aggregate buckets
//! - [`anomaly`]: Rolling z-score detection and anomaly lifecycle
//! - [`cache`]: Hot-tier cache with generation-checked invalidation
//! - [`storage`]: Tier traits and backends (Redis, SQL, memory)
//! - [`resilience`]: Circuit breakers, retry, dead-letter log
//! - [`nodes`] and [`quality`]: Node registry and data quality rules

pub mod aggregation;
pub mod anomaly;
pub mod backpressure;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod nodes;
pub mod quality;
pub mod reading;
pub mod resilience;
pub mod router;
pub mod scheduler;
pub mod storage;
pub mod write_buffer;

pub use aggregation::{AggregateBucket, ContinuousAggregator, NodeSummary, WindowSize};
pub use anomaly::{Anomaly, AnomalyDetector, AnomalyFilter, AnomalyStatus, Classification, Severity};
pub use backpressure::BackpressureLevel;
pub use cache::{CacheKey, CacheManager, CacheStats};
pub use config::{EngineConfig, RetentionPolicy, ScheduleConfig};
pub use engine::{BatchResult, EngineState, HealthCheck, ShutdownReport, TelemetryEngine, TierHealth};
pub use error::EngineError;
pub use nodes::{MonitoringNode, NodeRegistry, NodeStatus};
pub use reading::{MetricKind, SensorReading, TimeRange};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitState, TierCircuits};
pub use resilience::dead_letter::DeadLetterLog;
pub use resilience::retry::RetryConfig;
pub use router::{Freshness, ReadResponse, TierRouter, WriteAck};
pub use scheduler::{JobStatus, Schedule, SyncJob, SyncJobRecord, SyncScheduler, TriggerKind};
pub use storage::traits::{HotTier, SeriesTier, StorageError, Tier};
pub use storage::Tiers;
pub use write_buffer::{FlushReason, WriteBuffer};
pub use metrics::LatencyTimer;
