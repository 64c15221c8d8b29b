// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the telemetry engine.

use std::time::Duration;

use crate::backpressure::BackpressureLevel;
use crate::cache::CacheStats;
use crate::resilience::circuit_breaker::CircuitState;
use crate::storage::traits::Tier;

/// Engine lifecycle state.
///
/// Use [`super::TelemetryEngine::state()`] to read it or
/// [`super::TelemetryEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, not yet started
    Created,
    /// Probing tiers and replaying dead letters
    Starting,
    /// Flusher and scheduler are live
    Running,
    /// Draining the buffer and waiting for jobs
    ShuttingDown,
    /// Fully stopped; reads still work, writes are refused
    Stopped,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }

    /// Whether ingestion is allowed in this state.
    pub fn accepts_writes(&self) -> bool {
        matches!(self, Self::Created | Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Outcome of [`super::TelemetryEngine::ingest_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    /// Readings in the batch
    pub total: usize,
    /// Readings accepted into the write buffer
    pub accepted: usize,
    /// Position in the batch and reason of every refused reading
    pub rejected: Vec<(usize, String)>,
    /// Backpressure level after the last reading
    pub level: BackpressureLevel,
}

impl BatchResult {
    /// Whether every reading was accepted.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Health of one tier.
#[derive(Debug, Clone, PartialEq)]
pub struct TierHealth {
    pub tier: Tier,
    pub connected: bool,
    /// Ping round trip; `None` when the ping failed
    pub latency_ms: Option<u64>,
    pub circuit: CircuitState,
    pub error: Option<String>,
}

impl TierHealth {
    /// Usable: answering pings with its breaker closed.
    pub fn is_available(&self) -> bool {
        self.connected && self.circuit == CircuitState::Closed
    }
}

/// Snapshot returned by [`super::TelemetryEngine::health_check`].
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running and accepting writes
    pub ready: bool,
    /// Every tier available and nothing waiting in the dead-letter log
    pub healthy: bool,
    /// Serving, but at least one tier is unavailable or dead letters are pending
    pub degraded: bool,
    pub backpressure_level: BackpressureLevel,
    pub accepting_writes: bool,
    pub buffered_readings: usize,
    pub dead_letter_pending: u64,
    pub hot: TierHealth,
    pub warm: TierHealth,
    pub cold: TierHealth,
    pub cache: CacheStats,
    /// Jobs with a run in flight
    pub running_jobs: Vec<String>,
    /// Jobs whose most recent run failed
    pub failed_jobs: Vec<String>,
}

/// What [`super::TelemetryEngine::shutdown`] managed to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// In-flight jobs finished before the deadline
    pub jobs_finished: bool,
    /// Readings written to Warm by the final drain
    pub committed: usize,
    /// Readings moved to the dead-letter log by the final drain
    pub dead_lettered: usize,
    /// Readings still buffered after the drain
    pub remaining: usize,
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// Nothing was lost or left behind.
    pub fn is_clean(&self) -> bool {
        self.jobs_finished && self.dead_lettered == 0 && self.remaining == 0
    }
}
