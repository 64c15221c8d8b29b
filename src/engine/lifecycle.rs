// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: startup sequence, maintenance loop and shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregation::ContinuousAggregator;
use crate::cache::{CacheFamily, CacheKey, CacheManager};
use crate::config::TierTimeouts;
use crate::error::EngineError;
use crate::resilience::circuit_breaker::{CircuitState, TierCircuits};
use crate::resilience::dead_letter::{DeadLetterLog, ReplayReport};
use crate::storage::traits::{Tier, TierClient};
use crate::storage::Tiers;

use super::{EngineState, ShutdownReport, TelemetryEngine, TierHealth};

/// How often the maintenance loop probes tiers and retries dead letters.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Dead-letter batches replayed per maintenance pass.
const REPLAY_BATCH: usize = 100;

/// Pings get at least this long, whatever the tier's read budget.
const MIN_PROBE_BUDGET: Duration = Duration::from_secs(1);

/// Handles the background maintenance and the health probe share.
#[derive(Clone)]
pub(super) struct Housekeeping {
    pub(super) tiers: Tiers,
    pub(super) circuits: Arc<TierCircuits>,
    pub(super) timeouts: TierTimeouts,
    pub(super) cache: Arc<CacheManager>,
    pub(super) aggregator: Arc<ContinuousAggregator>,
    pub(super) dead_letters: Arc<DeadLetterLog>,
}

impl Housekeeping {
    /// Ping one tier with a bounded wait.
    pub(super) async fn probe(&self, tier: Tier) -> TierHealth {
        let budget = match tier {
            Tier::Hot => self.timeouts.hot(),
            Tier::Warm => self.timeouts.warm(),
            Tier::Cold => self.timeouts.cold(),
        }
        .max(MIN_PROBE_BUDGET);
        let circuit = self.circuits.for_tier(tier).state();
        let ping = async {
            match tier {
                Tier::Hot => self.tiers.hot.ping().await,
                Tier::Warm => self.tiers.warm.ping().await,
                Tier::Cold => self.tiers.cold.ping().await,
            }
        };

        let start = Instant::now();
        let (connected, error) = match tokio::time::timeout(budget, ping).await {
            Ok(Ok(())) => (true, None),
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (false, Some(format!("ping timed out after {}ms", budget.as_millis()))),
        };
        let latency_ms = connected.then(|| u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX));

        TierHealth {
            tier,
            connected,
            latency_ms,
            circuit,
            error,
        }
    }

    /// Replay dead-lettered batches into Warm, then drop cached ranges and
    /// recompute the aggregates they touch.
    pub(super) async fn replay(&self, limit: usize) -> Result<ReplayReport, EngineError> {
        let report = self
            .dead_letters
            .replay(self.tiers.warm.as_ref(), limit)
            .await
            .map_err(|e| EngineError::from_tier(Tier::Warm, e))?;
        crate::metrics::record_dead_letter_replay(report.readings, report.corrupt);

        for (node_id, range) in &report.affected {
            self.cache.invalidate(&CacheKey::latest(node_id)).await;
            self.cache.invalidate_family(node_id, CacheFamily::Range).await;
            self.cache.invalidate_family(node_id, CacheFamily::Summary).await;
            if let Err(e) = self.aggregator.refresh_all_windows(node_id, *range).await {
                warn!(node_id = %node_id, error = %e, "Aggregate refresh after replay failed");
            }
        }
        Ok(report)
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for tier in [Tier::Hot, Tier::Warm, Tier::Cold] {
                let health = self.probe(tier).await;
                crate::metrics::set_backend_healthy(tier.as_str(), health.connected);
                if !health.connected {
                    warn!(tier = %tier, error = ?health.error, "Tier probe failed");
                }
            }

            if self.dead_letters.has_pending() && self.circuits.warm.state() == CircuitState::Closed {
                match self.replay(REPLAY_BATCH).await {
                    Ok(report) if report.batches > 0 => {
                        info!(batches = report.batches, readings = report.readings, "Dead letters replayed");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Dead-letter replay failed, will retry"),
                }
            }
        }
        debug!("Maintenance loop stopped");
    }
}

impl TelemetryEngine {
    /// Start the engine.
    ///
    /// Startup flow:
    /// 1. Probe every tier (failures are logged; the router falls back)
    /// 2. Replay dead letters left from a previous run when Warm answers
    /// 3. Start the interval flusher
    /// 4. Start the scheduler
    /// 5. Start the maintenance loop (tier probes, dead-letter replay)
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), EngineError> {
        let state = self.state();
        if state != EngineState::Created {
            return Err(EngineError::InvalidTransition {
                id: "engine".to_string(),
                from: state.to_string(),
                to: EngineState::Starting.to_string(),
            });
        }
        let startup_start = Instant::now();
        info!("Starting telemetry engine");
        self.set_state(EngineState::Starting);

        // ========== PHASE 1: Probe tiers ==========
        let mut warm_up = false;
        for tier in [Tier::Hot, Tier::Warm, Tier::Cold] {
            let health = self.housekeeping.probe(tier).await;
            crate::metrics::set_backend_healthy(tier.as_str(), health.connected);
            match &health.error {
                None => info!(tier = %tier, latency_ms = ?health.latency_ms, "Tier reachable"),
                Some(e) => warn!(tier = %tier, error = %e, "Tier unreachable at startup"),
            }
            if tier == Tier::Warm {
                warm_up = health.connected;
            }
        }

        // ========== PHASE 2: Replay dead letters ==========
        if warm_up && self.dead_letters.has_pending() {
            let pending = self.dead_letters.stats().pending_batches;
            info!(pending, "Replaying dead letters from a previous run");
            let (mut batches, mut corrupt) = (0, 0);
            loop {
                match self.housekeeping.replay(REPLAY_BATCH).await {
                    Ok(report) => {
                        batches += report.batches;
                        corrupt = report.corrupt;
                        if report.batches == 0 || !self.dead_letters.has_pending() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Startup replay failed; maintenance will retry");
                        break;
                    }
                }
            }
            info!(batches, corrupt, "Startup replay complete");
        }

        // ========== PHASE 3-5: Background tasks ==========
        {
            let mut background = self.background.lock();
            background.push(self.buffer.run_flusher(self.shutdown.child_token()));
            let housekeeping = self.housekeeping.clone();
            let cancel = self.shutdown.child_token();
            background.push(tokio::spawn(housekeeping.run(cancel)));
        }
        self.scheduler.start();

        self.set_state(EngineState::Running);
        info!(
            elapsed_ms = startup_start.elapsed().as_millis() as u64,
            jobs = self.scheduler.jobs().len(),
            "Telemetry engine running"
        );
        Ok(())
    }

    /// Graceful shutdown.
    ///
    /// Refuses new readings, cancels jobs and waits for them up to
    /// `shutdown_timeout`, stops the flusher, then drains the write buffer
    /// into Warm (or the dead-letter log) and waits for back-fills.
    /// Calling it again after it finished returns an empty report.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> ShutdownReport {
        let shutdown_start = Instant::now();
        let state = self.state();
        if matches!(state, EngineState::ShuttingDown | EngineState::Stopped) {
            return ShutdownReport {
                jobs_finished: true,
                committed: 0,
                dead_lettered: 0,
                remaining: self.buffer.pending(),
                elapsed: Duration::ZERO,
            };
        }

        info!(state = %state, "Shutting down telemetry engine");
        self.set_state(EngineState::ShuttingDown);
        let deadline = self.config.shutdown_timeout();

        let jobs_finished = self.scheduler.shutdown(deadline).await;
        if !jobs_finished {
            warn!(deadline_ms = deadline.as_millis() as u64, "Jobs still running at shutdown deadline");
        }

        self.shutdown.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(error = %e, "Background task panicked");
                }
            }
        }

        let remaining_budget = deadline.saturating_sub(shutdown_start.elapsed()).max(MIN_PROBE_BUDGET);
        let (committed, dead_lettered) = match tokio::time::timeout(remaining_budget, self.buffer.drain()).await {
            Ok(report) => (report.committed, report.dead_lettered),
            Err(_) => {
                error!(pending = self.buffer.pending(), "Write buffer drain timed out");
                (0, 0)
            }
        };
        self.router.settle().await;

        let remaining = self.buffer.pending();
        if remaining > 0 {
            warn!(remaining, "Readings still buffered after shutdown");
        }

        self.set_state(EngineState::Stopped);
        let elapsed = shutdown_start.elapsed();
        info!(
            elapsed_ms = elapsed.as_millis() as u64,
            committed,
            dead_lettered,
            "Telemetry engine stopped"
        );

        ShutdownReport {
            jobs_finished,
            committed,
            dead_lettered,
            remaining,
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::engine;
    use super::*;
    use crate::reading::SensorReading;
    use crate::storage::traits::SeriesTier;
    use chrono::Utc;

    #[tokio::test]
    async fn test_state_transitions() {
        let engine = engine();
        let mut rx = engine.state_receiver();
        assert_eq!(*rx.borrow_and_update(), EngineState::Created);

        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(rx.has_changed().unwrap());

        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        let report = engine.shutdown().await;
        assert!(report.is_clean());
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_drains_buffer() {
        let engine = engine();
        engine.start().await.unwrap();
        let base = Utc::now() - chrono::Duration::minutes(10);
        for i in 0..5 {
            engine
                .ingest(SensorReading::new("n1", base + chrono::Duration::seconds(i)).with_flow(10.0))
                .await
                .unwrap();
        }

        let report = engine.shutdown().await;
        assert_eq!(report.committed, 5);
        assert_eq!(report.remaining, 0);

        let rows = engine
            .tiers()
            .warm
            .range_query("n1", crate::reading::TimeRange::trailing(chrono::Duration::hours(1), Utc::now()))
            .await
            .unwrap();
        assert_eq!(rows.len(), 5);
    }

    #[tokio::test]
    async fn test_shutdown_without_start() {
        let engine = engine();
        engine
            .ingest(SensorReading::new("n1", Utc::now()).with_pressure(3.2))
            .await
            .unwrap();
        let report = engine.shutdown().await;
        assert_eq!(report.committed, 1);
        assert_eq!(engine.state(), EngineState::Stopped);

        let again = engine.shutdown().await;
        assert_eq!(again.committed, 0);
        assert_eq!(again.elapsed, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_probe_reports_latency() {
        let engine = engine();
        let health = engine.housekeeping.probe(Tier::Warm).await;
        assert!(health.connected);
        assert!(health.latency_ms.is_some());
        assert_eq!(health.circuit, CircuitState::Closed);
    }
}
