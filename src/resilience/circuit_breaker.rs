// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-tier circuit breakers built on `recloser`.
//!
//! A tier that keeps failing or timing out is tripped open so the router
//! falls through to the next tier without waiting out another timeout
//! budget. After `recovery_timeout` a few probe calls are let through
//! (half-open) before the breaker closes again.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use tracing::{debug, warn};

use crate::storage::traits::Tier;

/// Last observed breaker state, for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Outcome of a breaker-protected call.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// Breaker is open; the operation was not attempted
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failure ratio over the closed window that trips the breaker
    pub error_rate: f32,
    /// Calls observed while closed before the rate is evaluated
    pub window: usize,
    /// Probe calls allowed while half-open
    pub half_open_probes: usize,
    /// Time spent open before probing
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.5,
            window: 10,
            half_open_probes: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Hot tier: a cache miss is cheap, so trip fast and probe again soon.
    #[must_use]
    pub fn hot() -> Self {
        Self {
            error_rate: 0.5,
            window: 6,
            half_open_probes: 1,
            recovery_timeout: Duration::from_secs(10),
        }
    }

    /// Warm tier: the operational store.
    #[must_use]
    pub fn warm() -> Self {
        Self::default()
    }

    /// Cold tier: tolerate slow queries, back off longer once tripped.
    #[must_use]
    pub fn cold() -> Self {
        Self {
            error_rate: 0.7,
            window: 10,
            half_open_probes: 2,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    #[doc(hidden)]
    pub fn test() -> Self {
        Self {
            error_rate: 0.5,
            window: 2,
            half_open_probes: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named breaker with call accounting.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    last_rejected: AtomicBool,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.error_rate)
            .closed_len(config.window)
            .half_open_len(config.half_open_probes)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            last_rejected: AtomicBool::new(false),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// State as of the most recent call.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        if self.last_rejected.load(Ordering::Relaxed) {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Run `f` through the breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(value) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.last_rejected.store(false, Ordering::Relaxed);
                crate::metrics::record_circuit_breaker_call(&self.name, "success");
                Ok(value)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                if !self.last_rejected.swap(true, Ordering::Relaxed) {
                    warn!(circuit = %self.name, "Circuit breaker open, failing fast");
                }
                crate::metrics::record_circuit_breaker_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.last_rejected.store(false, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_breaker_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// One breaker per tier.
pub struct TierCircuits {
    pub hot: CircuitBreaker,
    pub warm: CircuitBreaker,
    pub cold: CircuitBreaker,
}

impl Default for TierCircuits {
    fn default() -> Self {
        Self::new()
    }
}

impl TierCircuits {
    pub fn new() -> Self {
        Self {
            hot: CircuitBreaker::new("hot_tier", CircuitConfig::hot()),
            warm: CircuitBreaker::new("warm_tier", CircuitConfig::warm()),
            cold: CircuitBreaker::new("cold_tier", CircuitConfig::cold()),
        }
    }

    /// Same config for all three; used by tests.
    pub fn uniform(config: CircuitConfig) -> Self {
        Self {
            hot: CircuitBreaker::new("hot_tier", config.clone()),
            warm: CircuitBreaker::new("warm_tier", config.clone()),
            cold: CircuitBreaker::new("cold_tier", config),
        }
    }

    #[must_use]
    pub fn for_tier(&self, tier: Tier) -> &CircuitBreaker {
        match tier {
            Tier::Hot => &self.hot,
            Tier::Warm => &self.warm,
            Tier::Cold => &self.cold,
        }
    }
}
