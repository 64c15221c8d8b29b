// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry with exponential backoff.
//!
//! Presets cover the three places the engine retries: connecting to a tier
//! at startup, individual tier queries, and write-buffer flushes (configured
//! from [`BufferConfig`](crate::config::BufferConfig)).
//!
//! # Example
//!
//! ```
//! use hydro_sync::RetryConfig;
//!
//! assert_eq!(RetryConfig::startup().max_attempts, 5);
//! assert_eq!(RetryConfig::query().max_attempts, 3);
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

/// Backoff policy. `max_attempts` includes the first try.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Fast-fail for initial tier connections (~5 s total).
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Three quick attempts for a single tier query.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    #[doc(hidden)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Sleep after the `failures`-th consecutive failure.
    #[must_use]
    pub fn delay_for(&self, failures: usize) -> Duration {
        (1..failures).fold(self.initial_delay, |delay, _| delay.mul_f64(self.factor).min(self.max_delay))
    }
}

/// Retry `operation` on every error until it succeeds or attempts run out.
pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(operation_name, config, |_| true, operation).await
}

/// Retry `operation` while `should_retry` accepts the error.
///
/// Errors rejected by `should_retry` are returned immediately.
pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut failures = 0usize;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if failures > 0 {
                    info!(operation = operation_name, failures, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };
        failures += 1;
        if !should_retry(&err) || failures >= config.max_attempts {
            return Err(err);
        }
        let delay = config.delay_for(failures);
        warn!(
            operation = operation_name,
            attempt = failures,
            max_attempts = config.max_attempts,
            error = %err,
            next_in = ?delay,
            "Attempt failed, retrying"
        );
        sleep(delay).await;
    }
}
