// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failure handling: retry with backoff, per-tier circuit breakers and the
//! dead-letter log for batches that could not be flushed.

pub mod circuit_breaker;
pub mod dead_letter;
pub mod retry;

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::storage::traits::{StorageError, Tier};
use circuit_breaker::{CircuitBreaker, CircuitError};

/// Run one tier call through its breaker with a deadline.
///
/// A timeout counts as a breaker failure. An open breaker and a timeout
/// both come back as transient errors so callers can fall through.
pub async fn guarded<T, F, Fut>(
    circuit: &CircuitBreaker,
    tier: Tier,
    operation: &'static str,
    budget: Duration,
    f: F,
) -> Result<T, StorageError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let _timer = crate::metrics::LatencyTimer::new(tier.as_str(), operation);
    let result = circuit
        .call(|| async move {
            match tokio::time::timeout(budget, f()).await {
                Ok(inner) => inner,
                Err(_) => Err(StorageError::Timeout(format!(
                    "{} {} exceeded {}ms",
                    tier,
                    operation,
                    budget.as_millis()
                ))),
            }
        })
        .await;

    match result {
        Ok(value) => {
            crate::metrics::record_tier_operation(tier.as_str(), operation, "success");
            Ok(value)
        }
        Err(CircuitError::Rejected) => {
            crate::metrics::record_tier_operation(tier.as_str(), operation, "rejected");
            Err(StorageError::Unavailable(format!("{} circuit open", tier)))
        }
        Err(CircuitError::Inner(e)) => {
            let status = if matches!(e, StorageError::Timeout(_)) {
                crate::metrics::record_tier_timeout(tier.as_str(), operation);
                "timeout"
            } else {
                "error"
            };
            debug!(tier = %tier, operation, error = %e, "Tier call failed");
            crate::metrics::record_tier_operation(tier.as_str(), operation, status);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use circuit_breaker::CircuitConfig;

    #[tokio::test]
    async fn test_guarded_passes_value_through() {
        let cb = CircuitBreaker::new("t", CircuitConfig::test());
        let v = guarded(&cb, Tier::Warm, "get", Duration::from_secs(1), || async {
            Ok::<_, StorageError>(7)
        })
        .await
        .unwrap();
        assert_eq!(v, 7);
        assert_eq!(cb.successes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_times_out() {
        let cb = CircuitBreaker::new("t", CircuitConfig::test());
        let err = guarded(&cb, Tier::Cold, "range_query", Duration::from_millis(50), || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, StorageError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::Timeout(_)));
        assert_eq!(cb.failures(), 1);
    }

    #[tokio::test]
    async fn test_guarded_keeps_inner_error() {
        let cb = CircuitBreaker::new("t", CircuitConfig::test());
        let err = guarded(&cb, Tier::Hot, "get", Duration::from_secs(1), || async {
            Err::<(), _>(StorageError::Backend("boom".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
    }
}
