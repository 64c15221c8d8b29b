// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine-level error taxonomy.
//!
//! Tier backends report [`StorageError`]; everything the engine surfaces to
//! callers is an [`EngineError`]. Only [`EngineError::AllTiersUnavailable`]
//! is a terminal read failure; a single slow or dead tier is absorbed by
//! fallback and shows up in logs and metrics instead.

use thiserror::Error;

use crate::storage::traits::{StorageError, Tier};

#[derive(Error, Debug)]
pub enum EngineError {
    /// Tier timed out, refused a connection, or its breaker is open.
    #[error("tier {tier} unavailable: {reason}")]
    TransientTierUnavailable { tier: Tier, reason: String },

    /// Every tier consulted for a read failed.
    #[error("all tiers unavailable for node '{node_id}' ({attempts})")]
    AllTiersUnavailable { node_id: String, attempts: String },

    /// Batch flush or job execution failed.
    #[error("sync failure in {operation}: {reason}")]
    SyncFailure { operation: String, reason: String },

    /// Out-of-range or non-monotonic value.
    #[error("data quality violation on '{node_id}': {detail}")]
    DataQualityViolation { node_id: String, detail: String },

    /// The named job already has a run in flight.
    #[error("job '{job}' is already running (job id {running_job_id})")]
    SchedulerConflict { job: String, running_job_id: String },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    /// Ingestion refused because buffered readings hit the configured cap.
    #[error("write buffer full: {pending} readings pending (cap {cap})")]
    Backpressure { pending: usize, cap: usize },

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EngineError {
    /// Build a `SyncFailure` from any displayable error.
    pub fn sync(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::SyncFailure {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Classify a failed tier call: connection loss and timeouts become
    /// `TransientTierUnavailable`, anything else stays a storage error.
    pub fn from_tier(tier: Tier, err: StorageError) -> Self {
        if err.is_transient() {
            Self::TransientTierUnavailable {
                tier,
                reason: err.to_string(),
            }
        } else {
            Self::Storage(err)
        }
    }

    /// Whether retrying later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientTierUnavailable { .. }
            | Self::AllTiersUnavailable { .. }
            | Self::SyncFailure { .. }
            | Self::Backpressure { .. } => true,
            Self::Storage(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let e = EngineError::SchedulerConflict {
            job: "daily_sync".into(),
            running_job_id: "abc".into(),
        };
        assert_eq!(e.to_string(), "job 'daily_sync' is already running (job id abc)");

        let e = EngineError::TransientTierUnavailable {
            tier: Tier::Warm,
            reason: "timeout after 500ms".into(),
        };
        assert!(e.to_string().contains("warm"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::sync("flush", "boom").is_transient());
        assert!(EngineError::Storage(StorageError::Timeout("x".into())).is_transient());
        assert!(!EngineError::Storage(StorageError::Serialization("x".into())).is_transient());
        assert!(!EngineError::NotFound { what: "anomaly", id: "1".into() }.is_transient());
    }

    #[test]
    fn test_from_tier() {
        let e = EngineError::from_tier(Tier::Cold, StorageError::Timeout("5s".into()));
        assert!(matches!(e, EngineError::TransientTierUnavailable { tier: Tier::Cold, .. }));

        let e = EngineError::from_tier(Tier::Warm, StorageError::Serialization("bad row".into()));
        assert!(matches!(e, EngineError::Storage(StorageError::Serialization(_))));
    }
}
