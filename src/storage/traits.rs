// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregation::bucket::{AggregateBucket, WindowSize};
use crate::reading::{SensorReading, TimeRange};

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Operation timed out: {0}")]
    Timeout(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Payload corruption detected for batch '{id}': expected hash {expected}, got {actual}")]
    Corruption {
        id: String,
        expected: String,
        actual: String,
    },
}

impl StorageError {
    /// Connection loss and timeouts are worth retrying; bad data is not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_) | Self::Backend(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Latency-ordered storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Key-value cache
    Hot,
    /// Operational time-series store
    Warm,
    /// Long-term analytical archive
    Cold,
}

impl Tier {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an idempotent batch upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchWriteResult {
    /// Unique batch ID for this write (audit trail)
    pub batch_id: String,
    /// Rows applied (new or replaced)
    pub written: usize,
}

/// An aggregate bucket plus the moment it was materialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBucket {
    pub bucket: AggregateBucket,
    pub computed_at: DateTime<Utc>,
}

/// Behaviour shared by every tier backend.
#[async_trait]
pub trait TierClient: Send + Sync {
    /// Which layer this backend serves.
    fn tier(&self) -> Tier;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), StorageError>;
}

/// Key-value cache tier (Redis or in-memory).
#[async_trait]
pub trait HotTier: TierClient {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError>;
    /// Remaining time-to-live, `None` when the key is missing or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Delete several keys. Backends override this with a single round trip.
    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }
}

/// Time-series tier (Warm operational store or Cold archive).
#[async_trait]
pub trait SeriesTier: TierClient {
    /// Insert-or-replace keyed by `(node_id, timestamp)`. Re-applying the same
    /// rows must leave the store unchanged.
    async fn upsert(&self, rows: &[SensorReading]) -> Result<BatchWriteResult, StorageError>;

    /// Readings of one node in `[range.start, range.end)`, ordered by timestamp.
    async fn range_query(&self, node_id: &str, range: TimeRange) -> Result<Vec<SensorReading>, StorageError>;

    /// Most recent reading of a node.
    async fn latest(&self, node_id: &str) -> Result<Option<SensorReading>, StorageError>;

    /// Delete readings strictly older than `older_than`. Returns rows deleted.
    async fn delete_older_than(&self, node_id: &str, older_than: DateTime<Utc>) -> Result<u64, StorageError>;

    /// Number of readings of one node inside `range`.
    async fn count_range(&self, node_id: &str, range: TimeRange) -> Result<u64, StorageError>;

    /// Distinct node ids present in this tier.
    async fn node_ids(&self) -> Result<Vec<String>, StorageError>;

    /// Overwrite a materialized aggregate bucket.
    async fn upsert_bucket(&self, bucket: &AggregateBucket, computed_at: DateTime<Utc>) -> Result<(), StorageError>;

    /// Materialized buckets of one node and window whose start lies in `range`.
    async fn bucket_range(
        &self,
        node_id: &str,
        window: WindowSize,
        range: TimeRange,
    ) -> Result<Vec<StoredBucket>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_display_and_order() {
        assert_eq!(Tier::Hot.to_string(), "hot");
        assert_eq!(Tier::Cold.to_string(), "cold");
        assert!(Tier::Hot < Tier::Warm && Tier::Warm < Tier::Cold);
    }

    #[test]
    fn test_transient_errors() {
        assert!(StorageError::Timeout("t".into()).is_transient());
        assert!(StorageError::Unavailable("u".into()).is_transient());
        assert!(!StorageError::NotFound.is_transient());
        assert!(!StorageError::Serialization("s".into()).is_transient());
    }
}
