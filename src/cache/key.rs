// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregation::bucket::WindowSize;
use crate::reading::TimeRange;

/// Groups of keys that get invalidated together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheFamily {
    Latest,
    Range,
    Bucket,
    Summary,
}

impl CacheFamily {
    pub const ALL: [CacheFamily; 4] = [Self::Latest, Self::Range, Self::Bucket, Self::Summary];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::Range => "range",
            Self::Bucket => "agg",
            Self::Summary => "summary",
        }
    }
}

/// A Hot-tier key, always tied to one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Most recent reading of a node
    Latest { node_id: String },
    /// Raw readings over a half-open range
    Range { node_id: String, start_ms: i64, end_ms: i64 },
    /// One materialized aggregate bucket
    Bucket { node_id: String, window: WindowSize, start_ms: i64 },
    /// Rolling per-node summary kept by the cache refresh job
    Summary { node_id: String },
}

impl CacheKey {
    pub fn latest(node_id: impl Into<String>) -> Self {
        Self::Latest { node_id: node_id.into() }
    }

    pub fn range(node_id: impl Into<String>, range: TimeRange) -> Self {
        Self::Range {
            node_id: node_id.into(),
            start_ms: range.start_ms(),
            end_ms: range.end_ms(),
        }
    }

    pub fn bucket(node_id: impl Into<String>, window: WindowSize, start: DateTime<Utc>) -> Self {
        Self::Bucket {
            node_id: node_id.into(),
            window,
            start_ms: start.timestamp_millis(),
        }
    }

    pub fn summary(node_id: impl Into<String>) -> Self {
        Self::Summary { node_id: node_id.into() }
    }

    pub fn family(&self) -> CacheFamily {
        match self {
            Self::Latest { .. } => CacheFamily::Latest,
            Self::Range { .. } => CacheFamily::Range,
            Self::Bucket { .. } => CacheFamily::Bucket,
            Self::Summary { .. } => CacheFamily::Summary,
        }
    }

    pub fn node_id(&self) -> &str {
        match self {
            Self::Latest { node_id }
            | Self::Range { node_id, .. }
            | Self::Bucket { node_id, .. }
            | Self::Summary { node_id } => node_id,
        }
    }

    /// Whether a reading at `ts_ms` can change the cached value.
    pub fn covers(&self, ts_ms: i64) -> bool {
        match self {
            Self::Latest { .. } | Self::Summary { .. } => true,
            Self::Range { start_ms, end_ms, .. } => *start_ms <= ts_ms && ts_ms < *end_ms,
            Self::Bucket { window, start_ms, .. } => {
                *start_ms <= ts_ms && ts_ms < start_ms + window.seconds() * 1000
            }
        }
    }

    /// Key as stored in the Hot tier.
    pub fn render(&self) -> String {
        match self {
            Self::Latest { node_id } => format!("latest:{}", node_id),
            Self::Range { node_id, start_ms, end_ms } => format!("range:{}:{}:{}", node_id, start_ms, end_ms),
            Self::Bucket { node_id, window, start_ms } => format!("agg:{}:{}:{}", window, node_id, start_ms),
            Self::Summary { node_id } => format!("summary:{}", node_id),
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}
