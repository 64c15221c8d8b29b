// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Statistical anomaly detection.
//!
//! The [`AnomalyDetector`] compares recent Warm-tier readings against a
//! trailing baseline and records an [`Anomaly`] for every point whose z-score
//! exceeds the per-metric threshold. Anomalies are stored through an
//! [`AnomalyStore`] and announced once, when first created, to a
//! [`NotificationSink`].
//!
//! # Lifecycle
//!
//! ```text
//! Active ──acknowledge──► Acknowledged ──resolve──► Resolved
//!    └──────────────────resolve──────────────────────┘
//! ```
//!
//! Transitions only move forward; anything else is an
//! [`EngineError::InvalidTransition`].

pub mod detector;
pub mod sink;
pub mod store;

pub use detector::{detect, AnomalyDetector, Baseline, SweepReport};
pub use sink::{ChannelSink, LogSink, NotificationSink};
pub use store::{AnomalyStore, MemoryAnomalyStore, SqlAnomalyStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::reading::MetricKind;

/// How far past its threshold a point landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Grade a z-score against the threshold `k` it crossed.
    pub fn from_ratio(score: f64, k: f64) -> Self {
        let ratio = if k > 0.0 { score / k } else { score };
        if ratio < 1.5 {
            Self::Low
        } else if ratio < 2.5 {
            Self::Medium
        } else if ratio < 4.0 {
            Self::High
        } else {
            Self::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Likely physical cause, as far as the heuristics can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Flow up while pressure drops
    Burst,
    /// Flow sinking gradually with steady pressure
    SensorFault,
    /// Pressure spike without a flow change
    ValvePumpEvent,
    Unclassified,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Burst => "burst",
            Self::SensorFault => "sensor_fault",
            Self::ValvePumpEvent => "valve_pump_event",
            Self::Unclassified => "unclassified",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl AnomalyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
        }
    }

    /// Whether `self -> to` is a permitted forward move.
    pub fn can_move_to(&self, to: AnomalyStatus) -> bool {
        matches!(
            (self, to),
            (Self::Active, Self::Acknowledged) | (Self::Active, Self::Resolved) | (Self::Acknowledged, Self::Resolved)
        )
    }
}

impl std::fmt::Display for AnomalyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A flagged reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: String,
    pub node_id: String,
    /// Metric with the largest deviation at this timestamp
    pub metric: MetricKind,
    pub severity: Severity,
    pub classification: Classification,
    pub status: AnomalyStatus,
    /// Absolute z-score of `value`
    pub score: f64,
    pub value: f64,
    pub baseline_mean: f64,
    pub baseline_stddev: f64,
    /// Timestamp of the offending reading
    pub observed_at: DateTime<Utc>,
    /// When the sweep flagged it
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Operator notes, oldest first
    #[serde(default)]
    pub notes: Vec<String>,
}

impl Anomaly {
    /// Apply a lifecycle transition in place.
    pub fn transition(&mut self, to: AnomalyStatus, note: Option<&str>, at: DateTime<Utc>) -> Result<(), EngineError> {
        if !self.status.can_move_to(to) {
            return Err(EngineError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        match to {
            AnomalyStatus::Acknowledged => self.acknowledged_at = Some(at),
            AnomalyStatus::Resolved => self.resolved_at = Some(at),
            AnomalyStatus::Active => {}
        }
        if let Some(note) = note.filter(|n| !n.trim().is_empty()) {
            self.notes.push(note.to_string());
        }
        self.status = to;
        Ok(())
    }

    /// Identity used to avoid recording the same point twice.
    pub fn dedup_key(&self) -> (String, MetricKind, i64) {
        (self.node_id.clone(), self.metric, self.observed_at.timestamp_millis())
    }
}

/// Query for [`AnomalyStore::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AnomalyFilter {
    pub node_id: Option<String>,
    pub metric: Option<MetricKind>,
    pub status: Option<AnomalyStatus>,
    pub min_severity: Option<Severity>,
    pub classification: Option<Classification>,
    /// Inclusive lower bound on `observed_at`
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `observed_at`
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AnomalyFilter {
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: AnomalyStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn matches(&self, a: &Anomaly) -> bool {
        self.node_id.as_deref().map_or(true, |n| n == a.node_id)
            && self.metric.map_or(true, |m| m == a.metric)
            && self.status.map_or(true, |s| s == a.status)
            && self.min_severity.map_or(true, |s| a.severity >= s)
            && self.classification.map_or(true, |c| c == a.classification)
            && self.since.map_or(true, |t| a.observed_at >= t)
            && self.until.map_or(true, |t| a.observed_at < t)
    }

    /// Newest first, truncated to `limit`.
    pub(crate) fn finish(&self, mut found: Vec<Anomaly>) -> Vec<Anomaly> {
        found.sort_by(|a, b| b.observed_at.cmp(&a.observed_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = self.limit {
            found.truncate(limit);
        }
        found
    }
}
