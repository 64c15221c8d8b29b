// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Data quality screening.
//!
//! Readings are never rejected at ingestion. Instead, anything deriving data
//! from raw rows (aggregates, anomaly baselines, the quality check job)
//! screens them first and drops readings that are out of range, carry a low
//! sensor confidence, or show an unmarked decrease of the flow totalizer.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::QualityRules;
use crate::error::EngineError;
use crate::reading::{MetricKind, SensorReading};

#[derive(Debug, Clone, PartialEq)]
pub enum ViolationKind {
    OutOfRange { metric: MetricKind, value: f64 },
    LowQuality { score: f64 },
    /// `total_flow` went down without a counter-reset marker
    CounterDecrease { previous: f64, current: f64 },
}

impl ViolationKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::OutOfRange { .. } => "out_of_range",
            Self::LowQuality { .. } => "low_quality",
            Self::CounterDecrease { .. } => "counter_decrease",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualityViolation {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: ViolationKind,
}

impl std::fmt::Display for QualityViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ViolationKind::OutOfRange { metric, value } => {
                write!(f, "{} = {} out of range at {}", metric, value, self.timestamp)
            }
            ViolationKind::LowQuality { score } => {
                write!(f, "quality score {} below threshold at {}", score, self.timestamp)
            }
            ViolationKind::CounterDecrease { previous, current } => write!(
                f,
                "total_flow decreased {} -> {} without reset at {}",
                previous, current, self.timestamp
            ),
        }
    }
}

impl From<QualityViolation> for EngineError {
    fn from(v: QualityViolation) -> Self {
        EngineError::DataQualityViolation {
            node_id: v.node_id.clone(),
            detail: v.to_string(),
        }
    }
}

/// Readings that passed screening plus what was dropped.
#[derive(Debug, Clone, Default)]
pub struct Screened {
    pub accepted: Vec<SensorReading>,
    pub violations: Vec<QualityViolation>,
}

/// Point checks that need no history.
pub fn check_reading(rules: &QualityRules, reading: &SensorReading) -> Option<QualityViolation> {
    let violation = |kind| QualityViolation {
        node_id: reading.node_id.clone(),
        timestamp: reading.timestamp,
        kind,
    };

    if !(reading.quality_score >= rules.min_quality_score) {
        return Some(violation(ViolationKind::LowQuality {
            score: reading.quality_score,
        }));
    }
    for metric in MetricKind::ALL {
        let value = reading.metric(metric);
        let in_range = match rules.ranges.get(&metric) {
            Some(range) => range.contains(value),
            None => value.is_finite(),
        };
        if !in_range {
            return Some(violation(ViolationKind::OutOfRange { metric, value }));
        }
    }
    None
}

/// Screen a series of readings.
///
/// The series is sorted by timestamp first. `previous_total` seeds the
/// totalizer check with the last accepted value before the series.
pub fn screen(rules: &QualityRules, readings: &[SensorReading], previous_total: Option<f64>) -> Screened {
    let mut sorted: Vec<&SensorReading> = readings.iter().collect();
    sorted.sort_by(|a, b| (a.node_id.as_str(), a.timestamp).cmp(&(b.node_id.as_str(), b.timestamp)));

    let mut out = Screened::default();
    let mut last_node: Option<&str> = None;
    let mut last_total = previous_total;

    for r in sorted {
        if last_node != Some(r.node_id.as_str()) {
            if last_node.is_some() {
                last_total = None;
            }
            last_node = Some(r.node_id.as_str());
        }

        if let Some(v) = check_reading(rules, r) {
            debug!(node_id = %r.node_id, violation = %v, "Reading excluded by quality screen");
            crate::metrics::record_quality_violation(v.kind.label());
            out.violations.push(v);
            continue;
        }

        if let Some(prev) = last_total {
            if r.total_flow < prev && !r.counter_reset {
                let v = QualityViolation {
                    node_id: r.node_id.clone(),
                    timestamp: r.timestamp,
                    kind: ViolationKind::CounterDecrease {
                        previous: prev,
                        current: r.total_flow,
                    },
                };
                debug!(node_id = %r.node_id, violation = %v, "Reading excluded by quality screen");
                crate::metrics::record_quality_violation(v.kind.label());
                out.violations.push(v);
                continue;
            }
        }

        last_total = Some(r.total_flow);
        out.accepted.push(r.clone());
    }
    out
}
