// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sensor reading data structure.
//!
//! A [`SensorReading`] is the unit that flows through every tier. Readings are
//! append-only and uniquely keyed by `(node_id, timestamp)`; timestamps are
//! kept at millisecond precision so the key survives a round trip through
//! any backend.
//!
//! # Example
//!
//! ```
//! use hydro_sync::{SensorReading, MetricKind};
//! use chrono::{TimeZone, Utc};
//!
//! let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
//! let reading = SensorReading::new("node-7", ts)
//!     .with_flow(12.5)
//!     .with_pressure(3.1);
//!
//! assert_eq!(reading.metric(MetricKind::FlowRate), 12.5);
//! assert_eq!(reading.key().timestamp_ms, ts.timestamp_millis());
//! ```

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// One telemetry sample from a monitoring node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    /// Instantaneous flow (m³/h)
    pub flow_rate: f64,
    /// Line pressure (bar)
    pub pressure: f64,
    /// Water temperature (°C)
    pub temperature: f64,
    /// Monotonic totalizer (m³). Only decreases at an explicit counter reset.
    pub total_flow: f64,
    /// Sensor-reported confidence, 0.0 - 1.0
    pub quality_score: f64,
    /// Marks the reading at which the totalizer was reset
    #[serde(default)]
    pub counter_reset: bool,
}

impl SensorReading {
    /// Create a reading with zeroed metrics and full quality.
    ///
    /// The timestamp is truncated to millisecond precision.
    pub fn new(node_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp: truncate_millis(timestamp),
            flow_rate: 0.0,
            pressure: 0.0,
            temperature: 0.0,
            total_flow: 0.0,
            quality_score: 1.0,
            counter_reset: false,
        }
    }

    #[must_use]
    pub fn with_flow(mut self, flow_rate: f64) -> Self {
        self.flow_rate = flow_rate;
        self
    }

    #[must_use]
    pub fn with_pressure(mut self, pressure: f64) -> Self {
        self.pressure = pressure;
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    #[must_use]
    pub fn with_total_flow(mut self, total_flow: f64) -> Self {
        self.total_flow = total_flow;
        self
    }

    #[must_use]
    pub fn with_quality(mut self, quality_score: f64) -> Self {
        self.quality_score = quality_score;
        self
    }

    /// Mark this reading as the point where the totalizer was reset.
    #[must_use]
    pub fn as_counter_reset(mut self) -> Self {
        self.counter_reset = true;
        self
    }

    /// Unique key of this reading.
    #[must_use]
    pub fn key(&self) -> ReadingKey {
        ReadingKey {
            node_id: self.node_id.clone(),
            timestamp_ms: self.timestamp.timestamp_millis(),
        }
    }

    /// Value of a single metric.
    #[must_use]
    pub fn metric(&self, kind: MetricKind) -> f64 {
        match kind {
            MetricKind::FlowRate => self.flow_rate,
            MetricKind::Pressure => self.pressure,
            MetricKind::Temperature => self.temperature,
            MetricKind::TotalFlow => self.total_flow,
        }
    }

    /// Copy with the timestamp truncated to millisecond precision.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.timestamp = truncate_millis(self.timestamp);
        self
    }
}

/// `(node_id, timestamp)` identity of a reading.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReadingKey {
    pub node_id: String,
    pub timestamp_ms: i64,
}

/// The measured quantities carried by a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    FlowRate,
    Pressure,
    Temperature,
    TotalFlow,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::FlowRate,
        MetricKind::Pressure,
        MetricKind::Temperature,
        MetricKind::TotalFlow,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FlowRate => "flow_rate",
            Self::Pressure => "pressure",
            Self::Temperature => "temperature",
            Self::TotalFlow => "total_flow",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flow_rate" => Ok(Self::FlowRate),
            "pressure" => Ok(Self::Pressure),
            "temperature" => Ok(Self::Temperature),
            "total_flow" => Ok(Self::TotalFlow),
            other => Err(format!("unknown metric '{}'", other)),
        }
    }
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `window` immediately preceding `now`.
    pub fn trailing(window: Duration, now: DateTime<Utc>) -> Self {
        Self { start: now - window, end: now }
    }

    #[must_use]
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_ms(&self) -> i64 {
        self.end.timestamp_millis()
    }
}

/// Truncate a timestamp to whole milliseconds.
pub fn truncate_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(ts.timestamp_millis())
}

/// Epoch milliseconds to a UTC timestamp (clamped to the epoch if out of range).
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_truncates_to_millis() {
        let ts = Utc.timestamp_nanos(1_700_000_000_123_456_789);
        let reading = SensorReading::new("n1", ts);
        assert_eq!(reading.timestamp.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(reading.timestamp.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn test_metric_accessor() {
        let r = SensorReading::new("n1", Utc::now())
            .with_flow(1.0)
            .with_pressure(2.0)
            .with_temperature(3.0)
            .with_total_flow(4.0);
        assert_eq!(r.metric(MetricKind::FlowRate), 1.0);
        assert_eq!(r.metric(MetricKind::Pressure), 2.0);
        assert_eq!(r.metric(MetricKind::Temperature), 3.0);
        assert_eq!(r.metric(MetricKind::TotalFlow), 4.0);
    }

    #[test]
    fn test_metric_kind_parse_roundtrip() {
        for kind in MetricKind::ALL {
            assert_eq!(kind.as_str().parse::<MetricKind>().unwrap(), kind);
        }
        assert!("humidity".parse::<MetricKind>().is_err());
    }

    #[test]
    fn test_time_range_half_open() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let range = TimeRange::new(start, start + Duration::minutes(5));
        assert!(range.contains(start));
        assert!(range.contains(start + Duration::seconds(299)));
        assert!(!range.contains(start + Duration::minutes(5)));
        assert!(!range.is_empty());
        assert!(TimeRange::new(start, start).is_empty());
    }

    #[test]
    fn test_reading_deserializes_without_reset_flag() {
        let json = r#"{"node_id":"n1","timestamp":"2026-01-01T00:00:00Z","flow_rate":1.0,
            "pressure":2.0,"temperature":10.0,"total_flow":5.0,"quality_score":0.9}"#;
        let r: SensorReading = serde_json::from_str(json).unwrap();
        assert!(!r.counter_reset);
    }
}
