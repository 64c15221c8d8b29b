// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Aggregate bucket model.
//!
//! A bucket is a pure function of the raw readings in
//! `[bucket_start, bucket_start + window)`: inputs are ordered by timestamp
//! and de-duplicated before any arithmetic, so recomputing from the same
//! rows always yields the same bytes. The time a bucket was materialized is
//! kept next to it (see [`StoredBucket`](crate::storage::traits::StoredBucket)),
//! never inside it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::reading::{from_millis, MetricKind, SensorReading, TimeRange};

/// Rollup granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WindowSize {
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "1d")]
    Day,
}

impl WindowSize {
    pub const ALL: [WindowSize; 3] = [WindowSize::FiveMinutes, WindowSize::Hour, WindowSize::Day];

    #[must_use]
    pub fn seconds(&self) -> i64 {
        match self {
            Self::FiveMinutes => 300,
            Self::Hour => 3_600,
            Self::Day => 86_400,
        }
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds())
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FiveMinutes => "5m",
            Self::Hour => "1h",
            Self::Day => "1d",
        }
    }

    /// Start of the bucket containing `ts` (UTC, epoch aligned).
    #[must_use]
    pub fn align(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let width_ms = self.seconds() * 1_000;
        from_millis(ts.timestamp_millis().div_euclid(width_ms) * width_ms)
    }

    /// Bucket starts overlapping `range`, oldest first.
    #[must_use]
    pub fn starts_in(&self, range: TimeRange) -> Vec<DateTime<Utc>> {
        let mut starts = Vec::new();
        if range.is_empty() {
            return starts;
        }
        let mut cursor = self.align(range.start);
        while cursor < range.end {
            starts.push(cursor);
            cursor += self.duration();
        }
        starts
    }

    /// `[start, start + window)`
    #[must_use]
    pub fn span(&self, start: DateTime<Utc>) -> TimeRange {
        TimeRange::new(start, start + self.duration())
    }
}

impl std::fmt::Display for WindowSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WindowSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "5m" => Ok(Self::FiveMinutes),
            "1h" => Ok(Self::Hour),
            "1d" => Ok(Self::Day),
            other => Err(format!("unknown window size '{}'", other)),
        }
    }
}

/// avg/min/max/count of one metric.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

impl MetricStats {
    /// Fold values in the order given.
    fn from_values(values: impl Iterator<Item = f64>) -> Self {
        let mut stats = MetricStats::default();
        let mut sum = 0.0;
        for v in values {
            if stats.count == 0 {
                stats.min = v;
                stats.max = v;
            } else {
                stats.min = stats.min.min(v);
                stats.max = stats.max.max(v);
            }
            sum += v;
            stats.count += 1;
        }
        if stats.count > 0 {
            stats.avg = sum / stats.count as f64;
        }
        stats
    }
}

/// Rolled-up statistics of one node over one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateBucket {
    pub node_id: String,
    pub window: WindowSize,
    pub bucket_start: DateTime<Utc>,
    pub flow_rate: MetricStats,
    pub pressure: MetricStats,
    pub temperature: MetricStats,
    pub total_flow: MetricStats,
    /// Volume delivered inside the bucket, summed across counter resets
    pub consumption: f64,
}

impl AggregateBucket {
    /// Compute a bucket from raw readings.
    ///
    /// Readings outside the bucket or for another node are ignored. Duplicate
    /// timestamps keep the last occurrence, matching upsert semantics.
    pub fn from_readings(
        node_id: &str,
        window: WindowSize,
        bucket_start: DateTime<Utc>,
        readings: &[SensorReading],
    ) -> Self {
        let span = window.span(bucket_start);

        let mut rows: Vec<&SensorReading> = readings
            .iter()
            .filter(|r| r.node_id == node_id && span.contains(r.timestamp))
            .collect();
        rows.sort_by_key(|r| r.timestamp);
        // keep the last of each run of equal timestamps
        let mut deduped: Vec<&SensorReading> = Vec::with_capacity(rows.len());
        for r in rows {
            match deduped.last_mut() {
                Some(prev) if prev.timestamp == r.timestamp => *prev = r,
                _ => deduped.push(r),
            }
        }

        let stats = |kind: MetricKind| MetricStats::from_values(deduped.iter().map(|r| r.metric(kind)));

        let mut consumption = 0.0;
        for pair in deduped.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            if next.counter_reset {
                consumption += next.total_flow.max(0.0);
            } else if next.total_flow >= prev.total_flow {
                consumption += next.total_flow - prev.total_flow;
            }
        }

        Self {
            node_id: node_id.to_string(),
            window,
            bucket_start,
            flow_rate: stats(MetricKind::FlowRate),
            pressure: stats(MetricKind::Pressure),
            temperature: stats(MetricKind::Temperature),
            total_flow: stats(MetricKind::TotalFlow),
            consumption,
        }
    }

    /// Number of readings folded into this bucket.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.flow_rate.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    #[must_use]
    pub fn stats(&self, kind: MetricKind) -> &MetricStats {
        match kind {
            MetricKind::FlowRate => &self.flow_rate,
            MetricKind::Pressure => &self.pressure,
            MetricKind::Temperature => &self.temperature,
            MetricKind::TotalFlow => &self.total_flow,
        }
    }

    #[must_use]
    pub fn bucket_end(&self) -> DateTime<Utc> {
        self.bucket_start + self.window.duration()
    }
}
