// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-node buffer partition.

use chrono::{DateTime, Utc};

use crate::reading::SensorReading;

/// Why a partition was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Partition reached `flush_count`
    Count,
    /// Flush interval elapsed
    Interval,
    /// Buffer is filling up; flush whatever is there
    Pressure,
    /// Requested by a caller
    Manual,
    /// Engine is stopping
    Shutdown,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Interval => "interval",
            Self::Pressure => "pressure",
            Self::Manual => "manual",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Readings of one node waiting for the Warm tier, in arrival order.
#[derive(Debug, Default)]
pub struct Partition {
    readings: Vec<SensorReading>,
    /// Wall-clock arrival of the oldest queued reading
    oldest_at: Option<DateTime<Utc>>,
    /// Wall-clock arrival of the oldest reading currently being flushed
    in_flight_since: Option<DateTime<Utc>>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn push(&mut self, reading: SensorReading, now: DateTime<Utc>) {
        if self.readings.is_empty() {
            self.oldest_at = Some(now);
        }
        self.readings.push(reading);
    }

    /// Take everything for a flush. The partition remembers when the taken
    /// readings arrived until [`finish`](Self::finish) is called.
    pub fn take(&mut self) -> Vec<SensorReading> {
        self.in_flight_since = self.oldest_at.take();
        std::mem::take(&mut self.readings)
    }

    /// A flush finished (committed or dead-lettered).
    pub fn finish(&mut self) {
        self.in_flight_since = None;
    }

    /// Put a failed batch back in front of anything queued since.
    pub fn restore(&mut self, mut batch: Vec<SensorReading>) {
        let arrived = self.in_flight_since.take();
        batch.append(&mut self.readings);
        self.readings = batch;
        self.oldest_at = match (arrived, self.oldest_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }

    /// Nothing queued and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.readings.is_empty() && self.in_flight_since.is_none()
    }

    /// Arrival time of the oldest reading not yet in the Warm tier.
    pub fn oldest_unflushed(&self) -> Option<DateTime<Utc>> {
        match (self.oldest_at, self.in_flight_since) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
