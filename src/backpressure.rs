// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write-buffer backpressure.
//!
//! The buffer's fill ratio (buffered readings / global cap) maps onto a
//! small cascade. Producers are only refused once the buffer is actually
//! full; below that the buffer reacts by flushing earlier.
//!
//! # Example
//!
//! ```
//! use hydro_sync::BackpressureLevel;
//!
//! let level = BackpressureLevel::from_fill(100, 1_000);
//! assert_eq!(level, BackpressureLevel::Normal);
//! assert!(level.should_accept_writes());
//!
//! let level = BackpressureLevel::from_fill(750, 1_000);
//! assert!(level.flush_eagerly());
//!
//! let level = BackpressureLevel::from_fill(1_000, 1_000);
//! assert!(!level.should_accept_writes());
//! ```

/// Buffer pressure level.
///
/// - **Normal** (< 70%): thresholds apply as configured
/// - **Elevated** (70-90%): partitions flush as soon as they hold anything
/// - **High** (90-100%): as Elevated, plus warnings
/// - **Full** (100%): new readings are refused with `Backpressure`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackpressureLevel {
    Normal = 0,
    Elevated = 1,
    High = 2,
    Full = 3,
}

impl BackpressureLevel {
    /// Level for a fill ratio in 0.0 → 1.0.
    #[must_use]
    pub fn from_pressure(pressure: f64) -> Self {
        match pressure {
            p if p < 0.70 => Self::Normal,
            p if p < 0.90 => Self::Elevated,
            p if p < 1.0 => Self::High,
            _ => Self::Full,
        }
    }

    /// Level for `pending` buffered readings against `cap`.
    #[must_use]
    pub fn from_fill(pending: usize, cap: usize) -> Self {
        if cap == 0 {
            return Self::Full;
        }
        Self::from_pressure(pending as f64 / cap as f64)
    }

    #[must_use]
    pub fn should_accept_writes(&self) -> bool {
        !matches!(self, Self::Full)
    }

    /// Whether partitions should flush without waiting for their thresholds.
    #[must_use]
    pub fn flush_eagerly(&self) -> bool {
        *self >= Self::Elevated
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Normal => "Normal operation",
            Self::Elevated => "Elevated - flushing early",
            Self::High => "High - buffer nearly full",
            Self::Full => "Full - ingestion refused",
        }
    }
}

impl std::fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
