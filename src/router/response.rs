// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use crate::backpressure::BackpressureLevel;
use crate::storage::traits::Tier;
use crate::write_buffer::FlushReason;

/// How stale a caller is willing to let a read be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    /// Serve from the cache whenever possible
    #[default]
    Any,
    /// Cache entries older than this are skipped
    MaxAge(Duration),
    /// Never consult the cache
    Bypass,
}

impl Freshness {
    pub fn uses_hot(&self) -> bool {
        !matches!(self, Self::Bypass)
    }

    pub fn accepts(&self, age: Duration) -> bool {
        match self {
            Self::Any => true,
            Self::MaxAge(max) => age <= *max,
            Self::Bypass => false,
        }
    }
}

/// A successful read, labelled with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResponse<T> {
    pub data: T,
    /// Tier that served `data`
    pub tier: Tier,
    /// Upper bound on how far behind the freshest ingested data `data` may be
    pub staleness: Duration,
    /// A tier that should have been consulted failed on the way
    pub degraded: bool,
}

impl<T> ReadResponse<T> {
    pub fn staleness_ms(&self) -> u64 {
        u64::try_from(self.staleness.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ReadResponse<U> {
        ReadResponse {
            data: f(self.data),
            tier: self.tier,
            staleness: self.staleness,
            degraded: self.degraded,
        }
    }
}

/// Acknowledgement of a write. The reading is buffered, not yet durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    pub level: BackpressureLevel,
    /// A flush of the node's partition was started
    pub flush_started: Option<FlushReason>,
    /// The reading became the node's cached latest value
    pub cached_latest: bool,
}

/// Tier failures collected along one read.
#[derive(Debug, Default)]
pub(crate) struct Failures(Vec<(Tier, String)>);

impl Failures {
    pub(crate) fn push(&mut self, tier: Tier, err: impl std::fmt::Display) {
        self.0.push((tier, err.to_string()));
    }

    pub(crate) fn any(&self) -> bool {
        !self.0.is_empty()
    }

    pub(crate) fn failed(&self, tier: Tier) -> bool {
        self.0.iter().any(|(t, _)| *t == tier)
    }

    pub(crate) fn render(&self) -> String {
        self.0
            .iter()
            .map(|(t, e)| format!("{}: {}", t, e))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness() {
        assert!(Freshness::Any.accepts(Duration::from_secs(3600)));
        assert!(Freshness::MaxAge(Duration::from_secs(5)).accepts(Duration::from_secs(5)));
        assert!(!Freshness::MaxAge(Duration::from_secs(5)).accepts(Duration::from_secs(6)));
        assert!(!Freshness::Bypass.uses_hot());
    }

    #[test]
    fn test_failures_render() {
        let mut f = Failures::default();
        assert!(!f.any());
        f.push(Tier::Warm, "timeout");
        f.push(Tier::Cold, "refused");
        assert!(f.failed(Tier::Warm));
        assert!(!f.failed(Tier::Hot));
        assert_eq!(f.render(), "warm: timeout; cold: refused");
    }

    #[test]
    fn test_response_map_keeps_labels() {
        let r = ReadResponse {
            data: vec![1, 2, 3],
            tier: Tier::Cold,
            staleness: Duration::from_millis(1500),
            degraded: true,
        };
        let r = r.map(|v| v.len());
        assert_eq!(r.data, 3);
        assert_eq!(r.tier, Tier::Cold);
        assert_eq!(r.staleness_ms(), 1500);
        assert!(r.degraded);
    }
}
