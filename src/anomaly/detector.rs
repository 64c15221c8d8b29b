// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! z-score sweep over recent Warm-tier readings.
//!
//! For a swept window `[start, end)` the baseline is the preceding
//! `baseline_days` of readings. Each metric gets a population mean and
//! standard deviation (floored at `min_stddev`); a point is flagged when
//! `|value - mean| > k * stddev`. Metrics whose baseline has fewer than
//! `min_baseline_points` readings are not evaluated.
//!
//! At most one anomaly is produced per reading, carrying the metric with the
//! largest deviation. Both baseline and window are quality-screened first.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sink::NotificationSink;
use super::store::AnomalyStore;
use super::{Anomaly, AnomalyFilter, AnomalyStatus, Classification, Severity};
use crate::config::{AnomalyConfig, QualityRules};
use crate::error::EngineError;
use crate::quality;
use crate::reading::{MetricKind, SensorReading, TimeRange};
use crate::resilience::circuit_breaker::TierCircuits;
use crate::resilience::guarded;
use crate::storage::traits::{SeriesTier, Tier};

/// Mean and spread of one metric over the baseline window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    pub mean: f64,
    pub stddev: f64,
    pub points: usize,
}

impl Baseline {
    /// `None` when fewer than `min_points` finite values are available.
    pub fn from_values(values: impl IntoIterator<Item = f64>, min_points: usize, min_stddev: f64) -> Option<Self> {
        let values: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        if values.is_empty() || values.len() < min_points {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            mean,
            stddev: variance.sqrt().max(min_stddev),
            points: values.len(),
        })
    }

    pub fn z(&self, value: f64) -> f64 {
        (value - self.mean) / self.stddev
    }
}

#[derive(Debug, Clone, Copy)]
struct Scored {
    metric: MetricKind,
    value: f64,
    z: f64,
    k: f64,
    baseline: Baseline,
}

impl Scored {
    fn flagged(&self) -> bool {
        self.z.abs() > self.k
    }
}

fn classify(
    scores: &[Scored],
    reading: &SensorReading,
    previous: Option<&SensorReading>,
) -> Classification {
    let find = |m: MetricKind| scores.iter().find(|s| s.metric == m);
    let (Some(flow), Some(pressure)) = (find(MetricKind::FlowRate), find(MetricKind::Pressure)) else {
        return Classification::Unclassified;
    };

    if flow.z > flow.k && pressure.z < -pressure.k {
        return Classification::Burst;
    }
    // A lone pressure drop stays unclassified.
    if pressure.z > pressure.k && !flow.flagged() {
        return Classification::ValvePumpEvent;
    }
    if flow.z < -flow.k && !pressure.flagged() {
        // A gradual decline: the previous reading was already low and the
        // step down to this one is within the normal spread.
        let gradual = previous.is_some_and(|p| {
            let step = p.flow_rate - reading.flow_rate;
            p.flow_rate < flow.baseline.mean && step >= 0.0 && step <= flow.k * flow.baseline.stddev
        });
        if gradual {
            return Classification::SensorFault;
        }
    }
    Classification::Unclassified
}

/// Flag the readings of `window_rows` that deviate from `baseline_rows`.
///
/// Pure: no I/O, ids are fresh UUIDs, status is `Active`. Rows are expected
/// to be quality-screened already.
pub fn detect(
    node_id: &str,
    baseline_rows: &[SensorReading],
    window_rows: &[SensorReading],
    config: &AnomalyConfig,
    detected_at: DateTime<Utc>,
) -> Vec<Anomaly> {
    let baselines: Vec<(MetricKind, Baseline)> = config
        .metrics
        .iter()
        .filter_map(|&m| {
            Baseline::from_values(
                baseline_rows.iter().map(|r| r.metric(m)),
                config.min_baseline_points,
                config.min_stddev,
            )
            .map(|b| (m, b))
        })
        .collect();
    if baselines.is_empty() {
        return Vec::new();
    }

    let mut window: Vec<&SensorReading> = window_rows.iter().filter(|r| r.node_id == node_id).collect();
    window.sort_by_key(|r| r.timestamp);

    let mut found = Vec::new();
    let mut previous = baseline_rows.iter().filter(|r| r.node_id == node_id).max_by_key(|r| r.timestamp);

    for reading in window {
        let scores: Vec<Scored> = baselines
            .iter()
            .map(|&(metric, baseline)| {
                let value = reading.metric(metric);
                Scored {
                    metric,
                    value,
                    z: baseline.z(value),
                    k: config.k_for(metric),
                    baseline,
                }
            })
            .filter(|s| s.z.is_finite())
            .collect();

        let worst = scores
            .iter()
            .filter(|s| s.flagged())
            .max_by(|a, b| a.z.abs().total_cmp(&b.z.abs()));

        if let Some(worst) = worst {
            let score = worst.z.abs();
            found.push(Anomaly {
                id: uuid::Uuid::new_v4().to_string(),
                node_id: node_id.to_string(),
                metric: worst.metric,
                severity: Severity::from_ratio(score, worst.k),
                classification: classify(&scores, reading, previous),
                status: AnomalyStatus::Active,
                score,
                value: worst.value,
                baseline_mean: worst.baseline.mean,
                baseline_stddev: worst.baseline.stddev,
                observed_at: reading.timestamp,
                detected_at,
                acknowledged_at: None,
                resolved_at: None,
                notes: Vec::new(),
            });
        }
        previous = Some(reading);
    }
    found
}

/// Totals of a multi-node sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub nodes: usize,
    /// Anomalies found, including ones recorded by earlier sweeps
    pub flagged: usize,
    /// Anomalies recorded for the first time
    pub created: usize,
    pub failed: Vec<(String, String)>,
}

pub struct AnomalyDetector {
    warm: Arc<dyn SeriesTier>,
    circuits: Arc<TierCircuits>,
    warm_timeout: Duration,
    config: AnomalyConfig,
    rules: QualityRules,
    store: Arc<dyn AnomalyStore>,
    sink: Arc<dyn NotificationSink>,
}

impl AnomalyDetector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        warm: Arc<dyn SeriesTier>,
        circuits: Arc<TierCircuits>,
        warm_timeout: Duration,
        config: AnomalyConfig,
        rules: QualityRules,
        store: Arc<dyn AnomalyStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            warm,
            circuits,
            warm_timeout,
            config,
            rules,
            store,
            sink,
        }
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    async fn warm_rows(&self, node_id: &str, range: TimeRange) -> Result<Vec<SensorReading>, EngineError> {
        let warm = Arc::clone(&self.warm);
        guarded(&self.circuits.warm, Tier::Warm, "range_query", self.warm_timeout, || async move {
            warm.range_query(node_id, range).await
        })
        .await
        .map_err(|e| EngineError::from_tier(Tier::Warm, e))
    }

    /// Sweep one node's `window` and return every anomaly found in it.
    ///
    /// Anomalies already recorded by an earlier sweep come back in their
    /// stored state and are not announced again.
    pub async fn sweep(&self, node_id: &str, window: TimeRange) -> Result<Vec<Anomaly>, EngineError> {
        self.sweep_counted(node_id, window).await.map(|(found, _)| found)
    }

    #[tracing::instrument(skip(self), fields(baseline_rows, window_rows, created))]
    async fn sweep_counted(&self, node_id: &str, window: TimeRange) -> Result<(Vec<Anomaly>, usize), EngineError> {
        if window.is_empty() {
            return Ok((Vec::new(), 0));
        }
        let baseline_range = TimeRange::new(window.start - self.config.baseline_window(), window.start);
        let baseline_raw = self.warm_rows(node_id, baseline_range).await?;
        let window_raw = self.warm_rows(node_id, window).await?;

        let span = tracing::Span::current();
        span.record("baseline_rows", baseline_raw.len());
        span.record("window_rows", window_raw.len());

        let baseline = quality::screen(&self.rules, &baseline_raw, None);
        let last_total = baseline.accepted.last().map(|r| r.total_flow);
        let current = quality::screen(&self.rules, &window_raw, last_total);
        if !current.violations.is_empty() {
            debug!(
                node_id = %node_id,
                excluded = current.violations.len(),
                "Readings excluded from anomaly sweep"
            );
        }

        let candidates = detect(node_id, &baseline.accepted, &current.accepted, &self.config, Utc::now());
        let mut found = Vec::with_capacity(candidates.len());
        let mut created = 0;
        for candidate in candidates {
            let (stored, is_new) = self.store.insert_if_absent(candidate).await?;
            if is_new {
                created += 1;
                crate::metrics::record_anomalies_detected(stored.metric.as_str(), stored.severity.as_str(), 1);
                info!(
                    node_id = %stored.node_id,
                    anomaly_id = %stored.id,
                    metric = %stored.metric,
                    severity = stored.severity.as_str(),
                    classification = stored.classification.as_str(),
                    score = stored.score,
                    "Anomaly detected"
                );
                if let Err(e) = self.sink.notify(&stored).await {
                    warn!(anomaly_id = %stored.id, error = %e, "Anomaly notification failed");
                }
            }
            found.push(stored);
        }
        span.record("created", created);
        Ok((found, created))
    }

    /// Sweep several nodes over the same window. A failing node is recorded
    /// in the report and does not stop the others.
    pub async fn sweep_nodes(&self, node_ids: &[String], window: TimeRange, cancel: &CancellationToken) -> SweepReport {
        let mut report = SweepReport::default();
        for node_id in node_ids {
            if cancel.is_cancelled() {
                debug!(remaining = node_ids.len() - report.nodes, "Sweep cancelled");
                break;
            }
            report.nodes += 1;
            match self.sweep_counted(node_id, window).await {
                Ok((found, created)) => {
                    report.flagged += found.len();
                    report.created += created;
                }
                Err(e) => {
                    warn!(node_id = %node_id, error = %e, "Anomaly sweep failed for node");
                    report.failed.push((node_id.clone(), e.to_string()));
                }
            }
        }
        report
    }

    pub async fn list(&self, filter: &AnomalyFilter) -> Result<Vec<Anomaly>, EngineError> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn acknowledge(&self, id: &str, note: &str) -> Result<Anomaly, EngineError> {
        let a = self.store.transition(id, AnomalyStatus::Acknowledged, Some(note), Utc::now()).await?;
        info!(anomaly_id = %id, "Anomaly acknowledged");
        Ok(a)
    }

    pub async fn resolve(&self, id: &str, note: &str) -> Result<Anomaly, EngineError> {
        let a = self.store.transition(id, AnomalyStatus::Resolved, Some(note), Utc::now()).await?;
        info!(anomaly_id = %id, "Anomaly resolved");
        Ok(a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::sink::ChannelSink;
    use crate::anomaly::store::MemoryAnomalyStore;
    use crate::storage::memory::MemorySeriesStore;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 10, 0, 0, 0).unwrap()
    }

    fn at(mins: i64) -> DateTime<Utc> {
        t0() + ChronoDuration::minutes(mins)
    }

    fn reading(mins: i64, flow: f64, pressure: f64) -> SensorReading {
        SensorReading::new("n1", at(mins))
            .with_flow(flow)
            .with_pressure(pressure)
            .with_temperature(12.0)
            .with_quality(1.0)
    }

    /// Flow alternates 9/11 (mean 10, population stddev 1); pressure 3 ± 0.1.
    fn baseline_rows() -> Vec<SensorReading> {
        (0..60)
            .map(|i| {
                let flow = if i % 2 == 0 { 9.0 } else { 11.0 };
                let pressure = if i % 2 == 0 { 2.9 } else { 3.1 };
                reading(-120 + i, flow, pressure)
            })
            .collect()
    }

    fn config() -> AnomalyConfig {
        AnomalyConfig::default()
    }

    #[test]
    fn test_baseline_stats() {
        let b = Baseline::from_values([9.0, 11.0, 9.0, 11.0], 2, 1e-6).unwrap();
        assert!((b.mean - 10.0).abs() < 1e-12);
        assert!((b.stddev - 1.0).abs() < 1e-12);
        assert_eq!(b.points, 4);

        assert!(Baseline::from_values([1.0, 2.0], 3, 1e-6).is_none());
        let flat = Baseline::from_values([5.0; 10], 3, 0.01).unwrap();
        assert_eq!(flat.stddev, 0.01);
    }

    #[test]
    fn test_flags_exactly_the_spike() {
        let window: Vec<_> = [10.0, 10.0, 10.0, 50.0, 10.0]
            .iter()
            .enumerate()
            .map(|(i, &flow)| reading(i as i64, flow, 3.0))
            .collect();

        let found = detect("n1", &baseline_rows(), &window, &config(), t0());
        assert_eq!(found.len(), 1);
        let a = &found[0];
        assert_eq!(a.observed_at, at(3));
        assert_eq!(a.metric, MetricKind::FlowRate);
        assert!((a.score - 40.0).abs() < 1e-9);
        assert_eq!(a.severity, Severity::Critical);
        assert_eq!(a.status, AnomalyStatus::Active);
    }

    #[test]
    fn test_threshold_is_strict() {
        // z = 3 exactly with k = 3 is not flagged
        let window = vec![reading(0, 13.0, 3.0), reading(1, 13.5, 3.0)];
        let found = detect("n1", &baseline_rows(), &window, &config(), t0());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].observed_at, at(1));
    }

    #[test]
    fn test_per_metric_k() {
        let mut cfg = config();
        cfg.k_per_metric.insert(MetricKind::FlowRate, 5.0);
        let window = vec![reading(0, 14.0, 3.0)];
        assert!(detect("n1", &baseline_rows(), &window, &cfg, t0()).is_empty());
    }

    #[test]
    fn test_thin_baseline_is_skipped() {
        let baseline: Vec<_> = baseline_rows().into_iter().take(2).collect();
        let window = vec![reading(0, 500.0, 3.0)];
        assert!(detect("n1", &baseline, &window, &config(), t0()).is_empty());
    }

    #[test]
    fn test_classifies_burst() {
        // flow far up, pressure far down
        let window = vec![reading(0, 20.0, 2.0)];
        let found = detect("n1", &baseline_rows(), &window, &config(), t0());
        assert_eq!(found[0].classification, Classification::Burst);
    }

    #[test]
    fn test_classifies_valve_event() {
        let window = vec![reading(0, 10.0, 4.5)];
        let found = detect("n1", &baseline_rows(), &window, &config(), t0());
        assert_eq!(found[0].classification, Classification::ValvePumpEvent);
        assert_eq!(found[0].metric, MetricKind::Pressure);
    }

    #[test]
    fn test_lone_pressure_drop_is_unclassified() {
        let window = vec![reading(0, 10.0, 1.5)];
        let found = detect("n1", &baseline_rows(), &window, &config(), t0());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metric, MetricKind::Pressure);
        assert_eq!(found[0].classification, Classification::Unclassified);
    }

    #[test]
    fn test_classifies_gradual_drop_as_sensor_fault() {
        // Flow slides down in sub-sigma steps with stable pressure
        let window: Vec<_> = [9.5, 8.5, 7.5, 6.5, 5.5]
            .iter()
            .enumerate()
            .map(|(i, &flow)| reading(i as i64, flow, 3.0))
            .collect();
        let found = detect("n1", &baseline_rows(), &window, &config(), t0());
        assert!(!found.is_empty());
        assert!(found.iter().all(|a| a.classification == Classification::SensorFault));
    }

    #[test]
    fn test_sudden_drop_is_unclassified() {
        let window = vec![reading(0, 10.0, 3.0), reading(1, 1.0, 3.0)];
        let found = detect("n1", &baseline_rows(), &window, &config(), t0());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].classification, Classification::Unclassified);
    }

    async fn detector_with(
        warm: Arc<MemorySeriesStore>,
    ) -> (AnomalyDetector, Arc<MemoryAnomalyStore>, tokio::sync::mpsc::Receiver<Anomaly>) {
        let store = Arc::new(MemoryAnomalyStore::new());
        let (sink, rx) = ChannelSink::new(16);
        let detector = AnomalyDetector::new(
            warm,
            Arc::new(TierCircuits::new()),
            Duration::from_secs(1),
            config(),
            QualityRules::default(),
            store.clone(),
            Arc::new(sink),
        );
        (detector, store, rx)
    }

    #[tokio::test]
    async fn test_sweep_records_and_notifies_once() {
        let warm = Arc::new(MemorySeriesStore::warm());
        let mut rows = baseline_rows();
        rows.extend([reading(0, 10.0, 3.0), reading(1, 60.0, 3.0)]);
        warm.upsert(&rows).await.unwrap();

        let (detector, store, mut rx) = detector_with(warm).await;
        let window = TimeRange::new(at(0), at(20));

        let first = detector.sweep("n1", window).await.unwrap();
        assert_eq!(first.len(), 1);
        let notified = rx.try_recv().unwrap();
        assert_eq!(notified.id, first[0].id);

        let second = detector.sweep("n1", window).await.unwrap();
        assert_eq!(second[0].id, first[0].id);
        assert!(rx.try_recv().is_err(), "re-sweep must not notify again");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_excludes_bad_quality_points() {
        let warm = Arc::new(MemorySeriesStore::warm());
        let mut rows = baseline_rows();
        rows.push(reading(1, 60.0, 3.0).with_quality(0.1));
        warm.upsert(&rows).await.unwrap();

        let (detector, _store, _rx) = detector_with(warm).await;
        let found = detector.sweep("n1", TimeRange::new(at(0), at(20))).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_then_resolve() {
        let warm = Arc::new(MemorySeriesStore::warm());
        let mut rows = baseline_rows();
        rows.push(reading(1, 60.0, 3.0));
        warm.upsert(&rows).await.unwrap();

        let (detector, _store, _rx) = detector_with(warm).await;
        let found = detector.sweep("n1", TimeRange::new(at(0), at(20))).await.unwrap();
        let id = found[0].id.clone();

        detector.acknowledge(&id, "looking").await.unwrap();
        let resolved = detector.resolve(&id, "meter swapped").await.unwrap();
        assert_eq!(resolved.status, AnomalyStatus::Resolved);
        assert!(detector.acknowledge(&id, "late").await.is_err());

        let active = detector
            .list(&AnomalyFilter::for_node("n1").with_status(AnomalyStatus::Active))
            .await
            .unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_nodes_honours_cancel() {
        let warm = Arc::new(MemorySeriesStore::warm());
        let (detector, _store, _rx) = detector_with(warm).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = detector
            .sweep_nodes(&["a".into(), "b".into()], TimeRange::new(at(0), at(20)), &cancel)
            .await;
        assert_eq!(report.nodes, 0);
    }
}
