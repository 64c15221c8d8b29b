// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine over SQLite-backed Warm and Cold tiers.
//!
//! Covers what the in-memory stores cannot: data, anomalies, job history
//! and the sync high-water mark surviving an engine restart.
//!
//! # Running
//! ```bash
//! cargo test --test sql_tiers
//! ```

mod common;

use std::path::Path;

use chrono::Utc;
use tempfile::TempDir;

use common::{init_tracing, series};
use hydro_sync::scheduler::jobs::{ANOMALY_SWEEP, INCREMENTAL_SYNC};
use hydro_sync::{
    AnomalyFilter, AnomalyStatus, EngineConfig, EngineState, Freshness, JobStatus, MonitoringNode, SensorReading,
    SeriesTier, TelemetryEngine, Tier, TimeRange,
};
use hydro_sync::storage::sql::SqlSeriesStore;

fn sqlite_url(dir: &Path, name: &str) -> String {
    format!("sqlite:{}?mode=rwc", dir.join(name).display())
}

fn sql_config(dir: &TempDir) -> EngineConfig {
    let mut config = common::test_config();
    config.warm_url = Some(sqlite_url(dir.path(), "warm.db"));
    config.cold_url = Some(sqlite_url(dir.path(), "cold.db"));
    config.dead_letter_path = Some(dir.path().join("dead_letters.db").display().to_string());
    // File-backed SQLite is slower than the defaults assume for Warm.
    config.timeouts.warm_ms = 5_000;
    config.timeouts.cold_ms = 5_000;
    config
}

#[tokio::test]
async fn test_readings_survive_restart() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    {
        let engine = TelemetryEngine::connect(sql_config(&dir)).await.unwrap();
        engine.start().await.unwrap();
        let result = engine.ingest_batch(series("reservoir-1", 10, 30)).await;
        assert!(result.is_success());
        let report = engine.shutdown().await;
        assert_eq!(report.committed, 10);
        assert!(report.is_clean());
    }

    let engine = TelemetryEngine::connect(sql_config(&dir)).await.unwrap();
    let range = TimeRange::trailing(chrono::Duration::minutes(10), Utc::now());
    let response = engine.get_readings("reservoir-1", range, Freshness::Bypass).await.unwrap();
    assert_eq!(response.tier, Tier::Warm);
    assert_eq!(response.data.len(), 10);
    assert!(response.data.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    let latest = engine.get_latest("reservoir-1", Freshness::Any).await.unwrap();
    assert_eq!(latest.data.flow_rate, 29.0);
    assert_eq!(engine.dead_letter_stats().pending_batches, 0);
}

#[tokio::test]
async fn test_incremental_sync_resumes_from_cold() {
    let dir = TempDir::new().unwrap();

    {
        let engine = TelemetryEngine::connect(sql_config(&dir)).await.unwrap();
        let mut readings = series("reservoir-2", 5, 3 * 3_600);
        readings.extend(series("reservoir-2", 1, 3_600));
        engine.ingest_batch(readings).await;
        engine.flush().await;
        let id = engine.trigger_job(INCREMENTAL_SYNC).unwrap();
        let record = engine.wait_for_job(&id).await.unwrap();
        assert_eq!(record.status, JobStatus::Success);
        assert_eq!(record.records_processed, 6);
        engine.shutdown().await;
    }

    // A fresh engine recovers the mark from Cold, so only the overlap before
    // it and the new rows are copied again.
    let engine = TelemetryEngine::connect(sql_config(&dir)).await.unwrap();
    engine.ingest_batch(series("reservoir-2", 3, 5)).await;
    engine.flush().await;
    let id = engine.trigger_job(INCREMENTAL_SYNC).unwrap();
    let record = engine.wait_for_job(&id).await.unwrap();
    assert_eq!(record.status, JobStatus::Success);
    assert_eq!(record.records_processed, 4);
    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::Stopped);

    let cold = SqlSeriesStore::new(&sqlite_url(dir.path(), "cold.db"), Tier::Cold).await.unwrap();
    let range = TimeRange::trailing(chrono::Duration::hours(4), Utc::now());
    assert_eq!(cold.count_range("reservoir-2", range).await.unwrap(), 9);
}

#[tokio::test]
async fn test_anomalies_survive_restart() {
    let dir = TempDir::new().unwrap();
    let now = Utc::now();

    let anomaly_id = {
        let engine = TelemetryEngine::connect(sql_config(&dir)).await.unwrap();
        engine.register_node(MonitoringNode::new("booster-5"));
        let mut readings: Vec<SensorReading> = (0..24)
            .map(|h| {
                SensorReading::new("booster-5", now - chrono::Duration::hours(1 + h))
                    .with_flow(if h % 2 == 0 { 49.0 } else { 51.0 })
                    .with_pressure(4.0)
                    .with_temperature(10.0)
            })
            .collect();
        readings.push(
            SensorReading::new("booster-5", now - chrono::Duration::minutes(1))
                .with_flow(50.0)
                .with_pressure(0.5)
                .with_temperature(10.0),
        );
        assert!(engine.ingest_batch(readings).await.is_success());
        engine.flush().await;

        let id = engine.trigger_job(ANOMALY_SWEEP).unwrap();
        let record = engine.wait_for_job(&id).await.unwrap();
        assert_eq!(record.records_processed, 1);

        let found = engine.get_anomalies(&AnomalyFilter::for_node("booster-5")).await.unwrap();
        assert_eq!(found.len(), 1);
        engine.acknowledge_anomaly(&found[0].id, "pressure drop logged").await.unwrap();
        engine.shutdown().await;
        found[0].id.clone()
    };

    let engine = TelemetryEngine::connect(sql_config(&dir)).await.unwrap();
    let found = engine.get_anomalies(&AnomalyFilter::default()).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, anomaly_id);
    assert_eq!(found[0].status, AnomalyStatus::Acknowledged);
    assert_eq!(found[0].notes, vec!["pressure drop logged"]);
}

#[tokio::test]
async fn test_job_history_survives_restart() {
    let dir = TempDir::new().unwrap();

    let job_id = {
        let engine = TelemetryEngine::connect(sql_config(&dir)).await.unwrap();
        engine.ingest_batch(series("reservoir-3", 4, 60)).await;
        engine.flush().await;
        let id = engine.trigger_job(INCREMENTAL_SYNC).unwrap();
        let record = engine.wait_for_job(&id).await.unwrap();
        assert_eq!(record.status, JobStatus::Success);
        engine.shutdown().await;
        id
    };

    let engine = TelemetryEngine::connect(sql_config(&dir)).await.unwrap();
    let last = engine.job_status(INCREMENTAL_SYNC).unwrap().unwrap();
    assert_eq!(last.job_id, job_id);
    assert_eq!(last.status, JobStatus::Success);
    assert_eq!(last.records_processed, 4);
    assert_eq!(engine.job_history(INCREMENTAL_SYNC).unwrap().len(), 1);

    let runs = engine.job_runs(INCREMENTAL_SYNC, 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].job_id, job_id);
}
