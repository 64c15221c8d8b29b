// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tier fallback, degraded reads and write durability under injected faults.
//!
//! # Running
//! ```bash
//! cargo test --test tiering
//! ```

mod common;

use std::time::Duration;

use chrono::Utc;

use common::{chaos_rig, init_tracing, series, test_config};
use hydro_sync::scheduler::jobs::RETENTION_CLEANUP;
use hydro_sync::{CacheKey, EngineError, Freshness, JobStatus, SeriesTier, Tier, TimeRange, WindowSize};

fn last_minutes(minutes: i64) -> TimeRange {
    TimeRange::trailing(chrono::Duration::minutes(minutes), Utc::now())
}

// =============================================================================
// Read fallback
// =============================================================================

#[tokio::test]
async fn test_warm_outage_falls_back_to_cold_and_backfills() {
    init_tracing();
    let rig = chaos_rig(test_config());
    rig.cold.inner.upsert(&series("pump-1", 6, 120)).await.unwrap();

    rig.warm.set_down(true);
    let response = rig
        .engine
        .get_readings("pump-1", last_minutes(10), Freshness::Bypass)
        .await
        .unwrap();
    assert_eq!(response.tier, Tier::Cold);
    assert!(response.degraded);
    assert_eq!(response.data.len(), 6);
    rig.engine.router().settle().await;
    assert!(rig.warm.inner.is_empty());

    // Once Warm answers again, a Cold read copies the rows back into it.
    rig.warm.set_down(false);
    let response = rig
        .engine
        .get_readings("pump-1", last_minutes(10), Freshness::Bypass)
        .await
        .unwrap();
    assert_eq!(response.tier, Tier::Cold);
    assert!(!response.degraded);
    rig.engine.router().settle().await;
    assert_eq!(rig.warm.inner.len(), 6);

    let response = rig
        .engine
        .get_readings("pump-1", last_minutes(10), Freshness::Bypass)
        .await
        .unwrap();
    assert_eq!(response.tier, Tier::Warm);
}

#[tokio::test(start_paused = true)]
async fn test_slow_warm_is_bounded_by_its_budget() {
    let mut config = test_config();
    config.timeouts.warm_ms = 100;
    let rig = chaos_rig(config);
    rig.cold.inner.upsert(&series("pump-1", 3, 60)).await.unwrap();
    rig.warm.set_delay(Duration::from_secs(30));

    let started = tokio::time::Instant::now();
    let response = rig
        .engine
        .get_readings("pump-1", last_minutes(10), Freshness::Bypass)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(response.tier, Tier::Cold);
    assert!(response.degraded);
    assert_eq!(response.data.len(), 3);
}

#[tokio::test]
async fn test_latest_errors_distinguish_missing_from_unavailable() {
    let rig = chaos_rig(test_config());

    let err = rig.engine.get_latest("ghost", Freshness::Any).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));

    rig.warm.set_down(true);
    rig.cold.set_down(true);
    let err = rig.engine.get_latest("ghost", Freshness::Any).await.unwrap_err();
    assert!(matches!(err, EngineError::AllTiersUnavailable { .. }));
}

#[tokio::test]
async fn test_hot_outage_does_not_block_ingestion() {
    let rig = chaos_rig(test_config());
    rig.hot.set_down(true);

    let ack = rig.engine.ingest(series("pump-2", 1, 5).remove(0)).await.unwrap();
    assert!(!ack.cached_latest);
    assert_eq!(rig.engine.flush().await.committed, 1);

    let latest = rig.engine.get_latest("pump-2", Freshness::Any).await.unwrap();
    assert_eq!(latest.tier, Tier::Warm);
    assert!(latest.degraded);
    assert_eq!(latest.data.flow_rate, 20.0);
}

#[tokio::test]
async fn test_reads_past_a_down_hot_tier_are_degraded() {
    let rig = chaos_rig(test_config());
    rig.hot.set_down(true);

    for reading in series("pump-9", 3, 5) {
        rig.engine.ingest(reading).await.unwrap();
    }
    assert_eq!(rig.engine.flush().await.committed, 3);

    let latest = rig.engine.get_latest("pump-9", Freshness::Any).await.unwrap();
    assert_eq!(latest.tier, Tier::Warm);
    assert!(latest.degraded);

    let rows = rig
        .engine
        .get_readings("pump-9", last_minutes(10), Freshness::Any)
        .await
        .unwrap();
    assert_eq!(rows.tier, Tier::Warm);
    assert!(rows.degraded);
    assert_eq!(rows.data.len(), 3);

    // Healthy Hot again: a plain Warm answer is not degraded.
    rig.hot.set_down(false);
    let rows = rig
        .engine
        .get_readings("pump-9", last_minutes(10), Freshness::Bypass)
        .await
        .unwrap();
    assert_eq!(rows.tier, Tier::Warm);
    assert!(!rows.degraded);
}

#[tokio::test]
async fn test_hot_and_warm_outage_is_served_from_cold_degraded() {
    let rig = chaos_rig(test_config());
    rig.cold.inner.upsert(&series("pump-8", 4, 60)).await.unwrap();
    rig.hot.set_down(true);
    rig.warm.set_down(true);

    let rows = rig
        .engine
        .get_readings("pump-8", last_minutes(10), Freshness::Any)
        .await
        .unwrap();
    assert_eq!(rows.tier, Tier::Cold);
    assert!(rows.degraded);
    assert_eq!(rows.data.len(), 4);

    let latest = rig.engine.get_latest("pump-8", Freshness::Any).await.unwrap();
    assert_eq!(latest.tier, Tier::Cold);
    assert!(latest.degraded);
    assert_eq!(latest.data.flow_rate, 23.0);
}

#[tokio::test]
async fn test_latest_visible_before_flush() {
    let rig = chaos_rig(test_config());
    for reading in series("pump-3", 3, 1) {
        rig.engine.ingest(reading).await.unwrap();
    }
    assert!(rig.warm.inner.is_empty());

    let latest = rig.engine.get_latest("pump-3", Freshness::Any).await.unwrap();
    assert_eq!(latest.tier, Tier::Hot);
    assert_eq!(latest.data.flow_rate, 22.0);
}

// =============================================================================
// Write durability
// =============================================================================

#[tokio::test]
async fn test_failed_flush_is_dead_lettered_then_replayed() {
    init_tracing();
    let rig = chaos_rig(test_config());
    rig.warm.set_reject_writes(true);

    for reading in series("pump-4", 5, 30) {
        rig.engine.ingest(reading).await.unwrap();
    }
    let report = rig.engine.flush().await;
    assert_eq!(report.committed, 0);
    assert_eq!(report.dead_lettered, 5);
    assert_eq!(rig.engine.dead_letter_stats().pending_batches, 1);
    assert_eq!(rig.engine.buffer_stats().pending, 0);

    rig.warm.set_reject_writes(false);
    let replay = rig.engine.replay_dead_letters(10).await.unwrap();
    assert_eq!(replay.batches, 1);
    assert_eq!(replay.readings, 5);
    assert_eq!(rig.warm.inner.len(), 5);
    assert_eq!(rig.engine.dead_letter_stats().pending_batches, 0);
}

#[tokio::test]
async fn test_background_flusher_commits_after_start() {
    let mut config = test_config();
    config.buffer.flush_interval_ms = 50;
    let rig = chaos_rig(config);
    rig.engine.start().await.unwrap();

    for reading in series("pump-5", 3, 10) {
        rig.engine.ingest(reading).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(rig.warm.inner.len(), 3);

    let report = rig.engine.shutdown().await;
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_written_reading_is_readable_within_one_flush_interval() {
    let mut config = test_config();
    config.buffer.flush_interval_ms = 200;
    let rig = chaos_rig(config);
    rig.engine.start().await.unwrap();

    let router = rig.engine.router();
    for reading in series("pump-10", 3, 2) {
        router.write(reading).await.unwrap();
    }

    // No explicit flush: only the interval flusher moves the rows to Warm.
    let visible = tokio::time::timeout(Duration::from_millis(200 + 250), async {
        loop {
            let rows = router.read("pump-10", last_minutes(5), Freshness::Bypass).await.unwrap();
            if rows.data.len() == 3 {
                return rows;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("rows visible after one flush interval");
    assert_eq!(visible.tier, Tier::Warm);
    assert_eq!(rig.warm.inner.len(), 3);

    rig.engine.shutdown().await;
}

#[tokio::test]
async fn test_flush_invalidates_hot_keys_in_one_round_trip() {
    let rig = chaos_rig(test_config());
    let rows = series("pump-11", 3, 30);
    let cache = rig.engine.cache();
    for window in [WindowSize::FiveMinutes, WindowSize::Hour, WindowSize::Day] {
        let key = CacheKey::bucket("pump-11", window, window.align(rows[0].timestamp));
        cache.set(&key, &"cached", Duration::from_secs(60)).await.unwrap();
    }

    let before = rig.hot.calls();
    let timestamps: Vec<_> = rows.iter().map(|r| r.timestamp).collect();
    cache.invalidate_readings("pump-11", &timestamps).await;
    assert_eq!(rig.hot.calls() - before, 1);

    let key = CacheKey::bucket("pump-11", WindowSize::Hour, WindowSize::Hour.align(rows[0].timestamp));
    assert!(cache.get(&key).await.unwrap().is_none());
}

// =============================================================================
// Retention safety
// =============================================================================

#[tokio::test]
async fn test_retention_never_deletes_rows_missing_from_cold() {
    let mut config = test_config();
    config.retention.warm_days = 5;
    let rig = chaos_rig(config);
    let ten_days = 10 * 24 * 3600;
    rig.warm.inner.upsert(&series("pump-6", 4, ten_days)).await.unwrap();

    rig.cold.set_reject_writes(true);
    let job_id = rig.engine.trigger_job(RETENTION_CLEANUP).unwrap();
    let record = rig.engine.wait_for_job(&job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(rig.warm.inner.len(), 4);
    assert!(rig.cold.inner.is_empty());

    rig.cold.set_reject_writes(false);
    let retry_id = rig.engine.retry_job(RETENTION_CLEANUP).unwrap();
    let record = rig.engine.wait_for_job(&retry_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Success);
    assert_eq!(record.attempt, 2);
    assert_eq!(record.retry_of.as_deref(), Some(job_id.as_str()));
    assert_eq!(record.records_processed, 4);
    assert!(rig.warm.inner.is_empty());
    assert_eq!(rig.cold.inner.len(), 4);
}
