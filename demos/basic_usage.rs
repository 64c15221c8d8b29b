// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic hydro-sync usage example.
//!
//! Demonstrates:
//! 1. Connecting Warm/Cold to SQLite files (Hot to Redis if `REDIS_URL` is set)
//! 2. Ingesting an hour of readings for three nodes
//! 3. Reading latest values and hourly aggregates, with the serving tier
//! 4. Running the incremental sync and anomaly sweep by hand
//! 5. Displaying health and metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! # with a Redis Hot tier
//! REDIS_URL=redis://localhost:6379 cargo run --example basic_usage
//! ```

use chrono::{Duration, Utc};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};

use hydro_sync::scheduler::jobs::{ANOMALY_SWEEP, INCREMENTAL_SYNC};
use hydro_sync::{
    AnomalyFilter, EngineConfig, Freshness, SensorReading, TelemetryEngine, TimeRange, WindowSize,
};

const NODES: [&str; 3] = ["reservoir-north", "pump-station-4", "main-17"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt().with_target(false).compact().init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║             hydro-sync: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    let dir = tempfile::tempdir()?;
    let sqlite = |name: &str| format!("sqlite:{}?mode=rwc", dir.path().join(name).display());

    let mut config = EngineConfig {
        hot_url: std::env::var("REDIS_URL").ok(),
        warm_url: Some(sqlite("warm.db")),
        cold_url: Some(sqlite("cold.db")),
        dead_letter_path: Some(dir.path().join("dead_letters.db").display().to_string()),
        ..Default::default()
    };
    // Jobs are triggered by hand below.
    config.schedule.enabled = false;
    config.timeouts.warm_ms = 2_000;

    println!("📦 Connecting tiers under {}", dir.path().display());
    let engine = TelemetryEngine::connect(config).await?;
    engine.start().await?;
    println!("   ✅ Engine {}", engine.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Ingest an hour of one-minute readings per node
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Ingesting readings...");
    let now = Utc::now();
    for (n, node) in NODES.iter().enumerate() {
        let readings: Vec<SensorReading> = (0..60)
            .map(|m| {
                let wobble = if m % 2 == 0 { 0.5 } else { -0.5 };
                SensorReading::new(*node, now - Duration::minutes(60 - m))
                    .with_flow(40.0 + 10.0 * n as f64 + wobble)
                    .with_pressure(3.2 + 0.1 * n as f64)
                    .with_temperature(11.0)
                    .with_total_flow(10_000.0 + 40.0 * m as f64)
            })
            .collect();
        let result = engine.ingest_batch(readings).await;
        println!("   └─ {}: {}/{} accepted ({:?})", node, result.accepted, result.total, result.level);
    }

    // A pressure drop on one node for the sweep to find.
    engine
        .ingest(
            SensorReading::new("main-17", now)
                .with_flow(61.0)
                .with_pressure(0.9)
                .with_temperature(11.0)
                .with_total_flow(12_400.0),
        )
        .await?;

    let flushed = engine.flush().await;
    println!("   ✅ Flushed {} readings to Warm", flushed.committed);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Read back
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 Latest values:");
    for node in NODES {
        let start = std::time::Instant::now();
        let latest = engine.get_latest(node, Freshness::Any).await?;
        println!(
            "   └─ {} flow={:.1} pressure={:.2} from {} ({} ms stale, {:?})",
            node,
            latest.data.flow_rate,
            latest.data.pressure,
            latest.tier,
            latest.staleness_ms(),
            start.elapsed()
        );
    }

    println!("\n📊 Hourly aggregates (last 2h):");
    let range = TimeRange::trailing(Duration::hours(2), Utc::now());
    for node in NODES {
        let buckets = engine.get_range(node, range, WindowSize::Hour).await?;
        for b in &buckets.data {
            println!(
                "   └─ {} {} n={} flow avg={:.2} [{:.1}..{:.1}] consumption={:.0}",
                node,
                b.bucket_start.format("%H:%M"),
                b.count(),
                b.flow_rate.avg,
                b.flow_rate.min,
                b.flow_rate.max,
                b.consumption
            );
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Jobs
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔄 Running jobs...");
    for job in [INCREMENTAL_SYNC, ANOMALY_SWEEP] {
        let id = engine.trigger_job(job)?;
        if let Some(record) = engine.wait_for_job(&id).await {
            println!(
                "   └─ {}: {} ({} records{})",
                job,
                record.status,
                record.records_processed,
                record.error.map(|e| format!(", {}", e)).unwrap_or_default()
            );
        }
    }

    for anomaly in engine.get_anomalies(&AnomalyFilter::default()).await? {
        println!(
            "   ⚠️  {} {} = {:.2} (z={:.1}, {}, {})",
            anomaly.node_id,
            anomaly.metric,
            anomaly.value,
            anomaly.score,
            anomaly.severity.as_str(),
            anomaly.classification.as_str()
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Health and metrics
    // ─────────────────────────────────────────────────────────────────────────
    let health = engine.health_check().await;
    println!("\n🩺 Health: ready={} healthy={} degraded={}", health.ready, health.healthy, health.degraded);
    println!(
        "   └─ cache: {} entries, {} bytes, hit rate {:.0}%",
        health.cache.entries,
        health.cache.bytes,
        health.cache.hit_rate() * 100.0
    );
    for tier in [&health.hot, &health.warm, &health.cold] {
        println!(
            "   └─ {}: connected={} latency={:?}ms circuit={:?}",
            tier.tier, tier.connected, tier.latency_ms, tier.circuit
        );
    }

    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    let report = engine.shutdown().await;
    println!(
        "   ✅ {} in {:?} (committed={}, dead-lettered={}, remaining={})",
        engine.state(),
        report.elapsed,
        report.committed,
        report.dead_lettered,
        report.remaining
    );

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");
    Ok(())
}

/// Print every captured metric, sorted by name.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<(String, String)> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let name = if labels.is_empty() {
                key.name().to_string()
            } else {
                format!("{}{{{}}}", key.name(), labels.join(","))
            };
            let rendered = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => {
                    let count = samples.len();
                    let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                    let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                    format!("count={} avg={:.4}", count, avg)
                }
            };
            (name, rendered)
        })
        .collect();
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for (name, value) in lines {
        println!("   └─ {} = {}", name, value);
    }
}
