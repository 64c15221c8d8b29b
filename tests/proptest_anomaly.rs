// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests for the detector and the aggregate rollup.
//!
//! Uses proptest to check that in-band readings are never flagged and that a
//! bucket depends only on the set of readings it covers. A fixed-seed check
//! bounds the false-positive rate on a stationary series.
//!
//! Run with: `cargo test --test proptest_anomaly`

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;

use hydro_sync::anomaly::{detect, Baseline};
use hydro_sync::config::AnomalyConfig;
use hydro_sync::{AggregateBucket, MetricKind, SensorReading, WindowSize};

const NODE: &str = "main-12";

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
}

fn flow_only_config() -> AnomalyConfig {
    AnomalyConfig {
        metrics: vec![MetricKind::FlowRate],
        ..AnomalyConfig::default()
    }
}

fn flows_at(start: DateTime<Utc>, flows: &[f64]) -> Vec<SensorReading> {
    flows
        .iter()
        .enumerate()
        .map(|(i, &flow)| SensorReading::new(NODE, start + chrono::Duration::minutes(i as i64)).with_flow(flow))
        .collect()
}

// =============================================================================
// Strategies
// =============================================================================

/// Baseline flows with enough points to be evaluated.
fn baseline_strategy() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(0.0f64..500.0, 3..60)
}

/// Readings of one hourly bucket keyed by second offset, so timestamps are
/// unique. Values are whole numbers so sums stay exact.
fn bucket_rows_strategy() -> impl Strategy<Value = BTreeMap<i64, (i32, i32, bool)>> {
    prop::collection::btree_map(0i64..3_600, (0i32..400, 0i32..10_000, prop::bool::weighted(0.1)), 1..80)
}

fn rows_from(map: &BTreeMap<i64, (i32, i32, bool)>, bucket_start: DateTime<Utc>) -> Vec<SensorReading> {
    map.iter()
        .map(|(&offset, &(flow, total, reset))| {
            let mut r = SensorReading::new(NODE, bucket_start + chrono::Duration::seconds(offset))
                .with_flow(f64::from(flow))
                .with_pressure(f64::from(flow % 7))
                .with_total_flow(f64::from(total));
            r.counter_reset = reset;
            r
        })
        .collect()
}

// =============================================================================
// Detection
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Anything strictly inside the k-sigma band is never reported.
    #[test]
    fn in_band_readings_are_never_flagged(
        baseline_flows in baseline_strategy(),
        fractions in prop::collection::vec(-0.99f64..0.99, 1..30),
    ) {
        let config = flow_only_config();
        let baseline = Baseline::from_values(baseline_flows.iter().copied(), config.min_baseline_points, config.min_stddev)
            .expect("enough points");
        let k = config.k_for(MetricKind::FlowRate);

        let window: Vec<f64> = fractions.iter().map(|f| baseline.mean + f * k * baseline.stddev).collect();
        let baseline_rows = flows_at(epoch(), &baseline_flows);
        let window_rows = flows_at(epoch() + chrono::Duration::days(1), &window);

        let found = detect(NODE, &baseline_rows, &window_rows, &config, Utc::now());
        prop_assert!(found.is_empty(), "flagged {} in-band readings", found.len());
    }

    /// A reading well outside the band is always reported, once.
    #[test]
    fn out_of_band_reading_is_flagged(
        baseline_flows in baseline_strategy(),
        beyond in 1.05f64..20.0,
        above in any::<bool>(),
    ) {
        let config = flow_only_config();
        let baseline = Baseline::from_values(baseline_flows.iter().copied(), config.min_baseline_points, config.min_stddev)
            .expect("enough points");
        let k = config.k_for(MetricKind::FlowRate);
        let sign = if above { 1.0 } else { -1.0 };
        let spike = baseline.mean + sign * beyond * k * baseline.stddev;

        let baseline_rows = flows_at(epoch(), &baseline_flows);
        let window_rows = flows_at(epoch() + chrono::Duration::days(1), &[spike]);

        let found = detect(NODE, &baseline_rows, &window_rows, &config, Utc::now());
        prop_assert_eq!(found.len(), 1);
        prop_assert_eq!(found[0].metric, MetricKind::FlowRate);
        prop_assert!(found[0].score > k);
    }

    /// Below the minimum point count a metric is not evaluated at all.
    #[test]
    fn sparse_baseline_is_skipped(
        baseline_flows in prop::collection::vec(0.0f64..500.0, 0..3),
        spike in 10_000.0f64..1e6,
    ) {
        let config = flow_only_config();
        let baseline_rows = flows_at(epoch(), &baseline_flows);
        let window_rows = flows_at(epoch() + chrono::Duration::days(1), &[spike]);

        prop_assert!(detect(NODE, &baseline_rows, &window_rows, &config, Utc::now()).is_empty());
    }
}

/// Normal samples from a fixed-seed splitmix64 generator (Box-Muller).
fn normal_samples(seed: u64, n: usize, mean: f64, sd: f64) -> Vec<f64> {
    let mut state = seed;
    let mut uniform = move || {
        state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^= z >> 31;
        ((z >> 11) as f64 + 0.5) / (1u64 << 53) as f64
    };
    (0..n)
        .map(|_| {
            let (u1, u2) = (uniform(), uniform());
            mean + sd * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
        })
        .collect()
}

#[test]
fn false_positive_rate_stays_near_three_sigma_expectation() {
    let config = flow_only_config();
    let baseline_rows = flows_at(epoch(), &normal_samples(0x5eed_1234, 1_000, 10.0, 1.0));

    // k = 3 flags ~0.27% of a stationary series; allow generous sampling slack.
    let mut flagged = 0;
    let mut trials = 0;
    for seed in [7u64, 99, 2024, 31337, 0xdead_beef] {
        let window = normal_samples(seed, 1_000, 10.0, 1.0);
        let window_rows = flows_at(epoch() + chrono::Duration::days(1), &window);
        flagged += detect(NODE, &baseline_rows, &window_rows, &config, Utc::now()).len();
        trials += window.len();
    }
    let rate = flagged as f64 / trials as f64;
    assert!(rate < 0.01, "false-positive rate {rate:.4} over {trials} readings");
}

// =============================================================================
// Aggregation
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Input order does not change the bucket.
    #[test]
    fn bucket_ignores_input_order(
        (rows, shuffled) in bucket_rows_strategy().prop_flat_map(|map| {
            let rows = rows_from(&map, epoch());
            (Just(rows.clone()), Just(rows).prop_shuffle())
        }),
    ) {
        let a = AggregateBucket::from_readings(NODE, WindowSize::Hour, epoch(), &rows);
        let b = AggregateBucket::from_readings(NODE, WindowSize::Hour, epoch(), &shuffled);
        prop_assert_eq!(a, b);
    }

    /// Re-delivering the same readings does not change the bucket.
    #[test]
    fn bucket_ignores_redelivery(map in bucket_rows_strategy()) {
        let rows = rows_from(&map, epoch());
        let mut twice = rows.clone();
        twice.extend(rows.iter().cloned());

        let once = AggregateBucket::from_readings(NODE, WindowSize::Hour, epoch(), &rows);
        let again = AggregateBucket::from_readings(NODE, WindowSize::Hour, epoch(), &twice);
        prop_assert_eq!(once.count(), map.len() as u64);
        prop_assert_eq!(once, again);
    }

    /// Readings of the neighbouring buckets never leak in.
    #[test]
    fn bucket_only_covers_its_span(map in bucket_rows_strategy()) {
        let inside = rows_from(&map, epoch());
        let before = rows_from(&map, epoch() - chrono::Duration::hours(1));
        let after = rows_from(&map, epoch() + chrono::Duration::hours(1));
        let mut all = before;
        all.extend(inside.iter().cloned());
        all.extend(after);

        let expected = AggregateBucket::from_readings(NODE, WindowSize::Hour, epoch(), &inside);
        let actual = AggregateBucket::from_readings(NODE, WindowSize::Hour, epoch(), &all);
        prop_assert_eq!(expected, actual);
    }

    /// Min/avg/max stay ordered and consumption is never negative.
    #[test]
    fn bucket_stats_are_consistent(map in bucket_rows_strategy()) {
        let bucket = AggregateBucket::from_readings(NODE, WindowSize::Hour, epoch(), &rows_from(&map, epoch()));
        for kind in MetricKind::ALL {
            let s = bucket.stats(kind);
            prop_assert!(s.min <= s.avg && s.avg <= s.max, "{:?}: {:?}", kind, s);
        }
        prop_assert!(bucket.consumption >= 0.0);
    }
}
