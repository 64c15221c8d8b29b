// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for the Warm and Cold tiers.
//!
//! One `sqlx` `AnyPool` per store, SQLite or MySQL chosen by URL. Each tier
//! owns its own pair of tables so Warm and Cold may share a database:
//!
//! ```sql
//! CREATE TABLE warm_readings (
//!   node_id VARCHAR(128) NOT NULL,
//!   ts BIGINT NOT NULL,            -- epoch millis
//!   flow_rate DOUBLE, pressure DOUBLE, temperature DOUBLE,
//!   total_flow DOUBLE, quality_score DOUBLE,
//!   counter_reset BIGINT,
//!   PRIMARY KEY (node_id, ts)
//! )
//! CREATE TABLE warm_buckets (
//!   node_id VARCHAR(128), window_secs BIGINT, bucket_start BIGINT,
//!   payload TEXT,                  -- AggregateBucket as JSON
//!   computed_at BIGINT,
//!   PRIMARY KEY (node_id, window_secs, bucket_start)
//! )
//! ```
//!
//! Upserts go through `ON CONFLICT` (SQLite) or `ON DUPLICATE KEY UPDATE`
//! (MySQL) on the primary key, so replaying a batch is a no-op. A batch is
//! applied inside one transaction.
//!
//! ## sqlx Any driver quirks
//!
//! MySQL TEXT columns come back as BLOB through the `Any` driver, so text is
//! read as `String` first and falls back to bytes.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::debug;

use super::traits::{BatchWriteResult, SeriesTier, StorageError, StoredBucket, Tier, TierClient};
use crate::aggregation::bucket::{AggregateBucket, WindowSize};
use crate::reading::{from_millis, SensorReading, TimeRange};
use crate::resilience::retry::{retry, retry_if, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Rows per multi-row INSERT (keeps MySQL under max_allowed_packet)
const CHUNK_SIZE: usize = 500;

pub(crate) fn map_sqlx_error(e: sqlx::Error) -> StorageError {
    match e {
        sqlx::Error::PoolTimedOut => StorageError::Timeout(e.to_string()),
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            StorageError::Unavailable(e.to_string())
        }
        sqlx::Error::RowNotFound => StorageError::NotFound,
        other => StorageError::Backend(other.to_string()),
    }
}

/// Open a pool with startup retry; SQLite gets WAL journaling.
///
/// Returns the pool and whether it is SQLite.
pub(crate) async fn open_pool(connection_string: &str) -> Result<(AnyPool, bool), StorageError> {
    install_drivers();

    let is_sqlite = connection_string.starts_with("sqlite:");

    let pool = retry("sql_connect", &RetryConfig::startup(), || async {
        AnyPoolOptions::new()
            .max_connections(if is_sqlite { 5 } else { 20 })
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .connect(connection_string)
            .await
            .map_err(map_sqlx_error)
    })
    .await?;

    if is_sqlite {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
    }

    Ok((pool, is_sqlite))
}

/// Read a text column that MySQL may hand back as bytes.
pub(crate) fn text_column(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column)
        .ok()
        .or_else(|| row.try_get::<Vec<u8>, _>(column).ok().and_then(|b| String::from_utf8(b).ok()))
}

pub struct SqlSeriesStore {
    pool: AnyPool,
    is_sqlite: bool,
    tier: Tier,
    readings_table: String,
    buckets_table: String,
}

impl SqlSeriesStore {
    /// Connect and create this tier's tables if missing.
    pub async fn new(connection_string: &str, tier: Tier) -> Result<Self, StorageError> {
        let (pool, is_sqlite) = open_pool(connection_string).await?;
        let store = Self {
            pool,
            is_sqlite,
            tier,
            readings_table: format!("{}_readings", tier.as_str()),
            buckets_table: format!("{}_buckets", tier.as_str()),
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: Vec<String> = if self.is_sqlite {
            vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        node_id TEXT NOT NULL,
                        ts INTEGER NOT NULL,
                        flow_rate REAL NOT NULL,
                        pressure REAL NOT NULL,
                        temperature REAL NOT NULL,
                        total_flow REAL NOT NULL,
                        quality_score REAL NOT NULL,
                        counter_reset INTEGER NOT NULL DEFAULT 0,
                        PRIMARY KEY (node_id, ts)
                    )",
                    self.readings_table
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        node_id TEXT NOT NULL,
                        window_secs INTEGER NOT NULL,
                        bucket_start INTEGER NOT NULL,
                        payload TEXT NOT NULL,
                        computed_at INTEGER NOT NULL,
                        PRIMARY KEY (node_id, window_secs, bucket_start)
                    )",
                    self.buckets_table
                ),
            ]
        } else {
            vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        node_id VARCHAR(128) NOT NULL,
                        ts BIGINT NOT NULL,
                        flow_rate DOUBLE NOT NULL,
                        pressure DOUBLE NOT NULL,
                        temperature DOUBLE NOT NULL,
                        total_flow DOUBLE NOT NULL,
                        quality_score DOUBLE NOT NULL,
                        counter_reset BIGINT NOT NULL DEFAULT 0,
                        PRIMARY KEY (node_id, ts),
                        INDEX idx_ts (ts)
                    )",
                    self.readings_table
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        node_id VARCHAR(128) NOT NULL,
                        window_secs BIGINT NOT NULL,
                        bucket_start BIGINT NOT NULL,
                        payload LONGTEXT NOT NULL,
                        computed_at BIGINT NOT NULL,
                        PRIMARY KEY (node_id, window_secs, bucket_start)
                    )",
                    self.buckets_table
                ),
            ]
        };

        for sql in &statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(map_sqlx_error)
            })
            .await?;
        }
        Ok(())
    }

    fn upsert_sql(&self, rows: usize) -> String {
        let placeholders = vec!["(?, ?, ?, ?, ?, ?, ?, ?)"; rows].join(", ");
        let columns = "node_id, ts, flow_rate, pressure, temperature, total_flow, quality_score, counter_reset";
        if self.is_sqlite {
            format!(
                "INSERT INTO {} ({}) VALUES {} \
                 ON CONFLICT(node_id, ts) DO UPDATE SET \
                    flow_rate = excluded.flow_rate, \
                    pressure = excluded.pressure, \
                    temperature = excluded.temperature, \
                    total_flow = excluded.total_flow, \
                    quality_score = excluded.quality_score, \
                    counter_reset = excluded.counter_reset",
                self.readings_table, columns, placeholders
            )
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES {} \
                 ON DUPLICATE KEY UPDATE \
                    flow_rate = VALUES(flow_rate), \
                    pressure = VALUES(pressure), \
                    temperature = VALUES(temperature), \
                    total_flow = VALUES(total_flow), \
                    quality_score = VALUES(quality_score), \
                    counter_reset = VALUES(counter_reset)",
                self.readings_table, columns, placeholders
            )
        }
    }

    fn select_columns() -> &'static str {
        "node_id, ts, flow_rate, pressure, temperature, total_flow, quality_score, counter_reset"
    }

    fn row_to_reading(row: &AnyRow) -> Result<SensorReading, StorageError> {
        let get_f64 = |col: &str| row.try_get::<f64, _>(col).map_err(|e| StorageError::Backend(e.to_string()));
        let node_id = text_column(row, "node_id")
            .ok_or_else(|| StorageError::Backend("reading row without node_id".into()))?;
        let ts: i64 = row.try_get("ts").map_err(|e| StorageError::Backend(e.to_string()))?;
        let counter_reset: i64 = row.try_get("counter_reset").unwrap_or(0);

        Ok(SensorReading {
            node_id,
            timestamp: from_millis(ts),
            flow_rate: get_f64("flow_rate")?,
            pressure: get_f64("pressure")?,
            temperature: get_f64("temperature")?,
            total_flow: get_f64("total_flow")?,
            quality_score: get_f64("quality_score")?,
            counter_reset: counter_reset != 0,
        })
    }
}

#[async_trait]
impl TierClient for SqlSeriesStore {
    fn tier(&self) -> Tier {
        self.tier
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[async_trait]
impl SeriesTier for SqlSeriesStore {
    async fn upsert(&self, rows: &[SensorReading]) -> Result<BatchWriteResult, StorageError> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        if rows.is_empty() {
            return Ok(BatchWriteResult { batch_id, written: 0 });
        }

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        for chunk in rows.chunks(CHUNK_SIZE) {
            let sql = self.upsert_sql(chunk.len());
            let mut query = sqlx::query(&sql);
            for r in chunk {
                query = query
                    .bind(r.node_id.as_str())
                    .bind(r.timestamp.timestamp_millis())
                    .bind(r.flow_rate)
                    .bind(r.pressure)
                    .bind(r.temperature)
                    .bind(r.total_flow)
                    .bind(r.quality_score)
                    .bind(i64::from(r.counter_reset));
            }
            query.execute(&mut *tx).await.map_err(map_sqlx_error)?;
        }
        tx.commit().await.map_err(map_sqlx_error)?;

        debug!(tier = %self.tier, batch_id = %batch_id, rows = rows.len(), "Batch upserted");
        Ok(BatchWriteResult {
            batch_id,
            written: rows.len(),
        })
    }

    async fn range_query(&self, node_id: &str, range: TimeRange) -> Result<Vec<SensorReading>, StorageError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM {} WHERE node_id = ? AND ts >= ? AND ts < ? ORDER BY ts ASC",
            Self::select_columns(),
            self.readings_table
        );
        let rows = retry_if("sql_range_query", &RetryConfig::query(), StorageError::is_transient, || async {
            sqlx::query(&sql)
                .bind(node_id)
                .bind(range.start_ms())
                .bind(range.end_ms())
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)
        })
        .await?;

        rows.iter().map(Self::row_to_reading).collect()
    }

    async fn latest(&self, node_id: &str) -> Result<Option<SensorReading>, StorageError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE node_id = ? ORDER BY ts DESC LIMIT 1",
            Self::select_columns(),
            self.readings_table
        );
        let row = retry_if("sql_latest", &RetryConfig::query(), StorageError::is_transient, || async {
            sqlx::query(&sql)
                .bind(node_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)
        })
        .await?;

        row.as_ref().map(Self::row_to_reading).transpose()
    }

    async fn delete_older_than(&self, node_id: &str, older_than: DateTime<Utc>) -> Result<u64, StorageError> {
        let sql = format!("DELETE FROM {} WHERE node_id = ? AND ts < ?", self.readings_table);
        let result = sqlx::query(&sql)
            .bind(node_id)
            .bind(older_than.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn count_range(&self, node_id: &str, range: TimeRange) -> Result<u64, StorageError> {
        if range.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "SELECT COUNT(*) as cnt FROM {} WHERE node_id = ? AND ts >= ? AND ts < ?",
            self.readings_table
        );
        let row = sqlx::query(&sql)
            .bind(node_id)
            .bind(range.start_ms())
            .bind(range.end_ms())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let count: i64 = row.try_get("cnt").map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(count as u64)
    }

    async fn node_ids(&self) -> Result<Vec<String>, StorageError> {
        let sql = format!("SELECT DISTINCT node_id FROM {} ORDER BY node_id", self.readings_table);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        Ok(rows.iter().filter_map(|r| text_column(r, "node_id")).collect())
    }

    async fn upsert_bucket(&self, bucket: &AggregateBucket, computed_at: DateTime<Utc>) -> Result<(), StorageError> {
        let payload = serde_json::to_string(bucket)?;
        let sql = if self.is_sqlite {
            format!(
                "INSERT INTO {} (node_id, window_secs, bucket_start, payload, computed_at) VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(node_id, window_secs, bucket_start) DO UPDATE SET \
                    payload = excluded.payload, computed_at = excluded.computed_at",
                self.buckets_table
            )
        } else {
            format!(
                "INSERT INTO {} (node_id, window_secs, bucket_start, payload, computed_at) VALUES (?, ?, ?, ?, ?) \
                 ON DUPLICATE KEY UPDATE payload = VALUES(payload), computed_at = VALUES(computed_at)",
                self.buckets_table
            )
        };
        sqlx::query(&sql)
            .bind(bucket.node_id.as_str())
            .bind(bucket.window.seconds())
            .bind(bucket.bucket_start.timestamp_millis())
            .bind(payload)
            .bind(computed_at.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn bucket_range(
        &self,
        node_id: &str,
        window: WindowSize,
        range: TimeRange,
    ) -> Result<Vec<StoredBucket>, StorageError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT payload, computed_at FROM {} \
             WHERE node_id = ? AND window_secs = ? AND bucket_start >= ? AND bucket_start < ? \
             ORDER BY bucket_start ASC",
            self.buckets_table
        );
        let rows = sqlx::query(&sql)
            .bind(node_id)
            .bind(window.seconds())
            .bind(range.start_ms())
            .bind(range.end_ms())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| -> Result<StoredBucket, StorageError> {
                let payload = text_column(row, "payload")
                    .ok_or_else(|| StorageError::Backend("bucket row without payload".into()))?;
                let computed_at: i64 = row.try_get("computed_at").map_err(|e| StorageError::Backend(e.to_string()))?;
                Ok(StoredBucket {
                    bucket: serde_json::from_str(&payload)?,
                    computed_at: from_millis(computed_at),
                })
            })
            .collect()
    }
}
