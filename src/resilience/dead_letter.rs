// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dead-letter log for write-buffer batches that exhausted their retries.
//!
//! Batches land here so ingestion keeps flowing while the Warm tier is
//! down. Each batch stores its readings as JSON together with a SHA-256 of
//! that payload; replay verifies the hash, upserts into Warm and only then
//! removes the batch. Replaying twice is harmless because the Warm upsert
//! is idempotent.
//!
//! Two stores are provided: SQLite (durable, survives restarts) and an
//! in-memory queue for tests and embedded use.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use sqlx::{AnyPool, Row};
use tracing::{debug, error, info, warn};

use crate::reading::{from_millis, SensorReading, TimeRange};
use crate::storage::sql::{map_sqlx_error, open_pool, text_column};
use crate::storage::traits::{SeriesTier, StorageError};

/// One failed flush.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterBatch {
    pub id: String,
    pub node_id: String,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    pub rows: usize,
    payload: String,
    payload_hash: String,
}

fn hash_payload(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

impl DeadLetterBatch {
    pub fn new(
        node_id: &str,
        readings: &[SensorReading],
        reason: impl Into<String>,
        attempts: u32,
    ) -> Result<Self, StorageError> {
        let payload = serde_json::to_string(readings)?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            reason: reason.into(),
            attempts,
            failed_at: Utc::now(),
            rows: readings.len(),
            payload_hash: hash_payload(&payload),
            payload,
        })
    }

    /// Decode the readings, rejecting a payload whose hash no longer matches.
    pub fn readings(&self) -> Result<Vec<SensorReading>, StorageError> {
        let actual = hash_payload(&self.payload);
        if actual != self.payload_hash {
            return Err(StorageError::Corruption {
                id: self.id.clone(),
                expected: self.payload_hash.clone(),
                actual,
            });
        }
        Ok(serde_json::from_str(&self.payload)?)
    }

    pub fn payload_hash(&self) -> &str {
        &self.payload_hash
    }
}

/// Persistence for dead-lettered batches, oldest first.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn append(&self, batch: &DeadLetterBatch) -> Result<(), StorageError>;
    async fn oldest(&self, limit: usize) -> Result<Vec<DeadLetterBatch>, StorageError>;
    async fn remove(&self, id: &str) -> Result<(), StorageError>;
    async fn count(&self) -> Result<u64, StorageError>;
}

#[derive(Default)]
pub struct MemoryDeadLetters {
    batches: Mutex<VecDeque<DeadLetterBatch>>,
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetters {
    async fn append(&self, batch: &DeadLetterBatch) -> Result<(), StorageError> {
        self.batches.lock().push_back(batch.clone());
        Ok(())
    }

    async fn oldest(&self, limit: usize) -> Result<Vec<DeadLetterBatch>, StorageError> {
        Ok(self.batches.lock().iter().take(limit).cloned().collect())
    }

    async fn remove(&self, id: &str) -> Result<(), StorageError> {
        self.batches.lock().retain(|b| b.id != id);
        Ok(())
    }

    async fn count(&self) -> Result<u64, StorageError> {
        Ok(self.batches.lock().len() as u64)
    }
}

/// SQLite file store.
pub struct SqliteDeadLetters {
    pool: AnyPool,
    path: String,
}

impl SqliteDeadLetters {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_string_lossy().to_string();
        let url = format!("sqlite://{}?mode=rwc", path);
        let (pool, _) = open_pool(&url).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dead_letters (
                id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                failed_at INTEGER NOT NULL,
                row_count INTEGER NOT NULL,
                payload TEXT NOT NULL,
                payload_hash TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn file_size_bytes(&self) -> std::io::Result<u64> {
        std::fs::metadata(&self.path).map(|m| m.len())
    }

    /// Reclaim disk space after the log has been drained.
    pub async fn checkpoint(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Dead-letter checkpoint failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for SqliteDeadLetters {
    async fn append(&self, batch: &DeadLetterBatch) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO dead_letters (id, node_id, reason, attempts, failed_at, row_count, payload, payload_hash) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(batch.id.as_str())
        .bind(batch.node_id.as_str())
        .bind(batch.reason.as_str())
        .bind(i64::from(batch.attempts))
        .bind(batch.failed_at.timestamp_millis())
        .bind(batch.rows as i64)
        .bind(batch.payload.as_str())
        .bind(batch.payload_hash.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn oldest(&self, limit: usize) -> Result<Vec<DeadLetterBatch>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, node_id, reason, attempts, failed_at, row_count, payload, payload_hash \
             FROM dead_letters ORDER BY failed_at ASC, id ASC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| -> Result<DeadLetterBatch, StorageError> {
                let text = |col: &str| {
                    text_column(row, col).ok_or_else(|| StorageError::Backend(format!("dead letter row missing {}", col)))
                };
                let int = |col: &str| row.try_get::<i64, _>(col).map_err(|e| StorageError::Backend(e.to_string()));
                Ok(DeadLetterBatch {
                    id: text("id")?,
                    node_id: text("node_id")?,
                    reason: text("reason")?,
                    attempts: int("attempts")? as u32,
                    failed_at: from_millis(int("failed_at")?),
                    rows: int("row_count")? as usize,
                    payload: text("payload")?,
                    payload_hash: text("payload_hash")?,
                })
            })
            .collect()
    }

    async fn remove(&self, id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM dead_letters WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn count(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM dead_letters")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let count: i64 = row.try_get("cnt").map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(count as u64)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeadLetterStats {
    pub pending_batches: u64,
    pub total_written: u64,
    pub total_replayed: u64,
    pub replaying: bool,
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    pub batches: usize,
    pub readings: usize,
    /// Batches skipped because their payload hash did not match
    pub corrupt: usize,
    /// Node and time span touched by each replayed batch
    pub affected: Vec<(String, TimeRange)>,
}

/// Bounded dead-letter log with accounting.
pub struct DeadLetterLog {
    store: Arc<dyn DeadLetterStore>,
    pending: AtomicU64,
    total_written: AtomicU64,
    total_replayed: AtomicU64,
    replaying: AtomicBool,
    max_batches: u64,
}

impl DeadLetterLog {
    /// Open over an existing store, picking up batches left by a previous run.
    pub async fn with_store(store: Arc<dyn DeadLetterStore>, max_batches: u64) -> Result<Self, StorageError> {
        let pending = store.count().await?;
        if pending > 0 {
            warn!(pending, "Dead-letter log holds batches from a previous run");
        }
        crate::metrics::set_dead_letter_pending(pending);
        Ok(Self {
            store,
            pending: AtomicU64::new(pending),
            total_written: AtomicU64::new(0),
            total_replayed: AtomicU64::new(0),
            replaying: AtomicBool::new(false),
            max_batches,
        })
    }

    /// SQLite-backed log at `path`.
    pub async fn open(path: impl AsRef<Path>, max_batches: u64) -> Result<Self, StorageError> {
        let store = SqliteDeadLetters::open(path).await?;
        info!(path = %store.path(), max_batches, "Opened dead-letter log");
        Self::with_store(Arc::new(store), max_batches).await
    }

    pub fn in_memory(max_batches: u64) -> Self {
        Self {
            store: Arc::new(MemoryDeadLetters::default()),
            pending: AtomicU64::new(0),
            total_written: AtomicU64::new(0),
            total_replayed: AtomicU64::new(0),
            replaying: AtomicBool::new(false),
            max_batches,
        }
    }

    /// Store a failed batch. Returns the batch id.
    pub async fn record(
        &self,
        node_id: &str,
        readings: &[SensorReading],
        reason: &str,
        attempts: u32,
    ) -> Result<String, StorageError> {
        let pending = self.pending.load(Ordering::Acquire);
        if pending >= self.max_batches {
            return Err(StorageError::Backend(format!(
                "dead-letter log full: {} batches (max {})",
                pending, self.max_batches
            )));
        }

        let batch = DeadLetterBatch::new(node_id, readings, reason, attempts)?;
        self.store.append(&batch).await?;

        let pending = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        self.total_written.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_dead_letter(readings.len());
        crate::metrics::set_dead_letter_pending(pending);

        warn!(
            batch_id = %batch.id,
            node_id = %node_id,
            rows = readings.len(),
            attempts,
            reason = %reason,
            "Batch dead-lettered"
        );
        Ok(batch.id)
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<DeadLetterBatch>, StorageError> {
        self.store.oldest(limit).await
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }

    #[must_use]
    pub fn stats(&self) -> DeadLetterStats {
        DeadLetterStats {
            pending_batches: self.pending.load(Ordering::Acquire),
            total_written: self.total_written.load(Ordering::Relaxed),
            total_replayed: self.total_replayed.load(Ordering::Relaxed),
            replaying: self.replaying.load(Ordering::Acquire),
        }
    }

    /// Replay up to `limit` batches into `warm`, oldest first.
    ///
    /// Stops at the first upsert failure and returns it; batches already
    /// replayed in this pass stay removed. Corrupt batches are left in place.
    pub async fn replay(&self, warm: &dyn SeriesTier, limit: usize) -> Result<ReplayReport, StorageError> {
        if self.replaying.swap(true, Ordering::AcqRel) {
            return Ok(ReplayReport::default());
        }
        let _guard = ReplayGuard(&self.replaying);

        let mut report = ReplayReport::default();
        for batch in self.store.oldest(limit).await? {
            let readings = match batch.readings() {
                Ok(r) => r,
                Err(e) => {
                    error!(batch_id = %batch.id, error = %e, "Dead-letter batch failed verification");
                    report.corrupt += 1;
                    continue;
                }
            };

            warm.upsert(&readings).await?;

            if let Err(e) = self.store.remove(&batch.id).await {
                // already applied; a second replay is an idempotent upsert
                error!(batch_id = %batch.id, error = %e, "Failed to remove replayed batch");
            } else {
                let remaining = self.pending.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
                crate::metrics::set_dead_letter_pending(remaining);
            }

            let start = readings.iter().map(|r| r.timestamp).min();
            let end = readings.iter().map(|r| r.timestamp).max();
            if let (Some(start), Some(end)) = (start, end) {
                let span = TimeRange::new(start, end + chrono::Duration::milliseconds(1));
                report.affected.push((batch.node_id.clone(), span));
            }
            report.batches += 1;
            report.readings += readings.len();
            self.total_replayed.fetch_add(1, Ordering::Relaxed);
            debug!(batch_id = %batch.id, rows = readings.len(), "Dead-letter batch replayed");
        }

        if report.batches > 0 {
            info!(batches = report.batches, readings = report.readings, "Dead-letter replay complete");
        }
        Ok(report)
    }
}

/// Clears the replaying flag on every exit path.
struct ReplayGuard<'a>(&'a AtomicBool);

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
