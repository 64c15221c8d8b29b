// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Job run persistence.
//!
//! Every run is saved when it starts and again when it finishes, keyed by
//! `job_id`. The scheduler's in-memory history is a bounded read cache over
//! this store.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::AnyPool;

use super::record::SyncJobRecord;
use crate::storage::sql::{map_sqlx_error, open_pool, text_column};
use crate::storage::traits::StorageError;

#[async_trait]
pub trait JobRecordStore: Send + Sync {
    /// Insert or replace the record with the same `job_id`.
    async fn save(&self, record: &SyncJobRecord) -> Result<(), StorageError>;

    async fn get(&self, job_id: &str) -> Result<Option<SyncJobRecord>, StorageError>;

    /// Runs of `job_name`, newest first.
    async fn recent(&self, job_name: &str, limit: usize) -> Result<Vec<SyncJobRecord>, StorageError>;
}

fn newest_first(mut records: Vec<SyncJobRecord>, limit: usize) -> Vec<SyncJobRecord> {
    records.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.job_id.cmp(&a.job_id)));
    records.truncate(limit);
    records
}

/// In-process store.
#[derive(Default)]
pub struct MemoryJobRecordStore {
    by_id: DashMap<String, SyncJobRecord>,
}

impl MemoryJobRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[async_trait]
impl JobRecordStore for MemoryJobRecordStore {
    async fn save(&self, record: &SyncJobRecord) -> Result<(), StorageError> {
        self.by_id.insert(record.job_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<SyncJobRecord>, StorageError> {
        Ok(self.by_id.get(job_id).map(|r| r.value().clone()))
    }

    async fn recent(&self, job_name: &str, limit: usize) -> Result<Vec<SyncJobRecord>, StorageError> {
        let found = self
            .by_id
            .iter()
            .filter(|e| e.value().job_name == job_name)
            .map(|e| e.value().clone())
            .collect();
        Ok(newest_first(found, limit))
    }
}

/// SQL-backed store (SQLite or MySQL through sqlx `Any`).
///
/// The record is kept as JSON next to the columns used for lookups.
pub struct SqlJobRecordStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlJobRecordStore {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        let (pool, is_sqlite) = open_pool(connection_string).await?;
        let store = Self { pool, is_sqlite };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "CREATE TABLE IF NOT EXISTS job_runs (
                job_id TEXT PRIMARY KEY,
                job_name TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL
            )"
        } else {
            "CREATE TABLE IF NOT EXISTS job_runs (
                job_id VARCHAR(64) PRIMARY KEY,
                job_name VARCHAR(128) NOT NULL,
                started_at BIGINT NOT NULL,
                status VARCHAR(16) NOT NULL,
                payload LONGTEXT NOT NULL,
                INDEX idx_job_started (job_name, started_at)
            )"
        };
        sqlx::query(sql).execute(&self.pool).await.map_err(map_sqlx_error)?;
        if self.is_sqlite {
            sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_started ON job_runs (job_name, started_at)")
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }
        Ok(())
    }

    fn decode(row: &sqlx::any::AnyRow) -> Result<SyncJobRecord, StorageError> {
        let payload =
            text_column(row, "payload").ok_or_else(|| StorageError::Backend("job run row without payload".into()))?;
        Ok(serde_json::from_str(&payload)?)
    }
}

#[async_trait]
impl JobRecordStore for SqlJobRecordStore {
    async fn save(&self, record: &SyncJobRecord) -> Result<(), StorageError> {
        let payload = serde_json::to_string(record)?;
        let sql = if self.is_sqlite {
            "INSERT INTO job_runs (job_id, job_name, started_at, status, payload) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(job_id) DO UPDATE SET status = excluded.status, payload = excluded.payload"
        } else {
            "INSERT INTO job_runs (job_id, job_name, started_at, status, payload) VALUES (?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE status = VALUES(status), payload = VALUES(payload)"
        };
        sqlx::query(sql)
            .bind(record.job_id.as_str())
            .bind(record.job_name.as_str())
            .bind(record.started_at.timestamp_millis())
            .bind(record.status.as_str())
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<SyncJobRecord>, StorageError> {
        let row = sqlx::query("SELECT payload FROM job_runs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn recent(&self, job_name: &str, limit: usize) -> Result<Vec<SyncJobRecord>, StorageError> {
        let rows = sqlx::query("SELECT payload FROM job_runs WHERE job_name = ? ORDER BY started_at DESC LIMIT ?")
            .bind(job_name)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let records = rows.iter().map(Self::decode).collect::<Result<Vec<_>, _>>()?;
        Ok(newest_first(records, limit))
    }
}
