// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Anomaly persistence.
//!
//! Anomalies are never deleted. A store guarantees one record per
//! `(node_id, metric, observed_at)` so repeated sweeps over the same window
//! do not duplicate findings, and applies lifecycle transitions atomically.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use sqlx::AnyPool;

use super::{Anomaly, AnomalyFilter, AnomalyStatus};
use crate::error::EngineError;
use crate::reading::MetricKind;
use crate::storage::sql::{map_sqlx_error, open_pool, text_column};
use crate::storage::traits::StorageError;

#[async_trait]
pub trait AnomalyStore: Send + Sync {
    /// Store `anomaly` unless one with the same dedup key exists.
    ///
    /// Returns the stored record and whether it was newly created.
    async fn insert_if_absent(&self, anomaly: Anomaly) -> Result<(Anomaly, bool), StorageError>;

    async fn get(&self, id: &str) -> Result<Option<Anomaly>, StorageError>;

    async fn list(&self, filter: &AnomalyFilter) -> Result<Vec<Anomaly>, StorageError>;

    /// Move one anomaly forward in its lifecycle.
    async fn transition(
        &self,
        id: &str,
        to: AnomalyStatus,
        note: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Anomaly, EngineError>;
}

fn not_found(id: &str) -> EngineError {
    EngineError::NotFound {
        what: "anomaly",
        id: id.to_string(),
    }
}

/// In-process store.
#[derive(Default)]
pub struct MemoryAnomalyStore {
    by_id: DashMap<String, Anomaly>,
    /// dedup key -> id; the mutex serializes check-and-insert
    keys: Mutex<HashMap<(String, MetricKind, i64), String>>,
}

impl MemoryAnomalyStore {
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
impl AnomalyStore for MemoryAnomalyStore {
    async fn insert_if_absent(&self, anomaly: Anomaly) -> Result<(Anomaly, bool), StorageError> {
        let mut keys = self.keys.lock();
        if let Some(existing) = keys.get(&anomaly.dedup_key()).and_then(|id| self.by_id.get(id)) {
            return Ok((existing.value().clone(), false));
        }
        keys.insert(anomaly.dedup_key(), anomaly.id.clone());
        self.by_id.insert(anomaly.id.clone(), anomaly.clone());
        Ok((anomaly, true))
    }

    async fn get(&self, id: &str) -> Result<Option<Anomaly>, StorageError> {
        Ok(self.by_id.get(id).map(|a| a.value().clone()))
    }

    async fn list(&self, filter: &AnomalyFilter) -> Result<Vec<Anomaly>, StorageError> {
        let found = self
            .by_id
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        Ok(filter.finish(found))
    }

    async fn transition(
        &self,
        id: &str,
        to: AnomalyStatus,
        note: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Anomaly, EngineError> {
        let mut entry = self.by_id.get_mut(id).ok_or_else(|| not_found(id))?;
        entry.transition(to, note, at)?;
        Ok(entry.value().clone())
    }
}

/// SQL-backed store (SQLite or MySQL through sqlx `Any`).
///
/// The whole record is kept as JSON next to the columns used for lookups;
/// transitions are compare-and-set on `status`.
pub struct SqlAnomalyStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlAnomalyStore {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        let (pool, is_sqlite) = open_pool(connection_string).await?;
        let store = Self { pool, is_sqlite };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "CREATE TABLE IF NOT EXISTS anomalies (
                id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL,
                metric TEXT NOT NULL,
                observed_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                UNIQUE (node_id, metric, observed_at)
            )"
        } else {
            "CREATE TABLE IF NOT EXISTS anomalies (
                id VARCHAR(64) PRIMARY KEY,
                node_id VARCHAR(128) NOT NULL,
                metric VARCHAR(32) NOT NULL,
                observed_at BIGINT NOT NULL,
                status VARCHAR(16) NOT NULL,
                payload LONGTEXT NOT NULL,
                UNIQUE KEY uniq_point (node_id, metric, observed_at),
                INDEX idx_status (status)
            )"
        };
        sqlx::query(sql).execute(&self.pool).await.map_err(map_sqlx_error)?;
        Ok(())
    }

    fn decode(row: &sqlx::any::AnyRow) -> Result<Anomaly, StorageError> {
        let payload =
            text_column(row, "payload").ok_or_else(|| StorageError::Backend("anomaly row without payload".into()))?;
        Ok(serde_json::from_str(&payload)?)
    }

    async fn find_by_key(&self, anomaly: &Anomaly) -> Result<Option<Anomaly>, StorageError> {
        let row = sqlx::query("SELECT payload FROM anomalies WHERE node_id = ? AND metric = ? AND observed_at = ?")
            .bind(anomaly.node_id.as_str())
            .bind(anomaly.metric.as_str())
            .bind(anomaly.observed_at.timestamp_millis())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(Self::decode).transpose()
    }
}

#[async_trait]
impl AnomalyStore for SqlAnomalyStore {
    async fn insert_if_absent(&self, anomaly: Anomaly) -> Result<(Anomaly, bool), StorageError> {
        let payload = serde_json::to_string(&anomaly)?;
        let verb = if self.is_sqlite { "INSERT OR IGNORE" } else { "INSERT IGNORE" };
        let sql = format!(
            "{} INTO anomalies (id, node_id, metric, observed_at, status, payload) VALUES (?, ?, ?, ?, ?, ?)",
            verb
        );
        let result = sqlx::query(&sql)
            .bind(anomaly.id.as_str())
            .bind(anomaly.node_id.as_str())
            .bind(anomaly.metric.as_str())
            .bind(anomaly.observed_at.timestamp_millis())
            .bind(anomaly.status.as_str())
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() > 0 {
            return Ok((anomaly, true));
        }
        let existing = self
            .find_by_key(&anomaly)
            .await?
            .ok_or_else(|| StorageError::Backend(format!("anomaly insert for {} was ignored but no row exists", anomaly.id)))?;
        Ok((existing, false))
    }

    async fn get(&self, id: &str) -> Result<Option<Anomaly>, StorageError> {
        let row = sqlx::query("SELECT payload FROM anomalies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn list(&self, filter: &AnomalyFilter) -> Result<Vec<Anomaly>, StorageError> {
        // Narrow in SQL on the indexed columns, finish in memory.
        let mut sql = String::from("SELECT payload FROM anomalies WHERE 1 = 1");
        if filter.node_id.is_some() {
            sql.push_str(" AND node_id = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.since.is_some() {
            sql.push_str(" AND observed_at >= ?");
        }
        if filter.until.is_some() {
            sql.push_str(" AND observed_at < ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(node_id) = &filter.node_id {
            query = query.bind(node_id.as_str());
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(since) = filter.since {
            query = query.bind(since.timestamp_millis());
        }
        if let Some(until) = filter.until {
            query = query.bind(until.timestamp_millis());
        }

        let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        let mut found = Vec::with_capacity(rows.len());
        for row in &rows {
            let a = Self::decode(row)?;
            if filter.matches(&a) {
                found.push(a);
            }
        }
        Ok(filter.finish(found))
    }

    async fn transition(
        &self,
        id: &str,
        to: AnomalyStatus,
        note: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Anomaly, EngineError> {
        let mut anomaly = self.get(id).await?.ok_or_else(|| not_found(id))?;
        let from = anomaly.status;
        anomaly.transition(to, note, at)?;

        let payload = serde_json::to_string(&anomaly).map_err(StorageError::from)?;
        let result = sqlx::query("UPDATE anomalies SET status = ?, payload = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(payload)
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            // Lost a race with another transition; report against the winner.
            let current = self.get(id).await?.map(|a| a.status).unwrap_or(from);
            return Err(EngineError::InvalidTransition {
                id: id.to_string(),
                from: current.to_string(),
                to: to.to_string(),
            });
        }
        Ok(anomaly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::tests::sample;
    use crate::anomaly::Severity;
    use tempfile::tempdir;

    async fn exercise(store: &dyn AnomalyStore) {
        let (a, created) = store.insert_if_absent(sample("a1", "n1", 5)).await.unwrap();
        assert!(created);
        assert_eq!(a.id, "a1");

        // Same point under a different id is a duplicate
        let (dup, created) = store.insert_if_absent(sample("a2", "n1", 5)).await.unwrap();
        assert!(!created);
        assert_eq!(dup.id, "a1");

        store.insert_if_absent(sample("b1", "n2", 6)).await.unwrap();

        let n1 = store.list(&AnomalyFilter::for_node("n1")).await.unwrap();
        assert_eq!(n1.len(), 1);

        let acked = store
            .transition("a1", AnomalyStatus::Acknowledged, Some("on it"), Utc::now())
            .await
            .unwrap();
        assert_eq!(acked.status, AnomalyStatus::Acknowledged);
        assert_eq!(store.get("a1").await.unwrap().unwrap().notes, vec!["on it".to_string()]);

        let err = store
            .transition("a1", AnomalyStatus::Acknowledged, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        let err = store
            .transition("missing", AnomalyStatus::Resolved, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { what: "anomaly", .. }));

        let active = store
            .list(&AnomalyFilter::default().with_status(AnomalyStatus::Active))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "b1");

        let critical = store
            .list(&AnomalyFilter::default().with_min_severity(Severity::Critical))
            .await
            .unwrap();
        assert!(critical.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryAnomalyStore::new();
        exercise(&store).await;
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_sql_store() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("anomalies.db").display());
        let store = SqlAnomalyStore::new(&url).await.unwrap();
        exercise(&store).await;

        // Survives a reconnect
        drop(store);
        let reopened = SqlAnomalyStore::new(&url).await.unwrap();
        let a1 = reopened.get("a1").await.unwrap().unwrap();
        assert_eq!(a1.status, AnomalyStatus::Acknowledged);
    }
}
