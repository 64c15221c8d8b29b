// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend for the Hot tier.
//!
//! Plain string values with millisecond expiry (`SET .. PX`, `PTTL`). Every
//! key is namespaced by an optional prefix so the cache can share a Redis
//! instance with other applications.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, AsyncCommands, Client, RedisError};

use super::traits::{HotTier, StorageError, Tier, TierClient};
use crate::resilience::retry::{retry, retry_if, RetryConfig};

pub struct RedisHotStore {
    connection: ConnectionManager,
    /// Key prefix (e.g. "hydro:" → "hydro:latest:node-7")
    prefix: String,
}

impl RedisHotStore {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect with an optional key prefix.
    ///
    /// ```rust,no_run
    /// # use hydro_sync::storage::redis::RedisHotStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let hot = RedisHotStore::with_prefix("redis://localhost", Some("hydro:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(map_redis_error)?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Classify a Redis error so callers can tell outages from bad requests.
fn map_redis_error(e: RedisError) -> StorageError {
    if e.is_timeout() {
        StorageError::Timeout(e.to_string())
    } else if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
        StorageError::Unavailable(e.to_string())
    } else {
        StorageError::Backend(e.to_string())
    }
}

#[async_trait]
impl TierClient for RedisHotStore {
    fn tier(&self) -> Tier {
        Tier::Hot
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _pong: String = cmd("PING").query_async(&mut conn).await.map_err(map_redis_error)?;
        Ok(())
    }
}

#[async_trait]
impl HotTier for RedisHotStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let key = self.prefixed_key(key);
        retry_if("redis_get", &RetryConfig::query(), StorageError::is_transient, || {
            let mut conn = self.connection.clone();
            let key = key.clone();
            async move { conn.get::<_, Option<String>>(&key).await.map_err(map_redis_error) }
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        let key = self.prefixed_key(key);
        let ttl_ms = ttl.as_millis().max(1) as u64;
        retry_if("redis_set", &RetryConfig::query(), StorageError::is_transient, || {
            let mut conn = self.connection.clone();
            let key = key.clone();
            async move {
                cmd("SET")
                    .arg(&key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(map_redis_error)
            }
        })
        .await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        let key = self.prefixed_key(key);
        let mut conn = self.connection.clone();
        // -2: missing, -1: no expiry
        let ms: i64 = conn.pttl(&key).await.map_err(map_redis_error)?;
        Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let key = self.prefixed_key(key);
        retry_if("redis_delete", &RetryConfig::query(), StorageError::is_transient, || {
            let mut conn = self.connection.clone();
            let key = key.clone();
            async move { conn.del::<_, ()>(&key).await.map_err(map_redis_error) }
        })
        .await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = keys.iter().map(|k| self.prefixed_key(k)).collect();
        retry_if("redis_delete_many", &RetryConfig::query(), StorageError::is_transient, || {
            let mut conn = self.connection.clone();
            let keys = keys.clone();
            async move { conn.del::<_, ()>(keys).await.map_err(map_redis_error) }
        })
        .await
    }
}
