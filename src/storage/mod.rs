// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tier backends.
//!
//! - [`traits`]: the `TierClient` / `HotTier` / `SeriesTier` interfaces
//! - [`memory`]: in-process backends for tests and embedded use
//! - [`redis`]: Hot tier on Redis
//! - [`sql`]: Warm and Cold tiers on SQLite or MySQL via sqlx

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;

use std::sync::Arc;

use traits::{HotTier, SeriesTier, StorageError, Tier};

/// The three backends the router chooses between.
#[derive(Clone)]
pub struct Tiers {
    pub hot: Arc<dyn HotTier>,
    pub warm: Arc<dyn SeriesTier>,
    pub cold: Arc<dyn SeriesTier>,
}

impl Tiers {
    pub fn new(hot: Arc<dyn HotTier>, warm: Arc<dyn SeriesTier>, cold: Arc<dyn SeriesTier>) -> Self {
        Self { hot, warm, cold }
    }

    /// All three tiers in process memory.
    pub fn in_memory() -> Self {
        Self {
            hot: Arc::new(memory::MemoryHotStore::new()),
            warm: Arc::new(memory::MemorySeriesStore::warm()),
            cold: Arc::new(memory::MemorySeriesStore::cold()),
        }
    }

    /// Ping every tier, in order.
    pub async fn ping_all(&self) -> Vec<(Tier, Result<(), StorageError>)> {
        vec![
            (self.hot.tier(), self.hot.ping().await),
            (self.warm.tier(), self.warm.ping().await),
            (self.cold.tier(), self.cold.ping().await),
        ]
    }
}
