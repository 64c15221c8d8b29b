// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write buffer between ingestion and the Warm tier.
//!
//! Readings are queued per node. A partition is flushed when it reaches
//! `flush_count`, when the flush interval elapses, or as soon as anything is
//! queued once the buffer is under pressure. Each node has a single flusher
//! (its flush lock), so a node's batches reach Warm in arrival order while
//! different nodes flush concurrently.
//!
//! A flush is an idempotent upsert retried with backoff. Cache keys the
//! batch can affect are invalidated before the flush reports success. A
//! batch that exhausts its retries goes to the dead-letter log and the
//! buffer moves on.

pub mod partition;

pub use partition::FlushReason;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backpressure::BackpressureLevel;
use crate::cache::CacheManager;
use crate::config::BufferConfig;
use crate::error::EngineError;
use crate::reading::SensorReading;
use crate::resilience::circuit_breaker::TierCircuits;
use crate::resilience::dead_letter::DeadLetterLog;
use crate::resilience::guarded;
use crate::resilience::retry::retry;
use crate::storage::traits::{SeriesTier, StorageError, Tier};
use partition::Partition;

struct NodeQueue {
    partition: Mutex<Partition>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl NodeQueue {
    fn new() -> Self {
        Self {
            partition: Mutex::new(Partition::default()),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }
}

/// Result of queueing one reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    /// The node's partition should be flushed now
    pub flush_due: Option<FlushReason>,
    pub level: BackpressureLevel,
}

/// What happened to one partition flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was queued
    Empty,
    Committed { rows: usize },
    DeadLettered { rows: usize, batch_id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub partitions: usize,
    pub committed: usize,
    pub dead_lettered: usize,
    /// Partitions whose batch could be neither written nor dead-lettered
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferStats {
    pub pending: usize,
    pub partitions: usize,
    pub flushed_readings: u64,
    pub flush_batches: u64,
    pub dead_lettered_readings: u64,
    pub failed_flushes: u64,
    pub level: BackpressureLevel,
}

pub struct WriteBuffer {
    config: BufferConfig,
    warm: Arc<dyn SeriesTier>,
    circuits: Arc<TierCircuits>,
    warm_timeout: Duration,
    cache: Arc<CacheManager>,
    dead_letters: Arc<DeadLetterLog>,

    queues: DashMap<String, Arc<NodeQueue>>,
    pending: AtomicUsize,

    flushed_readings: AtomicU64,
    flush_batches: AtomicU64,
    dead_lettered_readings: AtomicU64,
    failed_flushes: AtomicU64,
}

impl WriteBuffer {
    pub fn new(
        config: BufferConfig,
        warm: Arc<dyn SeriesTier>,
        circuits: Arc<TierCircuits>,
        warm_timeout: Duration,
        cache: Arc<CacheManager>,
        dead_letters: Arc<DeadLetterLog>,
    ) -> Self {
        Self {
            config,
            warm,
            circuits,
            warm_timeout,
            cache,
            dead_letters,
            queues: DashMap::new(),
            pending: AtomicUsize::new(0),
            flushed_readings: AtomicU64::new(0),
            flush_batches: AtomicU64::new(0),
            dead_lettered_readings: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
        }
    }

    fn queue(&self, node_id: &str) -> Arc<NodeQueue> {
        if let Some(q) = self.queues.get(node_id) {
            return q.value().clone();
        }
        self.queues
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(NodeQueue::new()))
            .value()
            .clone()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn level(&self) -> BackpressureLevel {
        BackpressureLevel::from_fill(self.pending(), self.config.global_cap)
    }

    /// Queue a reading.
    ///
    /// Refused with `Backpressure` only when the buffer (or the node's
    /// partition) is full; a failing Warm tier by itself never refuses.
    pub fn enqueue(&self, reading: SensorReading) -> Result<Enqueued, EngineError> {
        let level = self.level();
        if !level.should_accept_writes() {
            crate::metrics::record_ingest_rejected("buffer_full", 1);
            return Err(EngineError::Backpressure {
                pending: self.pending(),
                cap: self.config.global_cap,
            });
        }

        let queue = self.queue(&reading.node_id);
        let len = {
            let mut partition = queue.partition.lock();
            if partition.len() >= self.config.per_node_cap {
                crate::metrics::record_ingest_rejected("partition_full", 1);
                return Err(EngineError::Backpressure {
                    pending: partition.len(),
                    cap: self.config.per_node_cap,
                });
            }
            partition.push(reading, Utc::now());
            partition.len()
        };
        let pending = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        crate::metrics::set_buffer_depth(pending);
        crate::metrics::set_backpressure_level(level as u8);

        let flush_due = if len >= self.config.flush_count {
            Some(FlushReason::Count)
        } else if level.flush_eagerly() {
            Some(FlushReason::Pressure)
        } else {
            None
        };
        if level >= BackpressureLevel::High {
            warn!(pending, cap = self.config.global_cap, level = %level, "Write buffer nearly full");
        }
        Ok(Enqueued { flush_due, level })
    }

    /// Arrival time of the oldest reading of `node_id` not yet in Warm.
    #[must_use]
    pub fn oldest_unflushed(&self, node_id: &str) -> Option<DateTime<Utc>> {
        self.queues.get(node_id).and_then(|q| q.partition.lock().oldest_unflushed())
    }

    /// Flush one node's partition. Waits for a flush already running for
    /// the same node, then flushes whatever arrived since.
    #[tracing::instrument(skip(self), fields(rows))]
    pub async fn flush_node(&self, node_id: &str, reason: FlushReason) -> Result<FlushOutcome, EngineError> {
        let queue = self.queue(node_id);
        let outcome = self.flush_queue(node_id, &queue, reason).await;
        drop(queue);
        self.forget_if_idle(node_id);
        outcome
    }

    /// Drop a drained node's queue. A queue some caller still holds is
    /// kept, so a concurrent enqueue never lands in a detached partition.
    fn forget_if_idle(&self, node_id: &str) {
        self.queues
            .remove_if(node_id, |_, q| Arc::strong_count(q) == 1 && q.partition.lock().is_idle());
    }

    async fn flush_queue(
        &self,
        node_id: &str,
        queue: &NodeQueue,
        reason: FlushReason,
    ) -> Result<FlushOutcome, EngineError> {
        let _flushing = queue.flush_lock.lock().await;

        let batch = queue.partition.lock().take();
        if batch.is_empty() {
            queue.partition.lock().finish();
            return Ok(FlushOutcome::Empty);
        }
        let rows = batch.len();
        tracing::Span::current().record("rows", rows);
        let start = Instant::now();

        let warm = Arc::clone(&self.warm);
        let written = retry("warm_flush", &self.config.retry_config(), || {
            let warm = Arc::clone(&warm);
            let batch = &batch;
            async move {
                guarded(&self.circuits.warm, Tier::Warm, "upsert", self.warm_timeout, || async move {
                    warm.upsert(batch).await
                })
                .await
            }
        })
        .await;

        match written {
            Ok(result) => {
                let timestamps: Vec<DateTime<Utc>> = batch.iter().map(|r| r.timestamp).collect();
                self.cache.invalidate_readings(node_id, &timestamps).await;
                self.complete(queue, rows);
                self.flushed_readings.fetch_add(rows as u64, Ordering::Relaxed);
                self.flush_batches.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_flush(rows, start.elapsed(), true);
                debug!(
                    node_id = %node_id,
                    rows,
                    batch_id = %result.batch_id,
                    reason = reason.as_str(),
                    "Flushed partition to warm tier"
                );
                Ok(FlushOutcome::Committed { rows })
            }
            Err(e) => {
                self.failed_flushes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_flush(rows, start.elapsed(), false);
                self.dead_letter(node_id, queue, batch, e).await
            }
        }
    }

    fn complete(&self, queue: &NodeQueue, rows: usize) {
        queue.partition.lock().finish();
        let pending = self.pending.fetch_sub(rows, Ordering::AcqRel) - rows;
        crate::metrics::set_buffer_depth(pending);
    }

    async fn dead_letter(
        &self,
        node_id: &str,
        queue: &NodeQueue,
        batch: Vec<SensorReading>,
        cause: StorageError,
    ) -> Result<FlushOutcome, EngineError> {
        let rows = batch.len();
        let attempts = self.config.flush_max_retries as u32;
        match self
            .dead_letters
            .record(node_id, &batch, &cause.to_string(), attempts)
            .await
        {
            Ok(batch_id) => {
                self.complete(queue, rows);
                self.dead_lettered_readings.fetch_add(rows as u64, Ordering::Relaxed);
                warn!(
                    node_id = %node_id,
                    rows,
                    batch_id = %batch_id,
                    error = %cause,
                    "Flush retries exhausted, batch dead-lettered"
                );
                Ok(FlushOutcome::DeadLettered { rows, batch_id })
            }
            Err(dl_err) => {
                // Keep the readings; the next flush tries again.
                queue.partition.lock().restore(batch);
                error!(
                    node_id = %node_id,
                    rows,
                    error = %cause,
                    dead_letter_error = %dl_err,
                    "Flush failed and dead-letter log refused the batch"
                );
                Err(EngineError::sync(
                    "flush",
                    format!("{} (dead-letter: {})", cause, dl_err),
                ))
            }
        }
    }

    /// Flush every non-empty partition concurrently.
    pub async fn flush_all(&self, reason: FlushReason) -> FlushReport {
        let nodes: Vec<String> = self
            .queues
            .iter()
            .filter(|q| {
                let p = q.partition.lock();
                !p.is_empty() || p.oldest_unflushed().is_some()
            })
            .map(|q| q.key().clone())
            .collect();

        let results = join_all(nodes.iter().map(|n| self.flush_node(n, reason))).await;

        let mut report = FlushReport {
            partitions: nodes.len(),
            ..FlushReport::default()
        };
        for result in results {
            match result {
                Ok(FlushOutcome::Committed { rows }) => report.committed += rows,
                Ok(FlushOutcome::DeadLettered { rows, .. }) => report.dead_lettered += rows,
                Ok(FlushOutcome::Empty) => {}
                Err(_) => report.failed += 1,
            }
        }
        if report.committed + report.dead_lettered > 0 || report.failed > 0 {
            debug!(
                reason = reason.as_str(),
                partitions = report.partitions,
                committed = report.committed,
                dead_lettered = report.dead_lettered,
                failed = report.failed,
                "Write buffer flush pass"
            );
        }
        report
    }

    /// Flush a node in the background.
    pub fn spawn_flush(self: &Arc<Self>, node_id: String, reason: FlushReason) -> JoinHandle<()> {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = buffer.flush_node(&node_id, reason).await {
                warn!(node_id = %node_id, error = %e, "Background flush failed");
            }
        })
    }

    /// Interval flusher. Stops when `cancel` fires; the caller drains
    /// afterwards with [`drain`](Self::drain).
    pub fn run_flusher(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let buffer = Arc::clone(self);
        let period = self.config.flush_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        buffer.flush_all(FlushReason::Interval).await;
                    }
                }
            }
            debug!("Write buffer flusher stopped");
        })
    }

    /// Flush everything still queued, waiting out in-flight flushes.
    pub async fn drain(&self) -> FlushReport {
        let report = self.flush_all(FlushReason::Shutdown).await;
        info!(
            committed = report.committed,
            dead_lettered = report.dead_lettered,
            remaining = self.pending(),
            "Write buffer drained"
        );
        report
    }

    #[must_use]
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            pending: self.pending(),
            partitions: self.queues.len(),
            flushed_readings: self.flushed_readings.load(Ordering::Relaxed),
            flush_batches: self.flush_batches.load(Ordering::Relaxed),
            dead_lettered_readings: self.dead_lettered_readings.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            level: self.level(),
        }
    }
}
