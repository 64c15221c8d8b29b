// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Named recurring jobs with one run in flight per name.
//!
//! Every registered job owns a gate (`tokio::sync::Mutex<()>`) that a run
//! holds from start to finish. A scheduled tick that finds the gate taken
//! is skipped and counted; a manual trigger that finds it taken is refused
//! with [`EngineError::SchedulerConflict`]. Nothing is ever queued.
//!
//! Scheduled runs are never retried inside a cycle: the next tick is the
//! retry. Failed manual runs can be retried explicitly with
//! [`SyncScheduler::retry_job`].
//!
//! Run records are written to a [`JobRecordStore`] when a run starts and
//! when it finishes. The per-job history kept in memory is bounded and is
//! reloaded from the store by [`SyncScheduler::restore_history`].

pub mod jobs;
pub mod record;
pub mod schedule;
pub mod store;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;

pub use record::{JobContext, JobStatus, SyncJobRecord, TriggerKind};
pub use schedule::Schedule;
pub use store::{JobRecordStore, MemoryJobRecordStore, SqlJobRecordStore};

/// A unit of scheduled work.
#[async_trait]
pub trait SyncJob: Send + Sync {
    /// Run once. Returns the number of records processed.
    ///
    /// Long jobs should check `ctx.cancel` between commit points and return
    /// [`EngineError::Cancelled`] when it fires.
    async fn run(&self, ctx: JobContext) -> Result<u64, EngineError>;
}

struct FnJob<F>(F);

#[async_trait]
impl<F, Fut> SyncJob for FnJob<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<u64, EngineError>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> Result<u64, EngineError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a job.
pub fn job_fn<F, Fut>(f: F) -> Arc<dyn SyncJob>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<u64, EngineError>> + Send + 'static,
{
    Arc::new(FnJob(f))
}

/// Registration summary of one job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub name: String,
    pub schedule: Schedule,
    pub running_job_id: Option<String>,
    pub last_run: Option<SyncJobRecord>,
    /// `None` for manual jobs or when automatic scheduling is off
    pub next_run: Option<DateTime<Utc>>,
}

struct JobEntry {
    name: String,
    schedule: Schedule,
    job: Arc<dyn SyncJob>,
    gate: Arc<tokio::sync::Mutex<()>>,
    running: Mutex<Option<String>>,
    /// Oldest first
    history: Mutex<VecDeque<SyncJobRecord>>,
    finished: watch::Sender<u64>,
}

impl JobEntry {
    fn new(name: String, schedule: Schedule, job: Arc<dyn SyncJob>) -> Self {
        let (finished, _) = watch::channel(0);
        Self {
            name,
            schedule,
            job,
            gate: Arc::new(tokio::sync::Mutex::new(())),
            running: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            finished,
        }
    }

    /// Replace the in-memory history with `records` (newest first).
    fn load_history(&self, records: Vec<SyncJobRecord>, cap: usize) {
        let mut history = self.history.lock();
        history.clear();
        history.extend(records.into_iter().take(cap).rev());
    }

    fn push_history(&self, record: SyncJobRecord, cap: usize) {
        let mut history = self.history.lock();
        history.push_back(record);
        while history.len() > cap {
            history.pop_front();
        }
    }

    /// Replace the running record with its final state and release the slot.
    fn finish(&self, record: SyncJobRecord, cap: usize) {
        {
            let mut history = self.history.lock();
            match history.iter_mut().find(|r| r.job_id == record.job_id) {
                Some(slot) => *slot = record,
                None => {
                    history.push_back(record);
                    while history.len() > cap {
                        history.pop_front();
                    }
                }
            }
        }
        *self.running.lock() = None;
    }

    fn latest(&self) -> Option<SyncJobRecord> {
        self.history.lock().back().cloned()
    }

    fn record(&self, job_id: &str) -> Option<SyncJobRecord> {
        self.history.lock().iter().find(|r| r.job_id == job_id).cloned()
    }
}

pub struct SyncScheduler {
    jobs: DashMap<String, Arc<JobEntry>>,
    store: Arc<dyn JobRecordStore>,
    history_len: usize,
    /// Fire jobs on their schedules; manual triggers work either way
    automatic: bool,
    started: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl SyncScheduler {
    /// Scheduler keeping run records in process memory.
    pub fn new(history_len: usize, automatic: bool) -> Self {
        Self::with_store(history_len, automatic, Arc::new(MemoryJobRecordStore::new()))
    }

    pub fn with_store(history_len: usize, automatic: bool, store: Arc<dyn JobRecordStore>) -> Self {
        Self {
            jobs: DashMap::new(),
            store,
            history_len: history_len.max(1),
            automatic,
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Add a named job. Registering after [`start`](Self::start) begins
    /// ticking it immediately.
    pub fn register_job(
        self: &Arc<Self>,
        name: impl Into<String>,
        schedule: Schedule,
        job: Arc<dyn SyncJob>,
    ) -> Result<(), EngineError> {
        let name = name.into();
        let entry = match self.jobs.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EngineError::Config(format!("job '{}' is already registered", name)));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let entry = Arc::new(JobEntry::new(name.clone(), schedule, job));
                slot.insert(Arc::clone(&entry));
                entry
            }
        };
        info!(job = %name, schedule = %schedule, "Registered job");

        if self.started.load(Ordering::SeqCst) && self.automatic {
            self.spawn_ticker(entry);
        }
        Ok(())
    }

    /// Reload each registered job's history from the store.
    ///
    /// Runs still marked running belong to a process that stopped before
    /// they finished; they are closed as cancelled, which keeps a manual
    /// run retryable. Returns the number of records loaded.
    pub async fn restore_history(&self) -> Result<usize, EngineError> {
        let entries: Vec<Arc<JobEntry>> = self.jobs.iter().map(|e| Arc::clone(e.value())).collect();
        let mut loaded = 0;
        for entry in entries {
            if entry.running.lock().is_some() {
                continue;
            }
            let mut records = self.store.recent(&entry.name, self.history_len).await?;
            for record in records.iter_mut().filter(|r| r.status == JobStatus::Running) {
                record.status = JobStatus::Cancelled;
                record.error = Some("engine stopped before the run finished".to_string());
                self.store.save(record).await?;
                warn!(job = %entry.name, job_id = %record.job_id, "Closed run left unfinished by a previous process");
            }
            loaded += records.len();
            entry.load_history(records, self.history_len);
        }
        debug!(loaded, "Job history restored");
        Ok(loaded)
    }

    /// Begin firing registered jobs on their schedules.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.automatic {
            info!(jobs = self.jobs.len(), "Automatic job scheduling disabled");
            return;
        }
        let entries: Vec<Arc<JobEntry>> = self.jobs.iter().map(|e| Arc::clone(e.value())).collect();
        for entry in entries {
            self.spawn_ticker(entry);
        }
        info!(jobs = self.jobs.len(), "Scheduler started");
    }

    fn spawn_ticker(self: &Arc<Self>, entry: Arc<JobEntry>) {
        if matches!(entry.schedule, Schedule::Manual) {
            return;
        }
        let scheduler = Arc::clone(self);
        self.tasks.spawn(async move { scheduler.tick_loop(entry).await });
    }

    async fn tick_loop(&self, entry: Arc<JobEntry>) {
        loop {
            let Some(delay) = entry.schedule.delay_from(Utc::now()) else {
                return;
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.launch(&entry, TriggerKind::Scheduled, 1, None) {
                Ok(job_id) => debug!(job = %entry.name, job_id = %job_id, "Scheduled run started"),
                Err(EngineError::SchedulerConflict { running_job_id, .. }) => {
                    crate::metrics::record_job_skipped(&entry.name);
                    warn!(
                        job = %entry.name,
                        running_job_id = %running_job_id,
                        "Scheduled run skipped, previous run still in flight"
                    );
                }
                Err(e) => {
                    debug!(job = %entry.name, error = %e, "Ticker stopping");
                    return;
                }
            }
        }
    }

    fn entry(&self, name: &str) -> Result<Arc<JobEntry>, EngineError> {
        self.jobs
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| EngineError::NotFound {
                what: "job",
                id: name.to_string(),
            })
    }

    /// Take the job's gate and spawn the run. Never waits for the gate.
    fn launch(
        &self,
        entry: &Arc<JobEntry>,
        trigger: TriggerKind,
        attempt: u32,
        retry_of: Option<String>,
    ) -> Result<String, EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::Cancelled(format!(
                "scheduler is shut down, '{}' not started",
                entry.name
            )));
        }
        let guard = Arc::clone(&entry.gate).try_lock_owned().map_err(|_| {
            if trigger != TriggerKind::Scheduled {
                crate::metrics::record_job_conflict(&entry.name);
            }
            EngineError::SchedulerConflict {
                job: entry.name.clone(),
                running_job_id: entry.running.lock().clone().unwrap_or_else(|| "unknown".to_string()),
            }
        })?;

        let record = SyncJobRecord::started(&entry.name, trigger, attempt, retry_of);
        let job_id = record.job_id.clone();
        *entry.running.lock() = Some(job_id.clone());
        entry.push_history(record.clone(), self.history_len);

        let ctx = JobContext {
            job_id: job_id.clone(),
            job_name: entry.name.clone(),
            trigger,
            attempt,
            cancel: self.shutdown.child_token(),
        };
        self.tasks.spawn(execute(
            Arc::clone(entry),
            Arc::clone(&self.store),
            guard,
            record,
            ctx,
            self.history_len,
        ));
        Ok(job_id)
    }

    /// Start a manual run. Fails with `SchedulerConflict` while a run of the
    /// same job is in flight.
    pub fn trigger_job(&self, name: &str) -> Result<String, EngineError> {
        let entry = self.entry(name)?;
        self.launch(&entry, TriggerKind::Manual, 1, None)
    }

    /// Re-run the job's last run if it was a failed manual (or retry) run.
    pub fn retry_job(&self, name: &str) -> Result<String, EngineError> {
        let entry = self.entry(name)?;
        let last = entry.latest().ok_or_else(|| EngineError::NotFound {
            what: "job run",
            id: name.to_string(),
        })?;
        let retryable = matches!(last.status, JobStatus::Failed | JobStatus::Cancelled)
            && last.trigger != TriggerKind::Scheduled;
        if !retryable {
            return Err(EngineError::InvalidTransition {
                id: last.job_id,
                from: format!("{} ({})", last.status, last.trigger.as_str()),
                to: "retry".to_string(),
            });
        }
        info!(job = %name, retry_of = %last.job_id, attempt = last.attempt + 1, "Retrying job");
        self.launch(&entry, TriggerKind::Retry, last.attempt + 1, Some(last.job_id))
    }

    /// The most recent run of `name`, running or finished.
    pub fn job_status(&self, name: &str) -> Result<Option<SyncJobRecord>, EngineError> {
        Ok(self.entry(name)?.latest())
    }

    /// Retained runs of `name`, newest first.
    pub fn history(&self, name: &str) -> Result<Vec<SyncJobRecord>, EngineError> {
        let entry = self.entry(name)?;
        let history = entry.history.lock();
        Ok(history.iter().rev().cloned().collect())
    }

    /// Up to `limit` runs of `name` from the store, newest first. Reaches
    /// past the in-memory history.
    pub async fn stored_history(&self, name: &str, limit: usize) -> Result<Vec<SyncJobRecord>, EngineError> {
        self.entry(name)?;
        Ok(self.store.recent(name, limit).await?)
    }

    pub fn find_run(&self, job_id: &str) -> Option<SyncJobRecord> {
        self.jobs.iter().find_map(|e| e.record(job_id))
    }

    /// Wait until the run `job_id` has finished. `None` if the run is unknown
    /// or has aged out of history.
    pub async fn wait_for(&self, job_id: &str) -> Option<SyncJobRecord> {
        let entry = self
            .jobs
            .iter()
            .find(|e| e.record(job_id).is_some())
            .map(|e| Arc::clone(e.value()))?;
        let mut finished = entry.finished.subscribe();
        loop {
            let record = entry.record(job_id)?;
            if record.status.is_finished() {
                return Some(record);
            }
            if finished.changed().await.is_err() {
                return entry.record(job_id);
            }
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.jobs.get(name).is_some_and(|e| e.running.lock().is_some())
    }

    /// All registered jobs, sorted by name.
    pub fn jobs(&self) -> Vec<JobInfo> {
        let now = Utc::now();
        let ticking = self.automatic && !self.shutdown.is_cancelled();
        let mut out: Vec<JobInfo> = self
            .jobs
            .iter()
            .map(|e| JobInfo {
                name: e.name.clone(),
                schedule: e.schedule,
                running_job_id: e.running.lock().clone(),
                last_run: e.latest(),
                next_run: if ticking { e.schedule.next_after(now) } else { None },
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Stop ticking, cancel running jobs and wait up to `deadline` for them
    /// to reach a commit point. Returns false if runs were still going.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        let in_flight = self.jobs.iter().filter(|e| e.running.lock().is_some()).count();
        info!(in_flight, "Scheduler shutting down");
        self.shutdown.cancel();
        self.tasks.close();
        match tokio::time::timeout(deadline, self.tasks.wait()).await {
            Ok(()) => {
                info!("Scheduler stopped");
                true
            }
            Err(_) => {
                warn!(
                    deadline_ms = deadline.as_millis() as u64,
                    still_running = self.tasks.len(),
                    "Scheduler shutdown deadline exceeded"
                );
                false
            }
        }
    }
}

/// Write a run record through. A failed write is logged; the in-memory
/// history still has the record.
async fn persist(store: &dyn JobRecordStore, record: &SyncJobRecord) {
    if let Err(e) = store.save(record).await {
        warn!(job = %record.job_name, job_id = %record.job_id, error = %e, "Failed to persist job run record");
    }
}

async fn execute(
    entry: Arc<JobEntry>,
    store: Arc<dyn JobRecordStore>,
    guard: OwnedMutexGuard<()>,
    mut record: SyncJobRecord,
    ctx: JobContext,
    history_len: usize,
) {
    persist(store.as_ref(), &record).await;
    let started = Instant::now();
    info!(
        job = %entry.name,
        job_id = %record.job_id,
        trigger = record.trigger.as_str(),
        attempt = record.attempt,
        "Job started"
    );

    let job = Arc::clone(&entry.job);
    let outcome = tokio::spawn(async move { job.run(ctx).await }).await;
    record.completed_at = Some(Utc::now());
    match outcome {
        Ok(Ok(processed)) => {
            record.status = JobStatus::Success;
            record.records_processed = processed;
        }
        Ok(Err(EngineError::Cancelled(reason))) => {
            record.status = JobStatus::Cancelled;
            record.error = Some(reason);
        }
        Ok(Err(e)) => {
            record.status = JobStatus::Failed;
            record.error = Some(e.to_string());
        }
        Err(join) => {
            record.status = JobStatus::Failed;
            record.error = Some(if join.is_panic() {
                "job panicked".to_string()
            } else {
                "job aborted".to_string()
            });
        }
    }

    let elapsed = started.elapsed();
    crate::metrics::record_job_run(&entry.name, record.status.as_str(), elapsed);
    match record.status {
        JobStatus::Success => info!(
            job = %entry.name,
            job_id = %record.job_id,
            records = record.records_processed,
            elapsed_ms = elapsed.as_millis() as u64,
            "Job finished"
        ),
        JobStatus::Cancelled => warn!(job = %entry.name, job_id = %record.job_id, "Job cancelled"),
        _ => error!(
            job = %entry.name,
            job_id = %record.job_id,
            error = record.error.as_deref().unwrap_or_default(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Job failed"
        ),
    }

    persist(store.as_ref(), &record).await;
    entry.finish(record, history_len);
    drop(guard);
    entry.finished.send_modify(|n| *n += 1);
}
