// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Job run audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Success,
    Failed,
    /// Stopped by shutdown before finishing
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    Manual,
    /// Explicit retry of a failed manual run
    Retry,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
            Self::Retry => "retry",
        }
    }
}

/// One execution of a named job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJobRecord {
    pub job_id: String,
    pub job_name: String,
    pub status: JobStatus,
    pub trigger: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_processed: u64,
    pub error: Option<String>,
    /// 1 for a first run, +1 per retry
    pub attempt: u32,
    /// Job id of the failed run this one retries
    pub retry_of: Option<String>,
}

impl SyncJobRecord {
    pub(crate) fn started(job_name: &str, trigger: TriggerKind, attempt: u32, retry_of: Option<String>) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            job_name: job_name.to_string(),
            status: JobStatus::Running,
            trigger,
            started_at: Utc::now(),
            completed_at: None,
            records_processed: 0,
            error: None,
            attempt,
            retry_of,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|done| done - self.started_at)
    }
}

/// Handed to every run.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub job_name: String,
    pub trigger: TriggerKind,
    pub attempt: u32,
    /// Cancelled on scheduler shutdown; jobs stop at their next commit point
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
