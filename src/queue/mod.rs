//! Execution queue.
//!
//! The orchestrator hands each batch to a queue as one [`ExecutionRequest`] on the
//! lane for its kind. The queue owns job-level attempts and backoff; operation-level
//! retries happen inside the executor and never reach it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batch::BatchId;
use crate::error::Result;

pub mod memory;

pub use memory::{InMemoryQueue, JobHandle};

/// Named channel of execution requests, one per batch kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Lane {
    #[serde(rename = "batch_splits")]
    Splits,
    #[serde(rename = "batch_payments")]
    Payments,
    #[serde(rename = "batch_scheduled")]
    Scheduled,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Splits, Lane::Payments, Lane::Scheduled];

    pub fn name(&self) -> &'static str {
        match self {
            Lane::Splits => "batch_splits",
            Lane::Payments => "batch_payments",
            Lane::Scheduled => "batch_scheduled",
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload of an execution job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub batch_id: BatchId,
    pub chunk_size: usize,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Lower values run first; unset is 0
    pub priority: Option<i32>,
    /// Hold the job back this long before it becomes runnable
    pub delay: Option<Duration>,
    /// Identity of the job. Enqueueing an id that is still waiting returns the
    /// existing job instead of adding a second one.
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    /// Not yet picked up by a worker.
    pub fn is_queued(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Delayed)
    }
}

/// A job as seen through the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: String,
    pub lane: Lane,
    pub request: ExecutionRequest,
    pub priority: i32,
    pub state: JobState,
    /// Runs that have finished, successfully or not
    pub attempts_made: u32,
    /// Last reported progress, 0-100
    pub progress: u8,
    pub failed_reason: Option<String>,
    /// Distinguishes re-enqueues of the same id; outcomes of a superseded run are ignored
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Producer side of the queue, as used by the orchestrator.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        lane: Lane,
        request: ExecutionRequest,
        options: EnqueueOptions,
    ) -> Result<Job>;

    async fn get_job(&self, lane: Lane, job_id: &str) -> Result<Option<Job>>;

    /// Remove a job that has not started yet. Returns whether anything was removed;
    /// active and finished jobs are left in place.
    async fn remove_job(&self, lane: Lane, job_id: &str) -> Result<bool>;
}

/// Progress channel of the job currently being executed.
#[async_trait]
pub trait JobProgress: Send + Sync {
    async fn progress(&self, percent: u8) -> Result<()>;
}

/// Discards progress reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

#[async_trait]
impl JobProgress for NoopProgress {
    async fn progress(&self, _percent: u8) -> Result<()> {
        Ok(())
    }
}
