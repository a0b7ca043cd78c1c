//! In-process queue with per-lane priority ordering, delayed jobs and
//! attempts/backoff on failure.
//!
//! Jobs are retained after they finish unless the lane's `remove_on_*` flags say
//! otherwise. Delays are driven by tokio timers, so the queue must be used from
//! within a runtime.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use super::{EnqueueOptions, ExecutionRequest, Job, JobProgress, JobQueue, JobState, Lane};
use crate::config::QueueConfig;
use crate::error::{Result, VolleyError};

#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    seq: u64,
    job_id: String,
    run_id: Uuid,
}

// BinaryHeap is a max-heap: the "greatest" entry is the lowest priority value,
// then the earliest sequence number.
impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct State {
    jobs: HashMap<(Lane, String), Job>,
    ready: HashMap<Lane, BinaryHeap<ReadyEntry>>,
    seq: u64,
}

impl State {
    fn push_ready(&mut self, lane: Lane, job_id: &str, priority: i32, run_id: Uuid) {
        self.seq += 1;
        let entry = ReadyEntry {
            priority,
            seq: self.seq,
            job_id: job_id.to_string(),
            run_id,
        };
        self.ready.entry(lane).or_default().push(entry);
    }

    /// Pop the best runnable job on `lane`, skipping entries left behind by removed
    /// or superseded runs.
    fn pop_ready(&mut self, lane: Lane) -> Option<Job> {
        let heap = self.ready.get_mut(&lane)?;
        while let Some(entry) = heap.pop() {
            if let Some(job) = self.jobs.get_mut(&(lane, entry.job_id))
                && job.run_id == entry.run_id
                && job.state == JobState::Waiting
            {
                job.state = JobState::Active;
                return Some(job.clone());
            }
        }
        None
    }
}

/// In-process [`JobQueue`].
#[derive(Clone)]
pub struct InMemoryQueue {
    state: Arc<Mutex<State>>,
    notifiers: Arc<HashMap<Lane, Arc<Notify>>>,
    config: QueueConfig,
}

impl InMemoryQueue {
    pub fn new(config: QueueConfig) -> Self {
        let notifiers = Lane::ALL
            .into_iter()
            .map(|lane| (lane, Arc::new(Notify::new())))
            .collect();
        Self {
            state: Arc::new(Mutex::new(State::default())),
            notifiers: Arc::new(notifiers),
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn notify(&self, lane: Lane) {
        if let Some(notify) = self.notifiers.get(&lane) {
            notify.notify_one();
        }
    }

    /// Wait for the next runnable job on `lane` and mark it active.
    pub async fn next(&self, lane: Lane) -> Result<JobHandle> {
        let notify = self
            .notifiers
            .get(&lane)
            .cloned()
            .ok_or_else(|| VolleyError::Queue(format!("Unknown lane {}", lane)))?;
        loop {
            let notified = notify.notified();
            if let Some(job) = self.try_next(lane) {
                return Ok(JobHandle {
                    queue: self.clone(),
                    job,
                });
            }
            notified.await;
        }
    }

    /// Take the next runnable job on `lane` without waiting.
    pub fn try_next(&self, lane: Lane) -> Option<Job> {
        let job = self.state.lock().pop_ready(lane);
        if let Some(job) = &job {
            tracing::debug!(lane = %lane, job_id = %job.id, "Job activated");
        }
        job
    }

    /// All jobs on `lane`, oldest first.
    pub fn jobs(&self, lane: Lane) -> Vec<Job> {
        let state = self.state.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .iter()
            .filter(|((l, _), _)| *l == lane)
            .map(|(_, job)| job.clone())
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Number of jobs on `lane` that have not started yet.
    pub fn queued_count(&self, lane: Lane) -> usize {
        self.state
            .lock()
            .jobs
            .iter()
            .filter(|((l, _), job)| *l == lane && job.state.is_queued())
            .count()
    }

    fn schedule_promotion(&self, lane: Lane, job_id: String, run_id: Uuid, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let promoted = {
                let mut state = queue.state.lock();
                let priority = match state.jobs.get_mut(&(lane, job_id.clone())) {
                    Some(job) if job.run_id == run_id && job.state == JobState::Delayed => {
                        job.state = JobState::Waiting;
                        Some(job.priority)
                    }
                    _ => None,
                };
                if let Some(priority) = priority {
                    state.push_ready(lane, &job_id, priority, run_id);
                }
                priority.is_some()
            };
            if promoted {
                tracing::trace!(lane = %lane, job_id = %job_id, "Delayed job is now waiting");
                queue.notify(lane);
            }
        });
    }

    /// Record a successful run.
    fn complete(&self, lane: Lane, job_id: &str, run_id: Uuid) {
        let mut state = self.state.lock();
        let key = (lane, job_id.to_string());
        let Some(job) = state.jobs.get_mut(&key) else {
            return;
        };
        if job.run_id != run_id {
            return;
        }
        job.state = JobState::Completed;
        job.attempts_made += 1;
        job.progress = 100;
        if self.config.remove_on_complete {
            state.jobs.remove(&key);
        }
    }

    /// Record a failed run. The job goes back to `Delayed` with the lane's backoff
    /// while attempts remain, and to `Failed` after that.
    fn fail(&self, lane: Lane, job_id: &str, run_id: Uuid, reason: &str) -> Option<JobState> {
        let policy = self.config.policy_for(lane);
        let (next_state, delay) = {
            let mut state = self.state.lock();
            let key = (lane, job_id.to_string());
            let job = state.jobs.get_mut(&key)?;
            if job.run_id != run_id {
                return None;
            }
            job.attempts_made += 1;
            job.failed_reason = Some(reason.to_string());

            if job.attempts_made < policy.attempts {
                job.state = JobState::Delayed;
                (JobState::Delayed, Some(policy.backoff.delay(job.attempts_made)))
            } else {
                job.state = JobState::Failed;
                if self.config.remove_on_fail {
                    state.jobs.remove(&key);
                }
                (JobState::Failed, None)
            }
        };

        if let Some(delay) = delay {
            tracing::info!(
                lane = %lane,
                job_id,
                delay_ms = delay.as_millis() as u64,
                "Job failed, will retry"
            );
            self.schedule_promotion(lane, job_id.to_string(), run_id, delay);
        } else {
            tracing::warn!(lane = %lane, job_id, reason, "Job failed, no attempts remaining");
        }
        Some(next_state)
    }

    fn set_progress(&self, lane: Lane, job_id: &str, run_id: Uuid, percent: u8) {
        let mut state = self.state.lock();
        if let Some(job) = state.jobs.get_mut(&(lane, job_id.to_string()))
            && job.run_id == run_id
        {
            job.progress = percent.min(100);
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(
        &self,
        lane: Lane,
        request: ExecutionRequest,
        options: EnqueueOptions,
    ) -> Result<Job> {
        let job_id = options
            .job_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let priority = options.priority.unwrap_or(0);
        let delay = options.delay.filter(|d| !d.is_zero());

        let job = {
            let mut state = self.state.lock();
            let key = (lane, job_id.clone());
            if let Some(existing) = state.jobs.get(&key)
                && existing.state.is_queued()
            {
                tracing::debug!(lane = %lane, job_id = %job_id, "Job already queued");
                return Ok(existing.clone());
            }

            let job = Job {
                id: job_id.clone(),
                lane,
                request,
                priority,
                state: if delay.is_some() {
                    JobState::Delayed
                } else {
                    JobState::Waiting
                },
                attempts_made: 0,
                progress: 0,
                failed_reason: None,
                run_id: Uuid::new_v4(),
                created_at: Utc::now(),
            };
            if delay.is_none() {
                state.push_ready(lane, &job_id, priority, job.run_id);
            }
            state.jobs.insert(key, job.clone());
            job
        };

        tracing::debug!(
            lane = %lane,
            job_id = %job.id,
            batch_id = %request.batch_id,
            priority,
            "Job enqueued"
        );

        match delay {
            Some(delay) => self.schedule_promotion(lane, job_id, job.run_id, delay),
            None => self.notify(lane),
        }
        Ok(job)
    }

    async fn get_job(&self, lane: Lane, job_id: &str) -> Result<Option<Job>> {
        Ok(self
            .state
            .lock()
            .jobs
            .get(&(lane, job_id.to_string()))
            .cloned())
    }

    async fn remove_job(&self, lane: Lane, job_id: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let key = (lane, job_id.to_string());
        let removable = state
            .jobs
            .get(&key)
            .is_some_and(|job| job.state.is_queued());
        if removable {
            // The heap entry is skipped lazily when popped
            state.jobs.remove(&key);
        }
        Ok(removable)
    }
}

/// An active job handed to a consumer. Finish it with [`JobHandle::complete`] or
/// [`JobHandle::fail`].
pub struct JobHandle {
    queue: InMemoryQueue,
    job: Job,
}

impl JobHandle {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn request(&self) -> ExecutionRequest {
        self.job.request
    }

    pub fn complete(self) {
        self.queue
            .complete(self.job.lane, &self.job.id, self.job.run_id);
    }

    /// Returns the job's state after the failure, or `None` if the job was removed
    /// or superseded meanwhile.
    pub fn fail(self, reason: &str) -> Option<JobState> {
        self.queue
            .fail(self.job.lane, &self.job.id, self.job.run_id, reason)
    }
}

#[async_trait]
impl JobProgress for JobHandle {
    async fn progress(&self, percent: u8) -> Result<()> {
        self.queue
            .set_progress(self.job.lane, &self.job.id, self.job.run_id, percent);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchId;
    use crate::config::{Backoff, BackoffKind, LanePolicy};

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            batch_id: BatchId::new(),
            chunk_size: 100,
            concurrency: 5,
        }
    }

    fn with_id(id: &str) -> EnqueueOptions {
        EnqueueOptions {
            job_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = InMemoryQueue::default();
        for (id, priority) in [("a", 5), ("b", 1), ("c", 5), ("d", 1)] {
            queue
                .enqueue(
                    Lane::Payments,
                    request(),
                    EnqueueOptions {
                        priority: Some(priority),
                        ..with_id(id)
                    },
                )
                .await
                .unwrap();
        }

        let order: Vec<String> = std::iter::from_fn(|| queue.try_next(Lane::Payments))
            .map(|job| job.id)
            .collect();
        assert_eq!(order, vec!["b", "d", "a", "c"]);
    }

    #[tokio::test]
    async fn test_lanes_are_independent() {
        let queue = InMemoryQueue::default();
        queue
            .enqueue(Lane::Splits, request(), with_id("split-job"))
            .await
            .unwrap();
        assert!(queue.try_next(Lane::Payments).is_none());
        assert_eq!(queue.try_next(Lane::Splits).unwrap().id, "split-job");
    }

    #[tokio::test]
    async fn test_duplicate_id_while_queued_is_deduplicated() {
        let queue = InMemoryQueue::default();
        let first = queue
            .enqueue(Lane::Payments, request(), with_id("job-1"))
            .await
            .unwrap();
        let second = queue
            .enqueue(Lane::Payments, request(), with_id("job-1"))
            .await
            .unwrap();
        assert_eq!(first.run_id, second.run_id);
        assert_eq!(queue.queued_count(Lane::Payments), 1);
    }

    #[tokio::test]
    async fn test_reenqueue_after_completion_starts_new_run() {
        let queue = InMemoryQueue::default();
        queue
            .enqueue(Lane::Payments, request(), with_id("job-1"))
            .await
            .unwrap();
        let handle = queue.next(Lane::Payments).await.unwrap();
        let first_run = handle.job().run_id;
        handle.complete();

        let job = queue
            .get_job(Lane::Payments, "job-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress, 100);

        let again = queue
            .enqueue(Lane::Payments, request(), with_id("job-1"))
            .await
            .unwrap();
        assert_ne!(again.run_id, first_run);
        assert_eq!(again.state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_remove_only_queued_jobs() {
        let queue = InMemoryQueue::default();
        queue
            .enqueue(Lane::Payments, request(), with_id("waiting"))
            .await
            .unwrap();
        queue
            .enqueue(Lane::Payments, request(), with_id("active"))
            .await
            .unwrap();

        // Priority ties are FIFO, so "waiting" is popped first; re-add it
        let first = queue.try_next(Lane::Payments).unwrap();
        assert_eq!(first.id, "waiting");
        queue
            .enqueue(Lane::Payments, request(), with_id("waiting"))
            .await
            .unwrap();
        let active = queue.try_next(Lane::Payments).unwrap();
        assert_eq!(active.id, "active");

        assert!(queue.remove_job(Lane::Payments, "waiting").await.unwrap());
        assert!(!queue.remove_job(Lane::Payments, "active").await.unwrap());
        assert!(!queue.remove_job(Lane::Payments, "missing").await.unwrap());
        assert!(queue.try_next(Lane::Payments).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_job_becomes_runnable() {
        let queue = InMemoryQueue::default();
        let job = queue
            .enqueue(
                Lane::Scheduled,
                request(),
                EnqueueOptions {
                    delay: Some(Duration::from_secs(30)),
                    ..with_id("later")
                },
            )
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert!(queue.try_next(Lane::Scheduled).is_none());

        let handle = queue.next(Lane::Scheduled).await.unwrap();
        assert_eq!(handle.job().id, "later");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_retries_until_attempts_exhausted() {
        let mut config = QueueConfig::default();
        config.default_policy = LanePolicy {
            attempts: 2,
            backoff: Backoff {
                kind: BackoffKind::Fixed,
                delay_ms: 1000,
            },
        };
        let queue = InMemoryQueue::new(config);
        queue
            .enqueue(Lane::Splits, request(), with_id("flaky"))
            .await
            .unwrap();

        let handle = queue.next(Lane::Splits).await.unwrap();
        assert_eq!(handle.fail("store unreachable"), Some(JobState::Delayed));

        let handle = queue.next(Lane::Splits).await.unwrap();
        assert_eq!(handle.fail("store unreachable"), Some(JobState::Failed));

        let job = queue.get_job(Lane::Splits, "flaky").await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 2);
        assert_eq!(job.failed_reason.as_deref(), Some("store unreachable"));
    }

    #[tokio::test]
    async fn test_progress_reports_reach_job() {
        let queue = InMemoryQueue::default();
        queue
            .enqueue(Lane::Payments, request(), with_id("job-1"))
            .await
            .unwrap();
        let handle = queue.next(Lane::Payments).await.unwrap();
        handle.progress(40).await.unwrap();

        let job = queue
            .get_job(Lane::Payments, "job-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.progress, 40);
        assert_eq!(job.state, JobState::Active);
    }
}
