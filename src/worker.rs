//! Queue consumer that feeds execution jobs to the executor.
//!
//! One consumer loop runs per lane. Each loop takes the next runnable job, executes
//! the batch and reports the outcome back to the queue, which decides whether a
//! failed job is tried again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, VolleyError};
use crate::executor::ChunkedExecutor;
use crate::manager::Storage;
use crate::queue::{InMemoryQueue, JobState, Lane};

/// Get the hostname of the current machine.
pub fn get_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Counters shared by all lane loops of a worker.
#[derive(Debug, Default)]
pub struct WorkerStats {
    jobs_in_flight: AtomicUsize,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
}

impl WorkerStats {
    pub fn in_flight(&self) -> usize {
        self.jobs_in_flight.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    /// Job runs that failed, including runs the queue will retry.
    pub fn failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }
}

/// Consumes execution jobs from an [`InMemoryQueue`].
pub struct Worker<S: Storage> {
    queue: InMemoryQueue,
    executor: Arc<ChunkedExecutor<S>>,
    lanes: Vec<Lane>,
    stats: Arc<WorkerStats>,
    shutdown_token: CancellationToken,
}

impl<S: Storage + 'static> Worker<S> {
    /// A worker consuming every lane.
    pub fn new(
        queue: InMemoryQueue,
        executor: Arc<ChunkedExecutor<S>>,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            queue,
            executor,
            lanes: Lane::ALL.to_vec(),
            stats: Arc::new(WorkerStats::default()),
            shutdown_token,
        }
    }

    /// Restrict the worker to `lanes`.
    pub fn with_lanes(mut self, lanes: impl IntoIterator<Item = Lane>) -> Self {
        self.lanes = lanes.into_iter().collect();
        self
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Run until the shutdown token is cancelled.
    ///
    /// A job already executing when shutdown is requested runs to completion.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tracing::info!(
            hostname = %get_hostname(),
            pid = std::process::id(),
            lanes = ?self.lanes,
            "Worker starting"
        );

        let mut join_set: JoinSet<()> = JoinSet::new();
        for lane in self.lanes.iter().copied() {
            let worker = self.clone();
            join_set.spawn(async move { worker.consume(lane).await });
        }

        while let Some(result) = join_set.join_next().await {
            if let Err(join_error) = result {
                tracing::error!(error = %join_error, "Lane consumer panicked");
            }
        }

        tracing::info!(
            completed = self.stats.completed(),
            failed = self.stats.failed(),
            "Worker stopped"
        );
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(lane = %lane))]
    async fn consume(&self, lane: Lane) {
        loop {
            let handle = tokio::select! {
                next = self.queue.next(lane) => match next {
                    Ok(handle) => handle,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to take next job");
                        break;
                    }
                },
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Shutdown signal received, stopping lane consumer");
                    break;
                }
            };

            let request = handle.request();
            let attempt = handle.job().attempts_made + 1;
            tracing::debug!(batch_id = %request.batch_id, attempt, "Executing job");

            self.stats.jobs_in_flight.fetch_add(1, Ordering::Relaxed);
            let stats = self.stats.clone();
            let _guard = scopeguard::guard((), move |_| {
                stats.jobs_in_flight.fetch_sub(1, Ordering::Relaxed);
            });

            match self.executor.execute(request, &handle).await {
                Ok(summary) => {
                    tracing::info!(
                        batch_id = %request.batch_id,
                        completed = summary.completed,
                        failed = summary.failed,
                        cancelled = summary.cancelled,
                        "Job completed"
                    );
                    handle.complete();
                    self.stats.jobs_completed.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_execution(lane, "completed");
                }
                Err(VolleyError::BatchNotFound(batch_id)) => {
                    // Nothing left to execute; retrying would not help
                    tracing::warn!(batch_id = %batch_id, "Batch not found, discarding job");
                    handle.complete();
                    crate::metrics::record_execution(lane, "discarded");
                }
                Err(e) => {
                    let reason = e.to_string();
                    let error_kind = e.kind();
                    self.stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_execution(lane, "failed");
                    match handle.fail(&reason) {
                        Some(JobState::Delayed) => tracing::warn!(
                            batch_id = %request.batch_id,
                            attempt,
                            error_kind,
                            error = %reason,
                            "Job failed, will be retried"
                        ),
                        Some(_) => tracing::error!(
                            batch_id = %request.batch_id,
                            attempt,
                            error_kind,
                            error = %reason,
                            "Job failed, attempts exhausted"
                        ),
                        None => tracing::debug!(
                            batch_id = %request.batch_id,
                            "Job was superseded before its failure was recorded"
                        ),
                    }
                }
            }
        }
    }
}
