//! Chunked, bounded-concurrency execution of a batch.
//!
//! A batch's pending operations are split into chunks that run one after another.
//! Inside a chunk a sliding window admits operations in index order: at most
//! `concurrency` run at once, and each one that settles frees a slot for the next.
//! Operation failures are absorbed (recorded on the operation); only failures of the
//! executor's own bookkeeping abort the run.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::batch::{
    BatchId, BatchKind, BatchPatch, BatchStatus, Operation, OperationFilter, OperationPatch,
    OperationStatus,
};
use crate::config::ExecutorConfig;
use crate::error::{Result, VolleyError};
use crate::events::{BatchEvent, BatchEventKind};
use crate::handler::{HandlerRegistry, OperationHandler};
use crate::manager::Storage;
use crate::progress::{self, FailureDisposition, ProgressTracker};
use crate::queue::{ExecutionRequest, JobProgress};

/// What one execution run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    pub batch_id: BatchId,
    /// Operations found `Pending` when the run started
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    /// Operations that could not be claimed (cancelled meanwhile)
    pub skipped: usize,
    pub chunks: usize,
    /// Stopped early because the batch was cancelled
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationOutcome {
    Completed,
    Failed,
    Skipped,
}

/// Executes batches on behalf of queue consumers.
pub struct ChunkedExecutor<S: Storage> {
    storage: Arc<S>,
    tracker: Arc<ProgressTracker<S>>,
    handlers: HandlerRegistry,
    config: ExecutorConfig,
    operations_in_flight: Arc<AtomicUsize>,
    operations_completed: Arc<AtomicU64>,
    operations_failed: Arc<AtomicU64>,
}

impl<S: Storage + 'static> ChunkedExecutor<S> {
    pub fn new(
        tracker: Arc<ProgressTracker<S>>,
        handlers: HandlerRegistry,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            storage: tracker.storage().clone(),
            tracker,
            handlers,
            config,
            operations_in_flight: Arc::new(AtomicUsize::new(0)),
            operations_completed: Arc::new(AtomicU64::new(0)),
            operations_failed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Operations currently between claim and outcome.
    pub fn in_flight(&self) -> usize {
        self.operations_in_flight.load(Ordering::Relaxed)
    }

    /// Operations completed since this executor was created.
    pub fn completed_total(&self) -> u64 {
        self.operations_completed.load(Ordering::Relaxed)
    }

    /// Operations that failed terminally since this executor was created.
    pub fn failed_total(&self) -> u64 {
        self.operations_failed.load(Ordering::Relaxed)
    }

    /// Run every `Pending` operation of the requested batch.
    ///
    /// # Errors
    /// `BatchNotFound` if the batch does not exist. Any other failure of the run
    /// itself puts operations left `Processing` or `Retrying` back to `Pending`,
    /// marks the batch `Failed`, publishes `batch.failed` and is returned as
    /// `FatalExecution`, so a redelivered job picks those operations up again.
    #[tracing::instrument(skip(self, request, progress), fields(batch_id = %request.batch_id))]
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        progress: &dyn JobProgress,
    ) -> Result<ExecutionSummary> {
        let batch_id = request.batch_id;
        match self.run(request, progress).await {
            Ok(summary) => Ok(summary),
            Err(VolleyError::BatchNotFound(id)) => Err(VolleyError::BatchNotFound(id)),
            Err(e) => {
                let message = e.to_string();
                tracing::error!(error = %message, "Batch execution failed");
                self.release_stranded(batch_id).await;
                self.fail_batch(batch_id, &message).await;
                Err(VolleyError::FatalExecution { batch_id, message })
            }
        }
    }

    async fn run(
        &self,
        request: ExecutionRequest,
        progress: &dyn JobProgress,
    ) -> Result<ExecutionSummary> {
        let batch_id = request.batch_id;
        let mut summary = ExecutionSummary {
            batch_id,
            ..Default::default()
        };

        let batch = self.storage.get_batch(batch_id, false).await?.batch;
        if batch.status == BatchStatus::Cancelled {
            tracing::info!("Batch is cancelled, nothing to execute");
            summary.cancelled = true;
            return Ok(summary);
        }

        let handler = self.handlers.get(batch.kind).ok_or_else(|| {
            VolleyError::Other(anyhow::anyhow!(
                "No handler registered for batch kind {}",
                batch.kind
            ))
        })?;

        let pending = self
            .storage
            .find_operations(
                &OperationFilter::for_batch(batch_id).with_status(OperationStatus::Pending),
            )
            .await?;
        if pending.is_empty() {
            tracing::warn!("No pending operations for batch");
            return Ok(summary);
        }
        summary.pending = pending.len();

        let started = self
            .storage
            .transition_batch(
                batch_id,
                &BatchStatus::RUNNABLE,
                BatchPatch {
                    status: Some(BatchStatus::Processing),
                    error_message: Some(None),
                    completed_at: Some(None),
                    started_at: batch.started_at.is_none().then(|| Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        if started.is_none() {
            tracing::info!("Batch left a runnable status before execution started");
            summary.cancelled = self.is_cancelled(batch_id).await?;
            return Ok(summary);
        }

        let chunk_size = request.chunk_size.max(1);
        let concurrency = request.concurrency.max(1);
        let max_attempts = batch
            .options
            .retry_attempts
            .unwrap_or(self.config.max_operation_retries);
        let chunk_count = pending.len().div_ceil(chunk_size);

        tracing::info!(
            kind = %batch.kind,
            pending = pending.len(),
            chunk_size,
            concurrency,
            "Starting batch execution"
        );

        let mut processed = 0usize;
        for (chunk_index, chunk) in pending.chunks(chunk_size).enumerate() {
            if chunk_index > 0 && self.is_cancelled(batch_id).await? {
                tracing::info!(
                    chunks_done = chunk_index,
                    "Batch cancelled, not admitting further chunks"
                );
                summary.cancelled = true;
                break;
            }

            tracing::debug!(
                chunk = chunk_index + 1,
                of = chunk_count,
                size = chunk.len(),
                "Processing chunk"
            );

            let outcomes = self
                .process_chunk(batch.kind, chunk, &handler, concurrency, max_attempts)
                .await?;
            for outcome in outcomes {
                match outcome {
                    OperationOutcome::Completed => summary.completed += 1,
                    OperationOutcome::Failed => summary.failed += 1,
                    OperationOutcome::Skipped => summary.skipped += 1,
                }
            }

            summary.chunks += 1;
            processed += chunk.len();
            progress
                .progress(progress::progress_percent(
                    processed as u64,
                    pending.len() as u64,
                ))
                .await?;
        }

        tracing::info!(
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            "Batch execution finished"
        );
        Ok(summary)
    }

    async fn is_cancelled(&self, batch_id: BatchId) -> Result<bool> {
        let batch = self.storage.get_batch(batch_id, false).await?.batch;
        Ok(batch.status == BatchStatus::Cancelled)
    }

    /// Run one chunk with a sliding window of `concurrency` slots. Admission follows
    /// index order; completion order is whatever the handler produces.
    ///
    /// A bookkeeping error inside any task stops further admission; the tasks
    /// already running are drained before the error is returned.
    async fn process_chunk(
        &self,
        kind: BatchKind,
        chunk: &[Operation],
        handler: &Arc<dyn OperationHandler>,
        concurrency: usize,
        max_attempts: u32,
    ) -> Result<Vec<OperationOutcome>> {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut join_set: JoinSet<Result<OperationOutcome>> = JoinSet::new();
        let mut outcomes = Vec::with_capacity(chunk.len());
        let mut first_error: Option<VolleyError> = None;

        for operation in chunk {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to acquire execution slot: {}", e))?;

            while let Some(result) = join_set.try_join_next() {
                collect_outcome(result, &mut outcomes, &mut first_error);
            }
            if first_error.is_some() {
                break;
            }

            let tracker = self.tracker.clone();
            let handler = handler.clone();
            let config = self.config.clone();
            let operation = operation.clone();
            let operations_in_flight = self.operations_in_flight.clone();
            let operations_completed = self.operations_completed.clone();
            let operations_failed = self.operations_failed.clone();

            operations_in_flight.fetch_add(1, Ordering::Relaxed);
            join_set.spawn(async move {
                // Slot is held until the operation settles, retries included
                let _permit = permit;
                let _guard = scopeguard::guard((), |_| {
                    operations_in_flight.fetch_sub(1, Ordering::Relaxed);
                });

                let outcome =
                    process_operation(&tracker, handler, operation, kind, max_attempts, &config)
                        .await?;
                match outcome {
                    OperationOutcome::Completed => {
                        operations_completed.fetch_add(1, Ordering::Relaxed);
                    }
                    OperationOutcome::Failed => {
                        operations_failed.fetch_add(1, Ordering::Relaxed);
                    }
                    OperationOutcome::Skipped => {}
                }
                Ok(outcome)
            });
        }

        while let Some(result) = join_set.join_next().await {
            collect_outcome(result, &mut outcomes, &mut first_error);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    /// Put operations claimed by the aborted run back to `Pending`. Best effort, like
    /// `fail_batch`.
    async fn release_stranded(&self, batch_id: BatchId) {
        let patch = OperationPatch {
            status: Some(OperationStatus::Pending),
            started_at: Some(None),
            ..Default::default()
        };
        match self
            .storage
            .bulk_transition_operations(
                batch_id,
                &[OperationStatus::Processing, OperationStatus::Retrying],
                patch,
            )
            .await
        {
            Ok(0) => {}
            Ok(released) => tracing::warn!(released, "Released operations of aborted run"),
            Err(e) => tracing::error!(error = %e, "Failed to release operations of aborted run"),
        }
    }

    /// Mark the batch `Failed` after a fatal error and announce it. Best effort: the
    /// original error is what gets reported. A batch that was cancelled or already
    /// finished keeps its status.
    async fn fail_batch(&self, batch_id: BatchId, message: &str) {
        let patch = BatchPatch {
            status: Some(BatchStatus::Failed),
            error_message: Some(Some(message.to_string())),
            completed_at: Some(Some(Utc::now())),
            ..Default::default()
        };
        match self
            .storage
            .transition_batch(batch_id, &BatchStatus::RUNNABLE, patch)
            .await
        {
            Ok(None) => {
                tracing::info!("Batch is no longer running, not marking it failed");
            }
            Ok(Some(batch)) => {
                crate::metrics::record_batch_finished(batch.kind, BatchStatus::Failed);
                self.tracker.publisher().publish(
                    BatchEvent::from_batch(BatchEventKind::Failed, &batch).with_error(message),
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to mark batch as failed");
            }
        }
    }
}

fn collect_outcome(
    result: std::result::Result<Result<OperationOutcome>, tokio::task::JoinError>,
    outcomes: &mut Vec<OperationOutcome>,
    first_error: &mut Option<VolleyError>,
) {
    let error = match result {
        Ok(Ok(outcome)) => {
            outcomes.push(outcome);
            return;
        }
        Ok(Err(e)) => e,
        Err(join_error) => {
            VolleyError::Other(anyhow::anyhow!("Operation task panicked: {}", join_error))
        }
    };
    tracing::error!(error = %error, "Operation bookkeeping failed");
    first_error.get_or_insert(error);
}

/// Drive one operation to an outcome: claim, validate, execute, record, and retry
/// in place while the failure is retriable and attempts remain.
async fn process_operation<S: Storage>(
    tracker: &ProgressTracker<S>,
    handler: Arc<dyn OperationHandler>,
    operation: Operation,
    kind: BatchKind,
    max_attempts: u32,
    config: &ExecutorConfig,
) -> Result<OperationOutcome> {
    let operation_id = operation.id;
    loop {
        let Some(claimed) = tracker.mark_started(operation_id).await? else {
            tracing::debug!(operation_id = %operation_id, "Operation no longer claimable, skipping");
            return Ok(OperationOutcome::Skipped);
        };

        crate::metrics::operation_started(kind);
        let settled = scopeguard::guard((), |_| crate::metrics::operation_settled(kind));
        let started = Instant::now();

        let attempt = match claimed.payload.validate() {
            Ok(()) => handler.execute(&claimed).await,
            Err(e) => Err(e),
        };
        let elapsed = started.elapsed();
        drop(settled);

        let error = match attempt {
            Ok(output) => {
                tracker.mark_completed(&claimed, output).await?;
                crate::metrics::record_operation_outcome(kind, OperationStatus::Completed, elapsed);
                tracing::debug!(
                    operation_id = %operation_id,
                    index = claimed.index,
                    "Operation completed"
                );
                return Ok(OperationOutcome::Completed);
            }
            Err(error) => error,
        };

        match tracker.mark_failed(&claimed, &error, max_attempts).await? {
            FailureDisposition::Retry(retrying) => {
                crate::metrics::record_operation_outcome(kind, OperationStatus::Retrying, elapsed);
                crate::metrics::record_operation_retry(kind);
                let backoff = config.retry_backoff(retrying.retry_count.saturating_sub(1));
                tracing::warn!(
                    operation_id = %operation_id,
                    index = claimed.index,
                    retry_count = retrying.retry_count,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "Operation failed with retriable error, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            FailureDisposition::Failed(_) => {
                crate::metrics::record_operation_outcome(kind, OperationStatus::Failed, elapsed);
                tracing::warn!(
                    operation_id = %operation_id,
                    index = claimed.index,
                    code = error.code_or_default(),
                    error = %error,
                    retriable = error.retriable,
                    "Operation failed"
                );
                return Ok(OperationOutcome::Failed);
            }
            FailureDisposition::Cancelled => {
                tracing::debug!(operation_id = %operation_id, "Operation cancelled during attempt");
                return Ok(OperationOutcome::Skipped);
            }
        }
    }
}
