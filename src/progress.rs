//! Progress aggregation.
//!
//! Batch counters are never incremented in place: every recompute reads all of a
//! batch's operations and derives the counters, percentage and status from
//! scratch. [`recompute`] is the pure part; [`ProgressTracker`] loads, persists and
//! publishes around it, and owns the per-operation status transitions the executor
//! drives.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::batch::{
    Batch, BatchId, BatchPatch, BatchRecord, BatchStatus, BatchStatusView, Operation,
    OperationId, OperationOutput, OperationPatch, OperationStatus,
};
use crate::error::{OperationError, Result};
use crate::events::{BatchEvent, BatchEventKind, EventPublisher};
use crate::manager::Storage;

/// Re-reads allowed when the batch status changes between read and write.
const STATUS_RACE_RETRIES: usize = 3;

/// Result of a recompute: the batch as it should now be stored, the patch that
/// gets it there, and the status change if there was one.
#[derive(Debug, Clone)]
pub struct Recomputed {
    pub batch: Batch,
    pub patch: BatchPatch,
    pub transition: Option<(BatchStatus, BatchStatus)>,
}

/// Derive counters and status of `batch` from its operations.
///
/// A `Cancelled` batch keeps its status; late outcomes only refresh its counters.
/// A batch that is already in the terminal status its operations imply is left
/// alone, so `completed_at` is stamped once.
pub fn recompute(batch: &Batch, operations: &[Operation], now: DateTime<Utc>) -> Recomputed {
    let mut completed = 0u64;
    let mut failed = 0u64;
    let mut in_flight = 0u64;
    for op in operations {
        match op.status {
            OperationStatus::Completed => completed += 1,
            OperationStatus::Failed => failed += 1,
            OperationStatus::Processing | OperationStatus::Retrying => in_flight += 1,
            OperationStatus::Pending | OperationStatus::Cancelled => {}
        }
    }

    let total = batch.total_operations;
    let mut patch = BatchPatch {
        completed_operations: Some(completed),
        failed_operations: Some(failed),
        progress_percent: Some(progress_percent(completed, total)),
        ..Default::default()
    };

    if batch.status != BatchStatus::Cancelled {
        if total > 0 && completed + failed >= total {
            let settled = if failed == 0 {
                BatchStatus::Completed
            } else if completed == 0 {
                BatchStatus::Failed
            } else {
                BatchStatus::Partial
            };
            if settled != batch.status {
                patch.status = Some(settled);
                patch.completed_at = Some(Some(now));
            }
        } else if in_flight > 0 && batch.status == BatchStatus::Pending {
            patch.status = Some(BatchStatus::Processing);
            if batch.started_at.is_none() {
                patch.started_at = Some(Some(now));
            }
        }
    }

    let transition = patch.status.map(|new| (batch.status, new));
    let mut updated = batch.clone();
    patch.apply(&mut updated);
    Recomputed {
        batch: updated,
        patch,
        transition,
    }
}

/// `round(completed / total * 100)`, 0 for an empty batch.
pub fn progress_percent(completed: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (completed as f64 / total as f64 * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}

/// Milliseconds between `started_at` and `completed_at` (or `now` while running),
/// at least 1.
fn elapsed_ms(batch: &Batch, now: DateTime<Utc>) -> Option<f64> {
    let started = batch.started_at?;
    let end = batch.completed_at.unwrap_or(now);
    let elapsed = (end - started).num_milliseconds().max(1);
    Some(elapsed as f64)
}

/// Estimated milliseconds until every remaining operation completes at the
/// observed rate. `None` before the batch starts or before anything completes.
pub fn estimated_time_remaining(batch: &Batch, now: DateTime<Utc>) -> Option<u64> {
    if batch.completed_operations == 0 {
        return None;
    }
    let elapsed = elapsed_ms(batch, now)?;
    let rate_per_ms = batch.completed_operations as f64 / elapsed;
    let remaining = batch
        .total_operations
        .saturating_sub(batch.completed_operations);
    Some((remaining as f64 / rate_per_ms).round() as u64)
}

/// Completed operations per second, rounded to two decimals.
pub fn processing_rate(batch: &Batch, now: DateTime<Utc>) -> Option<f64> {
    if batch.completed_operations == 0 {
        return None;
    }
    let elapsed_secs = elapsed_ms(batch, now)? / 1000.0;
    let rate = batch.completed_operations as f64 / elapsed_secs;
    Some((rate * 100.0).round() / 100.0)
}

pub fn progress_message(batch: &Batch) -> String {
    match batch.status {
        BatchStatus::Pending => "Waiting to start".to_string(),
        BatchStatus::Processing => format!(
            "Processing: {}/{} completed",
            batch.completed_operations, batch.total_operations
        ),
        BatchStatus::Completed => "All operations completed successfully".to_string(),
        BatchStatus::Failed => "All operations failed".to_string(),
        BatchStatus::Partial => format!(
            "{} completed, {} failed",
            batch.completed_operations, batch.failed_operations
        ),
        BatchStatus::Cancelled => "Batch cancelled".to_string(),
    }
}

/// Build the read-side view of a batch. ETA and rate are derived here, never stored.
pub fn status_view(record: BatchRecord, now: DateTime<Utc>) -> BatchStatusView {
    let BatchRecord { batch, operations } = record;
    BatchStatusView {
        message: progress_message(&batch),
        estimated_time_remaining_ms: estimated_time_remaining(&batch, now),
        processing_rate: processing_rate(&batch, now),
        operations: operations.map(|ops| ops.iter().map(Operation::summary).collect()),
        batch,
    }
}

/// What happened to an operation after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDisposition {
    /// Moved to `Retrying`; the executor should back off and try again
    Retry(Operation),
    /// Terminally `Failed`
    Failed(Operation),
    /// Cancelled while the attempt was running; nothing recorded
    Cancelled,
}

/// Applies operation transitions and keeps batch aggregates current.
pub struct ProgressTracker<S: Storage> {
    storage: Arc<S>,
    publisher: Arc<dyn EventPublisher>,
    /// Serializes recomputes per batch
    locks: DashMap<BatchId, Arc<tokio::sync::Mutex<()>>>,
}

impl<S: Storage> ProgressTracker<S> {
    pub fn new(storage: Arc<S>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            storage,
            publisher,
            locks: DashMap::new(),
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn publisher(&self) -> &Arc<dyn EventPublisher> {
        &self.publisher
    }

    /// Recompute and persist the batch aggregates, then publish.
    ///
    /// `batch.progress` goes out on every call; `batch.completed` and `batch.failed`
    /// only on the recompute that moves the batch into that status.
    #[tracing::instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn update_progress(&self, batch_id: BatchId) -> Result<Batch> {
        let lock = self.locks.entry(batch_id).or_default().clone();
        let guard = lock.lock().await;

        let result = self.recompute_and_publish(batch_id).await;

        drop(guard);
        drop(lock);
        self.locks
            .remove_if(&batch_id, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn recompute_and_publish(&self, batch_id: BatchId) -> Result<Batch> {
        // Cancel and retry write the status outside this lock; only overwrite the
        // status the recompute was derived from.
        let mut attempts = 0;
        let (batch, transition) = loop {
            let record = self.storage.get_batch(batch_id, true).await?;
            let seen = record.batch.status;
            let operations = record.operations.unwrap_or_default();
            let recomputed = recompute(&record.batch, &operations, Utc::now());

            match self
                .storage
                .transition_batch(batch_id, &[seen], recomputed.patch)
                .await?
            {
                Some(batch) => break (batch, recomputed.transition),
                None if attempts < STATUS_RACE_RETRIES => {
                    attempts += 1;
                    tracing::debug!(seen = %seen, "Batch status changed during recompute");
                }
                None => {
                    tracing::warn!(attempts, "Batch status kept changing, skipping recompute");
                    return Ok(self.storage.get_batch(batch_id, false).await?.batch);
                }
            }
        };

        self.publisher.publish(
            BatchEvent::from_batch(BatchEventKind::Progress, &batch)
                .with_message(progress_message(&batch)),
        );
        tracing::debug!(
            progress = batch.progress_percent,
            completed = batch.completed_operations,
            failed = batch.failed_operations,
            status = %batch.status,
            "Batch progress updated"
        );

        if let Some((from, to)) = transition {
            tracing::info!(from = %from, to = %to, "Batch status changed");
            if to.is_terminal() {
                crate::metrics::record_batch_finished(batch.kind, to);
            }
            let terminal_event = match to {
                BatchStatus::Completed => Some(BatchEventKind::Completed),
                BatchStatus::Failed => Some(BatchEventKind::Failed),
                _ => None,
            };
            if let Some(kind) = terminal_event {
                self.publisher.publish(
                    BatchEvent::from_batch(kind, &batch).with_message(progress_message(&batch)),
                );
            }
        }

        Ok(batch)
    }

    /// Claim an operation for an attempt: `Pending | Retrying -> Processing`.
    ///
    /// Returns `None` when the operation is no longer claimable (cancelled, or
    /// already taken).
    pub async fn mark_started(&self, operation_id: OperationId) -> Result<Option<Operation>> {
        self.storage
            .transition_operation(
                operation_id,
                &[OperationStatus::Pending, OperationStatus::Retrying],
                OperationPatch {
                    status: Some(OperationStatus::Processing),
                    started_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await
    }

    /// Record a successful attempt and recompute the batch.
    pub async fn mark_completed(
        &self,
        operation: &Operation,
        output: OperationOutput,
    ) -> Result<Operation> {
        let updated = self
            .storage
            .update_operation(
                operation.id,
                OperationPatch {
                    status: Some(OperationStatus::Completed),
                    result: Some(Some(output)),
                    error_message: Some(None),
                    error_code: Some(None),
                    completed_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        self.update_progress(operation.batch_id).await?;
        Ok(updated)
    }

    /// Record a failed attempt and recompute the batch.
    ///
    /// A retriable failure moves the operation to `Retrying` and increments
    /// `retry_count`, as long as `retry_count + 1` is below `max_attempts`. Anything
    /// else is terminal `Failed` with `completed_at` stamped and `retry_count` left
    /// as is.
    pub async fn mark_failed(
        &self,
        operation: &Operation,
        error: &OperationError,
        max_attempts: u32,
    ) -> Result<FailureDisposition> {
        let retry_count = operation.retry_count.saturating_add(1);
        let retry = error.retriable && retry_count < max_attempts;

        let mut patch = OperationPatch {
            error_message: Some(Some(error.message.clone())),
            error_code: Some(Some(error.code_or_default().to_string())),
            ..Default::default()
        };

        let disposition = if retry {
            patch.status = Some(OperationStatus::Retrying);
            patch.retry_count = Some(retry_count);
            match self
                .storage
                .transition_operation(operation.id, &[OperationStatus::Processing], patch)
                .await?
            {
                Some(op) => FailureDisposition::Retry(op),
                None => return Ok(FailureDisposition::Cancelled),
            }
        } else {
            patch.status = Some(OperationStatus::Failed);
            patch.completed_at = Some(Some(Utc::now()));
            FailureDisposition::Failed(self.storage.update_operation(operation.id, patch).await?)
        };

        self.update_progress(operation.batch_id).await?;
        Ok(disposition)
    }
}
