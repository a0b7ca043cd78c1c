//! Public API of the batching system.
//!
//! The orchestrator persists batches, hands them to the queue and serves status
//! reads. It never executes operations itself; that is the executor's job, driven
//! by whatever consumes the queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::batch::{
    Batch, BatchFilter, BatchId, BatchKind, BatchList, BatchOptions, BatchPatch, BatchStatus,
    BatchStatusView, Operation, OperationFilter, OperationId, OperationPatch, OperationPayload,
    OperationStatus, PaymentPayload, ScheduledTaskPayload, ScheduledTaskType, SplitPayload,
};
use crate::config::ExecutorConfig;
use crate::error::{Result, VolleyError};
use crate::manager::Storage;
use crate::progress;
use crate::queue::{EnqueueOptions, ExecutionRequest, JobQueue};

/// Page size used when the caller does not pick one.
pub const DEFAULT_PAGE_LIMIT: u32 = 50;

/// Creates, inspects, retries and cancels batches.
pub struct BatchOrchestrator<S: Storage, Q: JobQueue> {
    storage: Arc<S>,
    queue: Arc<Q>,
    config: ExecutorConfig,
}

impl<S: Storage, Q: JobQueue> BatchOrchestrator<S, Q> {
    pub fn new(storage: Arc<S>, queue: Arc<Q>, config: ExecutorConfig) -> Self {
        Self {
            storage,
            queue,
            config,
        }
    }

    /// Persist a batch of `items` and enqueue it for execution.
    ///
    /// Operations get indices `0..items.len()` in input order. Every item must be of
    /// `kind`; nothing is persisted if any check fails.
    #[tracing::instrument(skip(self, items, options), fields(kind = %kind, items = items.len()))]
    pub async fn create_batch(
        &self,
        kind: BatchKind,
        items: Vec<OperationPayload>,
        options: BatchOptions,
    ) -> Result<BatchStatusView> {
        if items.is_empty() {
            return Err(VolleyError::InvalidArgument(format!(
                "No items provided for {} batch",
                kind
            )));
        }
        options.validate()?;
        if let Some((index, item)) = items
            .iter()
            .enumerate()
            .find(|(_, item)| item.kind() != kind)
        {
            return Err(VolleyError::InvalidArgument(format!(
                "Item {} is a {} payload, expected {}",
                index,
                item.kind(),
                kind
            )));
        }

        let batch = self
            .storage
            .create_batch(Batch::new(kind, items.len() as u64, options))
            .await?;
        self.storage.create_operations(batch.id, items).await?;

        let job = self.enqueue(&batch, true).await?;

        tracing::info!(
            batch_id = %batch.id,
            total_operations = batch.total_operations,
            lane = %job.lane,
            "Created batch"
        );

        self.get_batch_status(batch.id).await
    }

    /// Create a batch of splits.
    pub async fn create_split_batch(
        &self,
        splits: Vec<SplitPayload>,
        options: BatchOptions,
    ) -> Result<BatchStatusView> {
        let items = splits.into_iter().map(OperationPayload::from).collect();
        self.create_batch(BatchKind::SplitCreation, items, options)
            .await
    }

    /// Create a batch of payments.
    pub async fn create_payment_batch(
        &self,
        payments: Vec<PaymentPayload>,
        options: BatchOptions,
    ) -> Result<BatchStatusView> {
        let items = payments.into_iter().map(OperationPayload::from).collect();
        self.create_batch(BatchKind::PaymentProcessing, items, options)
            .await
    }

    /// Create a single-operation batch that runs a scheduled maintenance task.
    pub async fn create_scheduled_task(
        &self,
        task_type: ScheduledTaskType,
        params: serde_json::Map<String, serde_json::Value>,
        options: BatchOptions,
    ) -> Result<BatchStatusView> {
        let item = OperationPayload::ScheduledTask(ScheduledTaskPayload { task_type, params });
        self.create_batch(BatchKind::ScheduledTask, vec![item], options)
            .await
    }

    /// Current state of a batch with per-operation summaries, ETA and rate.
    pub async fn get_batch_status(&self, batch_id: BatchId) -> Result<BatchStatusView> {
        let record = self.storage.get_batch(batch_id, true).await?;
        Ok(progress::status_view(record, Utc::now()))
    }

    /// One page (1-based) of batches, newest first, optionally filtered by status.
    pub async fn list_batches(
        &self,
        page: u32,
        limit: u32,
        status: Option<BatchStatus>,
    ) -> Result<BatchList> {
        if page == 0 {
            return Err(VolleyError::InvalidArgument(
                "page must be at least 1".to_string(),
            ));
        }
        if limit == 0 {
            return Err(VolleyError::InvalidArgument(
                "limit must be at least 1".to_string(),
            ));
        }

        let filter = BatchFilter { status, kind: None };
        let (batches, total) = self.storage.list_batches(&filter, page, limit).await?;
        let now = Utc::now();
        Ok(BatchList {
            batches: batches
                .into_iter()
                .map(|batch| {
                    progress::status_view(
                        crate::batch::BatchRecord {
                            batch,
                            operations: None,
                        },
                        now,
                    )
                })
                .collect(),
            total,
            page,
            limit,
        })
    }

    /// Operations of a batch ordered by index, optionally filtered by status.
    pub async fn list_operations(
        &self,
        batch_id: BatchId,
        status: Option<OperationStatus>,
    ) -> Result<Vec<Operation>> {
        // Surface NotFound rather than an empty list
        self.storage.get_batch(batch_id, false).await?;

        let mut filter = OperationFilter::for_batch(batch_id);
        if let Some(status) = status {
            filter = filter.with_status(status);
        }
        self.storage.find_operations(&filter).await
    }

    /// Reset `Failed` operations to `Pending` and enqueue the batch again.
    ///
    /// Only `Failed` and `Partial` batches can be retried. With `operation_ids`, only
    /// those operations are considered; ids that are not failed operations of this
    /// batch are ignored. Completed operations are never touched. Each reset
    /// operation's `retry_count` goes up by one; a terminal failure itself does not
    /// count, so it reads as the number of retries granted.
    ///
    /// # Errors
    /// `BatchNotFound`, or `InvalidState` when the batch is not retryable or there is
    /// nothing to retry.
    #[tracing::instrument(skip(self, operation_ids), fields(batch_id = %batch_id))]
    pub async fn retry_failed_operations(
        &self,
        batch_id: BatchId,
        operation_ids: Option<Vec<OperationId>>,
    ) -> Result<BatchStatusView> {
        let batch = self.storage.get_batch(batch_id, false).await?.batch;
        if !batch.status.is_retryable() {
            return Err(VolleyError::InvalidState {
                batch_id,
                status: batch.status,
                reason: "Only failed or partial batches can be retried".to_string(),
            });
        }

        let mut filter =
            OperationFilter::for_batch(batch_id).with_status(OperationStatus::Failed);
        if let Some(ids) = operation_ids.filter(|ids| !ids.is_empty()) {
            filter = filter.with_ids(ids);
        }
        let failed = self.storage.find_operations(&filter).await?;
        if failed.is_empty() {
            return Err(VolleyError::InvalidState {
                batch_id,
                status: batch.status,
                reason: "No failed operations to retry".to_string(),
            });
        }

        let reopened = self
            .storage
            .transition_batch(
                batch_id,
                &[batch.status],
                BatchPatch {
                    status: Some(BatchStatus::Pending),
                    error_message: Some(None),
                    completed_at: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        if reopened.is_none() {
            let current = self.storage.get_batch(batch_id, false).await?.batch;
            return Err(VolleyError::InvalidState {
                batch_id,
                status: current.status,
                reason: "Batch changed status during retry".to_string(),
            });
        }

        let mut reset = 0usize;
        for op in &failed {
            let patch = OperationPatch {
                status: Some(OperationStatus::Pending),
                error_message: Some(None),
                error_code: Some(None),
                completed_at: Some(None),
                retry_count: Some(op.retry_count.saturating_add(1)),
                ..Default::default()
            };
            if self
                .storage
                .transition_operation(op.id, &[OperationStatus::Failed], patch)
                .await?
                .is_some()
            {
                reset += 1;
            }
        }

        let operations = self
            .storage
            .find_operations(&OperationFilter::for_batch(batch_id))
            .await?;
        let completed = operations
            .iter()
            .filter(|op| op.status == OperationStatus::Completed)
            .count() as u64;
        let failed_count = operations
            .iter()
            .filter(|op| op.status == OperationStatus::Failed)
            .count() as u64;

        // Counters only; a cancel that landed meanwhile keeps the batch cancelled
        let counters = BatchPatch {
            completed_operations: Some(completed),
            failed_operations: Some(failed_count),
            progress_percent: Some(progress::progress_percent(
                completed,
                batch.total_operations,
            )),
            ..Default::default()
        };
        let Some(batch) = self
            .storage
            .transition_batch(batch_id, &[BatchStatus::Pending], counters)
            .await?
        else {
            tracing::info!("Batch was cancelled during retry, not enqueueing");
            return self.get_batch_status(batch_id).await;
        };

        self.enqueue(&batch, false).await?;

        tracing::info!(operations = reset, "Retrying failed operations");
        self.get_batch_status(batch_id).await
    }

    /// Cancel a batch that has not finished.
    ///
    /// A queued execution job is withdrawn when possible. Operations not yet settled
    /// become `Cancelled`; operations already running finish and their outcome is
    /// still recorded, but the batch stays `Cancelled`. The status change is
    /// conditional, so a batch that finished in the meantime is left alone.
    ///
    /// # Errors
    /// `BatchNotFound`, or `InvalidState` for `Completed`, `Failed` and already
    /// `Cancelled` batches.
    #[tracing::instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn cancel_batch(&self, batch_id: BatchId) -> Result<BatchStatusView> {
        let now = Utc::now();
        let cancelled = self
            .storage
            .transition_batch(
                batch_id,
                &BatchStatus::CANCELLABLE,
                BatchPatch {
                    status: Some(BatchStatus::Cancelled),
                    completed_at: Some(Some(now)),
                    ..Default::default()
                },
            )
            .await?;
        let Some(batch) = cancelled else {
            let current = self.storage.get_batch(batch_id, false).await?.batch;
            return Err(VolleyError::InvalidState {
                batch_id,
                status: current.status,
                reason: "Cannot cancel a completed, failed or cancelled batch".to_string(),
            });
        };
        crate::metrics::record_batch_finished(batch.kind, BatchStatus::Cancelled);

        let lane = batch.kind.lane();
        match self.queue.remove_job(lane, &batch_id.job_key()).await {
            Ok(true) => tracing::debug!(lane = %lane, "Removed queued execution job"),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(lane = %lane, error = %e, "Failed to remove queued execution job")
            }
        }

        let operations = self
            .storage
            .bulk_transition_operations(
                batch_id,
                &OperationStatus::CANCELLABLE,
                OperationPatch {
                    status: Some(OperationStatus::Cancelled),
                    completed_at: Some(Some(now)),
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(operations, "Cancelled batch");
        self.get_batch_status(batch_id).await
    }

    /// Enqueue the batch's execution job on its lane, keyed by the batch id.
    async fn enqueue(&self, batch: &Batch, with_delay: bool) -> Result<crate::queue::Job> {
        let request = ExecutionRequest {
            batch_id: batch.id,
            chunk_size: batch
                .options
                .chunk_size
                .unwrap_or(self.config.default_chunk_size),
            concurrency: batch
                .options
                .concurrency
                .unwrap_or(self.config.default_concurrency),
        };
        let options = EnqueueOptions {
            priority: batch.options.priority,
            delay: batch
                .options
                .delay_ms
                .filter(|_| with_delay)
                .map(Duration::from_millis),
            job_id: Some(batch.id.job_key()),
        };
        self.queue
            .enqueue(batch.kind.lane(), request, options)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Participant;
    use crate::manager::InMemoryStorage;
    use crate::queue::{InMemoryQueue, JobState, Lane};

    fn orchestrator() -> (
        BatchOrchestrator<InMemoryStorage, InMemoryQueue>,
        Arc<InMemoryStorage>,
        Arc<InMemoryQueue>,
    ) {
        let storage = Arc::new(InMemoryStorage::new());
        let queue = Arc::new(InMemoryQueue::default());
        (
            BatchOrchestrator::new(storage.clone(), queue.clone(), ExecutorConfig::default()),
            storage,
            queue,
        )
    }

    fn payment(i: usize) -> PaymentPayload {
        PaymentPayload {
            split_id: "split-7".to_string(),
            participant_id: format!("user-{}", i),
            stellar_tx_hash: format!("{:032x}", i),
        }
    }

    fn split() -> SplitPayload {
        SplitPayload {
            total_amount: 30.0,
            participants: vec![
                Participant {
                    user_id: "a".to_string(),
                    amount: 10.0,
                    wallet_address: None,
                },
                Participant {
                    user_id: "b".to_string(),
                    amount: 20.0,
                    wallet_address: Some("GABC".to_string()),
                },
            ],
            description: None,
            preferred_currency: Some("XLM".to_string()),
            creator_wallet_address: None,
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_create_persists_and_enqueues() {
        let (orchestrator, _storage, queue) = orchestrator();
        let view = orchestrator
            .create_payment_batch(
                (0..4).map(payment).collect(),
                BatchOptions {
                    chunk_size: Some(2),
                    priority: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(view.batch.status, BatchStatus::Pending);
        assert_eq!(view.batch.total_operations, 4);
        assert_eq!(view.message, "Waiting to start");
        let ops = view.operations.unwrap();
        assert_eq!(
            ops.iter().map(|op| op.index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );

        let job = queue
            .get_job(Lane::Payments, &view.batch.id.job_key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.priority, 3);
        assert_eq!(job.request.chunk_size, 2);
        assert_eq!(job.request.concurrency, 5, "falls back to the default");
    }

    #[test_log::test(tokio::test)]
    async fn test_create_rejects_bad_input_before_persisting() {
        let (orchestrator, storage, _queue) = orchestrator();

        let err = orchestrator
            .create_batch(BatchKind::SplitCreation, vec![], BatchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VolleyError::InvalidArgument(_)));

        let err = orchestrator
            .create_batch(
                BatchKind::SplitCreation,
                vec![split().into(), payment(0).into()],
                BatchOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Item 1"));

        let err = orchestrator
            .create_split_batch(
                vec![split()],
                BatchOptions {
                    chunk_size: Some(5000),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VolleyError::InvalidArgument(_)));

        assert_eq!(storage.batch_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_scheduled_task_uses_scheduled_lane() {
        let (orchestrator, _storage, queue) = orchestrator();
        let mut params = serde_json::Map::new();
        params.insert("retention_days".to_string(), serde_json::json!(30));

        let view = orchestrator
            .create_scheduled_task(
                ScheduledTaskType::CleanupOldBatches,
                params,
                BatchOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(view.batch.kind, BatchKind::ScheduledTask);
        assert_eq!(view.batch.total_operations, 1);
        assert_eq!(queue.queued_count(Lane::Scheduled), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_cancel_pending_batch() {
        let (orchestrator, _storage, queue) = orchestrator();
        let view = orchestrator
            .create_payment_batch((0..3).map(payment).collect(), BatchOptions::default())
            .await
            .unwrap();
        let batch_id = view.batch.id;

        let view = orchestrator.cancel_batch(batch_id).await.unwrap();
        assert_eq!(view.batch.status, BatchStatus::Cancelled);
        assert!(view.batch.completed_at.is_some());
        assert_eq!(view.message, "Batch cancelled");
        assert!(
            view.operations
                .unwrap()
                .iter()
                .all(|op| op.status == OperationStatus::Cancelled)
        );
        // Queued job was withdrawn
        assert!(
            queue
                .get_job(Lane::Payments, &batch_id.job_key())
                .await
                .unwrap()
                .is_none()
        );

        let err = orchestrator.cancel_batch(batch_id).await.unwrap_err();
        assert!(matches!(
            err,
            VolleyError::InvalidState {
                status: BatchStatus::Cancelled,
                ..
            }
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_cancel_rejects_finished_batches() {
        let (orchestrator, storage, _queue) = orchestrator();
        for status in [BatchStatus::Completed, BatchStatus::Failed] {
            let view = orchestrator
                .create_payment_batch(vec![payment(0)], BatchOptions::default())
                .await
                .unwrap();
            storage
                .update_batch(view.batch.id, BatchPatch::status(status))
                .await
                .unwrap();

            let err = orchestrator.cancel_batch(view.batch.id).await.unwrap_err();
            assert!(matches!(err, VolleyError::InvalidState { status: s, .. } if s == status));

            let ops = orchestrator
                .list_operations(view.batch.id, None)
                .await
                .unwrap();
            assert_eq!(ops[0].status, OperationStatus::Pending, "nothing touched");
        }
    }

    async fn fail_operation(storage: &InMemoryStorage, id: OperationId) {
        storage
            .update_operation(
                id,
                OperationPatch {
                    status: Some(OperationStatus::Failed),
                    error_message: Some(Some("declined".to_string())),
                    error_code: Some(Some("DECLINED".to_string())),
                    completed_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_cancel_does_not_overwrite_completion() {
        let (orchestrator, storage, _queue) = orchestrator();
        let view = orchestrator
            .create_payment_batch((0..2).map(payment).collect(), BatchOptions::default())
            .await
            .unwrap();
        let batch_id = view.batch.id;
        // The last operation settled and the batch finished just before the cancel
        storage
            .bulk_transition_operations(
                batch_id,
                &OperationStatus::CANCELLABLE,
                OperationPatch::status(OperationStatus::Completed),
            )
            .await
            .unwrap();
        storage
            .update_batch(
                batch_id,
                BatchPatch {
                    status: Some(BatchStatus::Completed),
                    completed_operations: Some(2),
                    completed_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = orchestrator.cancel_batch(batch_id).await.unwrap_err();
        assert!(matches!(
            err,
            VolleyError::InvalidState {
                status: BatchStatus::Completed,
                ..
            }
        ));
        let view = orchestrator.get_batch_status(batch_id).await.unwrap();
        assert_eq!(view.batch.status, BatchStatus::Completed);
        assert_eq!(view.batch.completed_operations, 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_retry_without_failures_is_invalid_state() {
        let (orchestrator, storage, _queue) = orchestrator();
        let view = orchestrator
            .create_payment_batch(vec![payment(0)], BatchOptions::default())
            .await
            .unwrap();
        storage
            .update_batch(view.batch.id, BatchPatch::status(BatchStatus::Failed))
            .await
            .unwrap();

        let err = orchestrator
            .retry_failed_operations(view.batch.id, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No failed operations to retry"));
    }

    #[test_log::test(tokio::test)]
    async fn test_retry_rejects_cancelled_batch() {
        let (orchestrator, storage, queue) = orchestrator();
        let view = orchestrator
            .create_payment_batch((0..3).map(payment).collect(), BatchOptions::default())
            .await
            .unwrap();
        let batch_id = view.batch.id;
        let ops = orchestrator.list_operations(batch_id, None).await.unwrap();
        fail_operation(&storage, ops[0].id).await;
        storage
            .update_batch(batch_id, BatchPatch::status(BatchStatus::Processing))
            .await
            .unwrap();
        orchestrator.cancel_batch(batch_id).await.unwrap();

        let err = orchestrator
            .retry_failed_operations(batch_id, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VolleyError::InvalidState {
                status: BatchStatus::Cancelled,
                ..
            }
        ));

        let view = orchestrator.get_batch_status(batch_id).await.unwrap();
        assert_eq!(view.batch.status, BatchStatus::Cancelled);
        let statuses: Vec<_> = view
            .operations
            .unwrap()
            .iter()
            .map(|op| op.status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                OperationStatus::Failed,
                OperationStatus::Cancelled,
                OperationStatus::Cancelled
            ]
        );
        assert_eq!(queue.queued_count(Lane::Payments), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_retry_rejects_running_batch() {
        let (orchestrator, storage, _queue) = orchestrator();
        let view = orchestrator
            .create_payment_batch((0..2).map(payment).collect(), BatchOptions::default())
            .await
            .unwrap();
        let batch_id = view.batch.id;
        let ops = orchestrator.list_operations(batch_id, None).await.unwrap();
        fail_operation(&storage, ops[0].id).await;
        storage
            .update_batch(batch_id, BatchPatch::status(BatchStatus::Processing))
            .await
            .unwrap();

        let err = orchestrator
            .retry_failed_operations(batch_id, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VolleyError::InvalidState {
                status: BatchStatus::Processing,
                ..
            }
        ));
        let ops = orchestrator.list_operations(batch_id, None).await.unwrap();
        assert_eq!(ops[0].status, OperationStatus::Failed, "nothing reset");
    }

    #[test_log::test(tokio::test)]
    async fn test_retry_resets_only_selected_failures() {
        let (orchestrator, storage, queue) = orchestrator();
        let view = orchestrator
            .create_payment_batch((0..3).map(payment).collect(), BatchOptions::default())
            .await
            .unwrap();
        let batch_id = view.batch.id;
        let ops = orchestrator.list_operations(batch_id, None).await.unwrap();

        // Simulate a finished run: op 0 completed, ops 1 and 2 failed
        storage
            .update_operation(ops[0].id, OperationPatch::status(OperationStatus::Completed))
            .await
            .unwrap();
        for op in &ops[1..] {
            fail_operation(&storage, op.id).await;
        }
        storage
            .update_batch(
                batch_id,
                BatchPatch {
                    status: Some(BatchStatus::Partial),
                    completed_operations: Some(1),
                    failed_operations: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        queue.try_next(Lane::Payments).unwrap();

        let view = orchestrator
            .retry_failed_operations(batch_id, Some(vec![ops[2].id, ops[0].id]))
            .await
            .unwrap();
        assert_eq!(view.batch.status, BatchStatus::Pending);
        assert_eq!(view.batch.completed_operations, 1);
        assert_eq!(view.batch.failed_operations, 1);

        let after = orchestrator.list_operations(batch_id, None).await.unwrap();
        assert_eq!(after[0].status, OperationStatus::Completed);
        assert_eq!(after[1].status, OperationStatus::Failed);
        assert_eq!(after[2].status, OperationStatus::Pending);
        assert_eq!(after[2].retry_count, 1);
        assert!(after[2].error_message.is_none());
        assert!(after[2].completed_at.is_none());

        assert_eq!(queue.queued_count(Lane::Payments), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_list_batches_validation_and_paging() {
        let (orchestrator, _storage, _queue) = orchestrator();
        for _ in 0..3 {
            orchestrator
                .create_payment_batch(vec![payment(0)], BatchOptions::default())
                .await
                .unwrap();
        }

        assert!(orchestrator.list_batches(0, 10, None).await.is_err());
        assert!(orchestrator.list_batches(1, 0, None).await.is_err());

        let list = orchestrator
            .list_batches(1, DEFAULT_PAGE_LIMIT, Some(BatchStatus::Pending))
            .await
            .unwrap();
        assert_eq!(list.total, 3);
        assert_eq!(list.batches.len(), 3);
        assert!(list.batches.iter().all(|b| b.operations.is_none()));

        let list = orchestrator
            .list_batches(1, 10, Some(BatchStatus::Completed))
            .await
            .unwrap();
        assert_eq!(list.total, 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_unknown_batch() {
        let (orchestrator, _storage, _queue) = orchestrator();
        let id = BatchId::new();
        assert!(matches!(
            orchestrator.get_batch_status(id).await,
            Err(VolleyError::BatchNotFound(_))
        ));
        assert!(matches!(
            orchestrator.list_operations(id, None).await,
            Err(VolleyError::BatchNotFound(_))
        ));
        assert!(matches!(
            orchestrator.retry_failed_operations(id, None).await,
            Err(VolleyError::BatchNotFound(_))
        ));
        assert!(matches!(
            orchestrator.cancel_batch(id).await,
            Err(VolleyError::BatchNotFound(_))
        ));
    }
}
