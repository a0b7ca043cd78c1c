//! Persistence for batches and operations.
//!
//! This module defines the [`Storage`] trait used by the orchestrator, the executor and
//! the progress tracker. Patches are last-write-wins on the fields they set; the
//! `transition_*` methods are compare-and-set on status. They keep a cancelled
//! operation from being picked up again and a cancelled batch from being reopened.

use async_trait::async_trait;

use crate::batch::{
    Batch, BatchFilter, BatchId, BatchPatch, BatchRecord, BatchStatus, Operation, OperationFilter, OperationId,
    OperationPatch, OperationPayload, OperationStatus,
};
use crate::error::Result;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStorage;

/// Storage trait for persisting and querying batches and their operations.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist a freshly constructed batch.
    async fn create_batch(&self, batch: Batch) -> Result<Batch>;

    /// Persist one `Pending` operation per payload, with indices `0..payloads.len()`
    /// in input order.
    async fn create_operations(
        &self,
        batch_id: BatchId,
        payloads: Vec<OperationPayload>,
    ) -> Result<Vec<Operation>>;

    /// Get a batch, optionally with its operations ordered by index.
    ///
    /// # Errors
    /// `BatchNotFound` if no such batch exists.
    async fn get_batch(&self, batch_id: BatchId, include_operations: bool) -> Result<BatchRecord>;

    /// Apply `patch` to a batch and return the updated record.
    async fn update_batch(&self, batch_id: BatchId, patch: BatchPatch) -> Result<Batch>;

    /// Apply `patch` only if the batch's current status is one of `from`.
    ///
    /// Returns `None` (and changes nothing) when the status did not match.
    ///
    /// # Errors
    /// `BatchNotFound` if no such batch exists.
    async fn transition_batch(
        &self,
        batch_id: BatchId,
        from: &[BatchStatus],
        patch: BatchPatch,
    ) -> Result<Option<Batch>>;

    /// One page (1-based) of batches matching `filter`, newest first, plus the
    /// total number of matches.
    async fn list_batches(
        &self,
        filter: &BatchFilter,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<Batch>, u64)>;

    /// Operations matching `filter`, ordered by index.
    async fn find_operations(&self, filter: &OperationFilter) -> Result<Vec<Operation>>;

    /// Apply `patch` to an operation unconditionally.
    async fn update_operation(
        &self,
        operation_id: OperationId,
        patch: OperationPatch,
    ) -> Result<Operation>;

    /// Apply `patch` only if the operation's current status is one of `from`.
    ///
    /// Returns `None` (and changes nothing) when the status did not match.
    async fn transition_operation(
        &self,
        operation_id: OperationId,
        from: &[OperationStatus],
        patch: OperationPatch,
    ) -> Result<Option<Operation>>;

    /// Apply `patch` to every operation of the batch whose status is one of `from`.
    /// Returns the number of operations changed.
    async fn bulk_transition_operations(
        &self,
        batch_id: BatchId,
        from: &[OperationStatus],
        patch: OperationPatch,
    ) -> Result<u64>;
}
