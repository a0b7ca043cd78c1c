//! In-process storage backed by hash maps.
//!
//! Every method takes the lock once, so each call is atomic with respect to the
//! others. Failures can be injected into `find_operations` and `update_operation`
//! to exercise the executor's batch-level error path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::Storage;
use crate::batch::{
    Batch, BatchFilter, BatchId, BatchPatch, BatchRecord, BatchStatus, Operation, OperationFilter, OperationId,
    OperationPatch, OperationPayload, OperationStatus,
};
use crate::error::{Result, VolleyError};

#[derive(Default)]
struct Tables {
    batches: HashMap<BatchId, Batch>,
    operations: HashMap<OperationId, Operation>,
    /// Operation ids per batch, in index order
    batch_operations: HashMap<BatchId, Vec<OperationId>>,
}

impl Tables {
    fn operations_of(&self, batch_id: BatchId) -> impl Iterator<Item = &Operation> {
        self.batch_operations
            .get(&batch_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.operations.get(id))
    }
}

/// [`Storage`] implementation that keeps everything in memory.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    tables: Arc<RwLock<Tables>>,
    fail_find_operations: Arc<AtomicUsize>,
    fail_update_operation: Arc<AtomicUsize>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls to `find_operations` fail.
    pub fn fail_find_operations(&self, times: usize) {
        self.fail_find_operations.store(times, Ordering::SeqCst);
    }

    /// Make the next `times` calls to `update_operation` fail.
    pub fn fail_update_operation(&self, times: usize) {
        self.fail_update_operation.store(times, Ordering::SeqCst);
    }

    pub fn batch_count(&self) -> usize {
        self.tables.read().batches.len()
    }

    fn take_injected_failure(counter: &AtomicUsize, what: &str) -> Result<()> {
        let injected = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(VolleyError::Other(anyhow::anyhow!(
                "Failed to {}: storage unavailable",
                what
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_batch(&self, batch: Batch) -> Result<Batch> {
        let mut tables = self.tables.write();
        tables.batch_operations.entry(batch.id).or_default();
        tables.batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn create_operations(
        &self,
        batch_id: BatchId,
        payloads: Vec<OperationPayload>,
    ) -> Result<Vec<Operation>> {
        let mut tables = self.tables.write();
        if !tables.batches.contains_key(&batch_id) {
            return Err(VolleyError::BatchNotFound(batch_id));
        }

        let operations: Vec<Operation> = payloads
            .into_iter()
            .enumerate()
            .map(|(index, payload)| Operation::new(batch_id, index as u32, payload))
            .collect();

        let ids = tables.batch_operations.entry(batch_id).or_default();
        ids.extend(operations.iter().map(|op| op.id));
        for op in &operations {
            tables.operations.insert(op.id, op.clone());
        }
        Ok(operations)
    }

    async fn get_batch(&self, batch_id: BatchId, include_operations: bool) -> Result<BatchRecord> {
        let tables = self.tables.read();
        let batch = tables
            .batches
            .get(&batch_id)
            .cloned()
            .ok_or(VolleyError::BatchNotFound(batch_id))?;
        let operations =
            include_operations.then(|| tables.operations_of(batch_id).cloned().collect());
        Ok(BatchRecord { batch, operations })
    }

    async fn update_batch(&self, batch_id: BatchId, patch: BatchPatch) -> Result<Batch> {
        let mut tables = self.tables.write();
        let batch = tables
            .batches
            .get_mut(&batch_id)
            .ok_or(VolleyError::BatchNotFound(batch_id))?;
        patch.apply(batch);
        Ok(batch.clone())
    }

    async fn transition_batch(
        &self,
        batch_id: BatchId,
        from: &[BatchStatus],
        patch: BatchPatch,
    ) -> Result<Option<Batch>> {
        let mut tables = self.tables.write();
        let batch = tables
            .batches
            .get_mut(&batch_id)
            .ok_or(VolleyError::BatchNotFound(batch_id))?;
        if !from.contains(&batch.status) {
            return Ok(None);
        }
        patch.apply(batch);
        Ok(Some(batch.clone()))
    }

    async fn list_batches(
        &self,
        filter: &BatchFilter,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<Batch>, u64)> {
        let tables = self.tables.read();
        let mut matching: Vec<&Batch> = tables
            .batches
            .values()
            .filter(|b| filter.matches(b))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let skip = (page.saturating_sub(1) as usize).saturating_mul(limit as usize);
        let items = matching
            .into_iter()
            .skip(skip)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok((items, total))
    }

    async fn find_operations(&self, filter: &OperationFilter) -> Result<Vec<Operation>> {
        Self::take_injected_failure(&self.fail_find_operations, "find operations")?;
        let tables = self.tables.read();
        Ok(tables
            .operations_of(filter.batch_id)
            .filter(|op| filter.matches(op))
            .cloned()
            .collect())
    }

    async fn update_operation(
        &self,
        operation_id: OperationId,
        patch: OperationPatch,
    ) -> Result<Operation> {
        Self::take_injected_failure(&self.fail_update_operation, "update operation")?;
        let mut tables = self.tables.write();
        let op = tables
            .operations
            .get_mut(&operation_id)
            .ok_or(VolleyError::OperationNotFound(operation_id))?;
        patch.apply(op);
        Ok(op.clone())
    }

    async fn transition_operation(
        &self,
        operation_id: OperationId,
        from: &[OperationStatus],
        patch: OperationPatch,
    ) -> Result<Option<Operation>> {
        let mut tables = self.tables.write();
        let op = tables
            .operations
            .get_mut(&operation_id)
            .ok_or(VolleyError::OperationNotFound(operation_id))?;
        if !from.contains(&op.status) {
            return Ok(None);
        }
        patch.apply(op);
        Ok(Some(op.clone()))
    }

    async fn bulk_transition_operations(
        &self,
        batch_id: BatchId,
        from: &[OperationStatus],
        patch: OperationPatch,
    ) -> Result<u64> {
        let mut guard = self.tables.write();
        let tables = &mut *guard;
        let Some(ids) = tables.batch_operations.get(&batch_id) else {
            return Ok(0);
        };

        let mut changed = 0;
        for id in ids {
            if let Some(op) = tables.operations.get_mut(id)
                && from.contains(&op.status)
            {
                patch.apply(op);
                changed += 1;
            }
        }
        Ok(changed)
    }
}
