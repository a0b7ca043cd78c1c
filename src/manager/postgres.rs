//! PostgreSQL implementation of [`Storage`].
//!
//! Patches are applied in Rust against a row locked with `SELECT ... FOR UPDATE`
//! and written back in the same transaction, so the in-memory and Postgres stores
//! share one definition of what a patch does.

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use uuid::Uuid;

use super::Storage;
use crate::batch::{
    Batch, BatchFilter, BatchId, BatchOptions, BatchPatch, BatchRecord, BatchStatus, Operation,
    OperationFilter, OperationId, OperationOutput, OperationPatch, OperationPayload,
    OperationStatus,
};
use crate::error::{Result, VolleyError};

const BATCH_COLUMNS: &str = "id, kind, status, total_operations, completed_operations, \
     failed_operations, progress_percent, options, error_message, started_at, completed_at, \
     created_at, updated_at";

const OPERATION_COLUMNS: &str = "id, batch_id, op_index, status, payload, result, \
     error_message, error_code, retry_count, started_at, completed_at, created_at, updated_at";

/// PostgreSQL-backed storage.
///
/// # Example
/// ```ignore
/// use volley::PostgresStorage;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgresql://localhost/volley").await?;
/// volley::migrator().run(&pool).await?;
/// let storage = Arc::new(PostgresStorage::new(pool));
/// ```
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_error(what: &str, e: sqlx::Error) -> VolleyError {
    VolleyError::Other(anyhow!("Failed to {}: {}", what, e))
}

fn decode_error(what: &str, e: impl std::fmt::Display) -> VolleyError {
    VolleyError::Other(anyhow!("Failed to decode {}: {}", what, e))
}

fn batch_from_row(row: &PgRow) -> Result<Batch> {
    let get_err = |e: sqlx::Error| decode_error("batch row", e);

    let kind: String = row.try_get("kind").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let Json(options): Json<BatchOptions> = row.try_get("options").map_err(get_err)?;
    let total: i64 = row.try_get("total_operations").map_err(get_err)?;
    let completed: i64 = row.try_get("completed_operations").map_err(get_err)?;
    let failed: i64 = row.try_get("failed_operations").map_err(get_err)?;
    let percent: i16 = row.try_get("progress_percent").map_err(get_err)?;

    Ok(Batch {
        id: BatchId(row.try_get::<Uuid, _>("id").map_err(get_err)?),
        kind: kind.parse().map_err(|e| decode_error("batch kind", e))?,
        status: status.parse().map_err(|e| decode_error("batch status", e))?,
        total_operations: total.max(0) as u64,
        completed_operations: completed.max(0) as u64,
        failed_operations: failed.max(0) as u64,
        progress_percent: percent.clamp(0, 100) as u8,
        options,
        error_message: row.try_get("error_message").map_err(get_err)?,
        started_at: row.try_get("started_at").map_err(get_err)?,
        completed_at: row.try_get("completed_at").map_err(get_err)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
    })
}

fn operation_from_row(row: &PgRow) -> Result<Operation> {
    let get_err = |e: sqlx::Error| decode_error("operation row", e);

    let status: String = row.try_get("status").map_err(get_err)?;
    let Json(payload): Json<OperationPayload> = row.try_get("payload").map_err(get_err)?;
    let result: Option<Json<OperationOutput>> = row.try_get("result").map_err(get_err)?;
    let index: i32 = row.try_get("op_index").map_err(get_err)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(get_err)?;

    Ok(Operation {
        id: OperationId(row.try_get::<Uuid, _>("id").map_err(get_err)?),
        batch_id: BatchId(row.try_get::<Uuid, _>("batch_id").map_err(get_err)?),
        index: index.max(0) as u32,
        status: status
            .parse()
            .map_err(|e| decode_error("operation status", e))?,
        payload,
        result: result.map(|Json(output)| output),
        error_message: row.try_get("error_message").map_err(get_err)?,
        error_code: row.try_get("error_code").map_err(get_err)?,
        retry_count: retry_count.max(0) as u32,
        started_at: row.try_get("started_at").map_err(get_err)?,
        completed_at: row.try_get("completed_at").map_err(get_err)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
    })
}

fn status_strings(statuses: &[OperationStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

/// Write every mutable column of `op` back to its row.
async fn write_operation<'c, E>(executor: E, op: &Operation) -> Result<()>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
        UPDATE operations
        SET status = $2, result = $3, error_message = $4, error_code = $5,
            retry_count = $6, started_at = $7, completed_at = $8, updated_at = $9
        WHERE id = $1
        "#,
    )
    .bind(op.id.0)
    .bind(op.status.as_str())
    .bind(op.result.as_ref().map(Json))
    .bind(op.error_message.as_deref())
    .bind(op.error_code.as_deref())
    .bind(op.retry_count as i32)
    .bind(op.started_at)
    .bind(op.completed_at)
    .bind(op.updated_at)
    .execute(executor)
    .await
    .map_err(|e| db_error("update operation", e))?;
    Ok(())
}

#[async_trait]
impl Storage for PostgresStorage {
    #[tracing::instrument(skip(self, batch), fields(batch_id = %batch.id))]
    async fn create_batch(&self, batch: Batch) -> Result<Batch> {
        sqlx::query(
            r#"
            INSERT INTO batches (
                id, kind, status, total_operations, completed_operations, failed_operations,
                progress_percent, options, error_message, started_at, completed_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(batch.id.0)
        .bind(batch.kind.as_str())
        .bind(batch.status.as_str())
        .bind(batch.total_operations as i64)
        .bind(batch.completed_operations as i64)
        .bind(batch.failed_operations as i64)
        .bind(batch.progress_percent as i16)
        .bind(Json(&batch.options))
        .bind(batch.error_message.as_deref())
        .bind(batch.started_at)
        .bind(batch.completed_at)
        .bind(batch.created_at)
        .bind(batch.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("create batch", e))?;

        Ok(batch)
    }

    #[tracing::instrument(skip(self, payloads), fields(batch_id = %batch_id, count = payloads.len()))]
    async fn create_operations(
        &self,
        batch_id: BatchId,
        payloads: Vec<OperationPayload>,
    ) -> Result<Vec<Operation>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;

        let exists = sqlx::query("SELECT 1 FROM batches WHERE id = $1")
            .bind(batch_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_error("look up batch", e))?;
        if exists.is_none() {
            return Err(VolleyError::BatchNotFound(batch_id));
        }

        let operations: Vec<Operation> = payloads
            .into_iter()
            .enumerate()
            .map(|(index, payload)| Operation::new(batch_id, index as u32, payload))
            .collect();

        for op in &operations {
            sqlx::query(
                r#"
                INSERT INTO operations (
                    id, batch_id, op_index, status, payload, retry_count, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(op.id.0)
            .bind(batch_id.0)
            .bind(op.index as i32)
            .bind(op.status.as_str())
            .bind(Json(&op.payload))
            .bind(op.retry_count as i32)
            .bind(op.created_at)
            .bind(op.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("create operation", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("commit transaction", e))?;
        Ok(operations)
    }

    async fn get_batch(&self, batch_id: BatchId, include_operations: bool) -> Result<BatchRecord> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM batches WHERE id = $1",
            BATCH_COLUMNS
        ))
        .bind(batch_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get batch", e))?
        .ok_or(VolleyError::BatchNotFound(batch_id))?;
        let batch = batch_from_row(&row)?;

        let operations = if include_operations {
            Some(
                self.find_operations(&OperationFilter::for_batch(batch_id))
                    .await?,
            )
        } else {
            None
        };
        Ok(BatchRecord { batch, operations })
    }

    async fn update_batch(&self, batch_id: BatchId, patch: BatchPatch) -> Result<Batch> {
        self.transition_batch(batch_id, &ALL_BATCH_STATUSES, patch)
            .await?
            .ok_or(VolleyError::BatchNotFound(batch_id))
    }

    async fn transition_batch(
        &self,
        batch_id: BatchId,
        from: &[BatchStatus],
        patch: BatchPatch,
    ) -> Result<Option<Batch>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM batches WHERE id = $1 FOR UPDATE",
            BATCH_COLUMNS
        ))
        .bind(batch_id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("lock batch", e))?
        .ok_or(VolleyError::BatchNotFound(batch_id))?;

        let mut batch = batch_from_row(&row)?;
        if !from.contains(&batch.status) {
            return Ok(None);
        }
        patch.apply(&mut batch);

        sqlx::query(
            r#"
            UPDATE batches
            SET status = $2, completed_operations = $3, failed_operations = $4,
                progress_percent = $5, error_message = $6, started_at = $7,
                completed_at = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(batch.id.0)
        .bind(batch.status.as_str())
        .bind(batch.completed_operations as i64)
        .bind(batch.failed_operations as i64)
        .bind(batch.progress_percent as i16)
        .bind(batch.error_message.as_deref())
        .bind(batch.started_at)
        .bind(batch.completed_at)
        .bind(batch.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("update batch", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("commit transaction", e))?;
        Ok(Some(batch))
    }

    async fn list_batches(
        &self,
        filter: &BatchFilter,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<Batch>, u64)> {
        let status = filter.status.map(|s| s.as_str());
        let kind = filter.kind.map(|k| k.as_str());
        let offset = i64::from(page.saturating_sub(1)) * i64::from(limit);

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM batches
            WHERE ($1::TEXT IS NULL OR status = $1) AND ($2::TEXT IS NULL OR kind = $2)
            "#,
        )
        .bind(status)
        .bind(kind)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("count batches", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM batches
            WHERE ($1::TEXT IS NULL OR status = $1) AND ($2::TEXT IS NULL OR kind = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#,
            BATCH_COLUMNS
        ))
        .bind(status)
        .bind(kind)
        .bind(i64::from(limit))
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list batches", e))?;

        let batches = rows.iter().map(batch_from_row).collect::<Result<Vec<_>>>()?;
        Ok((batches, total.max(0) as u64))
    }

    async fn find_operations(&self, filter: &OperationFilter) -> Result<Vec<Operation>> {
        let statuses = filter.statuses.as_deref().map(status_strings);
        let ids: Option<Vec<Uuid>> = filter
            .ids
            .as_ref()
            .map(|ids| ids.iter().map(|id| id.0).collect());

        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM operations
            WHERE batch_id = $1
              AND ($2::TEXT[] IS NULL OR status = ANY($2))
              AND ($3::UUID[] IS NULL OR id = ANY($3))
            ORDER BY op_index
            "#,
            OPERATION_COLUMNS
        ))
        .bind(filter.batch_id.0)
        .bind(statuses)
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("find operations", e))?;

        rows.iter().map(operation_from_row).collect()
    }

    async fn update_operation(
        &self,
        operation_id: OperationId,
        patch: OperationPatch,
    ) -> Result<Operation> {
        self.transition_operation(operation_id, &ALL_STATUSES, patch)
            .await?
            .ok_or(VolleyError::OperationNotFound(operation_id))
    }

    async fn transition_operation(
        &self,
        operation_id: OperationId,
        from: &[OperationStatus],
        patch: OperationPatch,
    ) -> Result<Option<Operation>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM operations WHERE id = $1 FOR UPDATE",
            OPERATION_COLUMNS
        ))
        .bind(operation_id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("lock operation", e))?
        .ok_or(VolleyError::OperationNotFound(operation_id))?;

        let mut op = operation_from_row(&row)?;
        if !from.contains(&op.status) {
            return Ok(None);
        }
        patch.apply(&mut op);
        write_operation(&mut *tx, &op).await?;

        tx.commit()
            .await
            .map_err(|e| db_error("commit transaction", e))?;
        Ok(Some(op))
    }

    async fn bulk_transition_operations(
        &self,
        batch_id: BatchId,
        from: &[OperationStatus],
        patch: OperationPatch,
    ) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM operations
            WHERE batch_id = $1 AND status = ANY($2)
            ORDER BY op_index
            FOR UPDATE
            "#,
            OPERATION_COLUMNS
        ))
        .bind(batch_id.0)
        .bind(status_strings(from))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| db_error("lock operations", e))?;

        let mut changed = 0u64;
        for row in &rows {
            let mut op = operation_from_row(row)?;
            patch.apply(&mut op);
            write_operation(&mut *tx, &op).await?;
            changed += 1;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("commit transaction", e))?;

        if changed > 0 {
            tracing::debug!(batch_id = %batch_id, changed, "Bulk operation transition");
        }
        Ok(changed)
    }
}

const ALL_BATCH_STATUSES: [BatchStatus; 6] = [
    BatchStatus::Pending,
    BatchStatus::Processing,
    BatchStatus::Completed,
    BatchStatus::Failed,
    BatchStatus::Partial,
    BatchStatus::Cancelled,
];

const ALL_STATUSES: [OperationStatus; 6] = [
    OperationStatus::Pending,
    OperationStatus::Processing,
    OperationStatus::Completed,
    OperationStatus::Failed,
    OperationStatus::Retrying,
    OperationStatus::Cancelled,
];
