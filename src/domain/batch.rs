//! Batch types.
//!
//! A batch is one submitted unit of work: N independent operations of one kind,
//! executed under a shared set of options and tracked through a single status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::operation::{Operation, OperationSummary};
use crate::error::{Result, VolleyError};
use crate::queue::Lane;

/// Unique identifier for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        BatchId(Uuid::new_v4())
    }

    /// Identity key used for the batch's execution job (full UUID).
    pub fn job_key(&self) -> String {
        self.0.to_string()
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for BatchId {
    fn from(uuid: Uuid) -> Self {
        BatchId(uuid)
    }
}

impl std::ops::Deref for BatchId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// What a batch's operations do. Selects the handler and the queue lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    SplitCreation,
    PaymentProcessing,
    ScheduledTask,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::SplitCreation => "split_creation",
            BatchKind::PaymentProcessing => "payment_processing",
            BatchKind::ScheduledTask => "scheduled_task",
        }
    }

    /// Queue lane that carries execution requests for this kind.
    pub fn lane(&self) -> Lane {
        match self {
            BatchKind::SplitCreation => Lane::Splits,
            BatchKind::PaymentProcessing => Lane::Payments,
            BatchKind::ScheduledTask => Lane::Scheduled,
        }
    }
}

impl std::fmt::Display for BatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "split_creation" => Ok(BatchKind::SplitCreation),
            "payment_processing" => Ok(BatchKind::PaymentProcessing),
            "scheduled_task" => Ok(BatchKind::ScheduledTask),
            _ => Err(format!("Invalid batch kind: {}", s)),
        }
    }
}

/// Batch lifecycle status.
///
/// ```text
/// Pending ──> Processing ──> Completed | Failed | Partial
///    │            │                         │       │
///    └────────────┴──cancel──> Cancelled <──────────┘ (Partial only)
///
/// Failed | Partial ──retry──> Pending
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Partial,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Partial => "partial",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    /// No further execution will happen without an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed
                | BatchStatus::Failed
                | BatchStatus::Partial
                | BatchStatus::Cancelled
        )
    }

    /// Whether `cancel_batch` accepts a batch in this status.
    ///
    /// `Partial` stays cancellable: its failed operations may still be retried,
    /// and stopping that is meaningful.
    pub fn is_cancellable(&self) -> bool {
        Self::CANCELLABLE.contains(self)
    }

    /// Whether `retry_failed_operations` accepts a batch in this status.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BatchStatus::Failed | BatchStatus::Partial)
    }

    pub const CANCELLABLE: [BatchStatus; 3] = [
        BatchStatus::Pending,
        BatchStatus::Processing,
        BatchStatus::Partial,
    ];

    /// Statuses an execution run may move to `Processing` or `Failed`.
    pub const RUNNABLE: [BatchStatus; 3] = [
        BatchStatus::Pending,
        BatchStatus::Processing,
        BatchStatus::Failed,
    ];
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            "partial" => Ok(BatchStatus::Partial),
            "cancelled" => Ok(BatchStatus::Cancelled),
            _ => Err(format!("Invalid batch status: {}", s)),
        }
    }
}

/// Upper bound on `chunk_size`.
pub const MAX_CHUNK_SIZE: usize = 1000;

/// Upper bound on `retry_attempts`.
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

/// Execution knobs supplied at creation. Unset fields fall back to process-wide
/// defaults from [`ExecutorConfig`](crate::config::ExecutorConfig).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Operations per sequential chunk (1..=1000)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    /// Operations in flight at once within a chunk (>= 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Priority hint forwarded to the queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Delay before the execution job becomes runnable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    /// Attempts per operation for retriable failures before it fails terminally (1..=10)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,
}

impl BatchOptions {
    /// Reject out-of-range options before anything is persisted.
    pub fn validate(&self) -> Result<()> {
        if let Some(chunk_size) = self.chunk_size
            && !(1..=MAX_CHUNK_SIZE).contains(&chunk_size)
        {
            return Err(VolleyError::InvalidArgument(format!(
                "chunk_size must be between 1 and {}, got {}",
                MAX_CHUNK_SIZE, chunk_size
            )));
        }
        if self.concurrency == Some(0) {
            return Err(VolleyError::InvalidArgument(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if let Some(retry_attempts) = self.retry_attempts
            && !(1..=MAX_RETRY_ATTEMPTS).contains(&retry_attempts)
        {
            return Err(VolleyError::InvalidArgument(format!(
                "retry_attempts must be between 1 and {}, got {}",
                MAX_RETRY_ATTEMPTS, retry_attempts
            )));
        }
        Ok(())
    }
}

/// A batch of independent operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub kind: BatchKind,
    pub status: BatchStatus,

    /// Counters, recomputed wholesale from operation state
    pub total_operations: u64,
    pub completed_operations: u64,
    pub failed_operations: u64,
    pub progress_percent: u8,

    pub options: BatchOptions,
    /// Set only when batch-level execution fails
    pub error_message: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    /// A freshly created batch: `Pending`, counters zero.
    pub fn new(kind: BatchKind, total_operations: u64, options: BatchOptions) -> Self {
        let now = Utc::now();
        Self {
            id: BatchId::new(),
            kind,
            status: BatchStatus::Pending,
            total_operations,
            completed_operations: 0,
            failed_operations: 0,
            progress_percent: 0,
            options,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update of a batch. `None` leaves a field untouched; for nullable
/// fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchPatch {
    pub status: Option<BatchStatus>,
    pub completed_operations: Option<u64>,
    pub failed_operations: Option<u64>,
    pub progress_percent: Option<u8>,
    pub error_message: Option<Option<String>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl BatchPatch {
    pub fn status(status: BatchStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Apply the patch in place and bump `updated_at`.
    pub fn apply(&self, batch: &mut Batch) {
        if let Some(status) = self.status {
            batch.status = status;
        }
        if let Some(completed) = self.completed_operations {
            batch.completed_operations = completed;
        }
        if let Some(failed) = self.failed_operations {
            batch.failed_operations = failed;
        }
        if let Some(progress) = self.progress_percent {
            batch.progress_percent = progress;
        }
        if let Some(error_message) = &self.error_message {
            batch.error_message = error_message.clone();
        }
        if let Some(started_at) = self.started_at {
            batch.started_at = started_at;
        }
        if let Some(completed_at) = self.completed_at {
            batch.completed_at = completed_at;
        }
        batch.updated_at = Utc::now();
    }
}

/// Filter for listing batches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchFilter {
    pub status: Option<BatchStatus>,
    pub kind: Option<BatchKind>,
}

impl BatchFilter {
    pub fn matches(&self, batch: &Batch) -> bool {
        self.status.is_none_or(|status| batch.status == status)
            && self.kind.is_none_or(|kind| batch.kind == kind)
    }
}

/// A batch as read from storage, optionally with its operations (ordered by index).
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRecord {
    pub batch: Batch,
    pub operations: Option<Vec<Operation>>,
}

/// Status view of a batch, as returned by the orchestrator.
///
/// `estimated_time_remaining_ms` and `processing_rate` are derived at read time from
/// `started_at` and the current counters, so two close reads may differ slightly.
#[derive(Debug, Clone, Serialize)]
pub struct BatchStatusView {
    #[serde(flatten)]
    pub batch: Batch,
    /// Human-readable progress message
    pub message: String,
    pub estimated_time_remaining_ms: Option<u64>,
    /// Completed operations per second, rounded to 2 decimals
    pub processing_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<OperationSummary>>,
}

/// One page of batches, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct BatchList {
    pub batches: Vec<BatchStatusView>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_batch_is_pending_with_zero_counters() {
        let batch = Batch::new(BatchKind::PaymentProcessing, 10, BatchOptions::default());
        assert_eq!(batch.status, BatchStatus::Pending);
        assert_eq!(batch.total_operations, 10);
        assert_eq!(batch.completed_operations, 0);
        assert_eq!(batch.failed_operations, 0);
        assert_eq!(batch.progress_percent, 0);
        assert!(batch.started_at.is_none());
        assert!(batch.completed_at.is_none());
    }

    #[test]
    fn test_options_bounds() {
        assert!(BatchOptions::default().validate().is_ok());

        let options = BatchOptions {
            chunk_size: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(VolleyError::InvalidArgument(_))
        ));

        let options = BatchOptions {
            chunk_size: Some(1001),
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = BatchOptions {
            concurrency: Some(0),
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = BatchOptions {
            retry_attempts: Some(11),
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = BatchOptions {
            chunk_size: Some(1000),
            concurrency: Some(64),
            retry_attempts: Some(10),
            priority: Some(-3),
            delay_ms: Some(500),
        };
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_cancellable_statuses() {
        assert!(BatchStatus::Pending.is_cancellable());
        assert!(BatchStatus::Processing.is_cancellable());
        assert!(BatchStatus::Partial.is_cancellable());
        assert!(!BatchStatus::Completed.is_cancellable());
        assert!(!BatchStatus::Failed.is_cancellable());
        assert!(!BatchStatus::Cancelled.is_cancellable());

        assert!(BatchStatus::Failed.is_retryable());
        assert!(BatchStatus::Partial.is_retryable());
        assert!(!BatchStatus::Processing.is_retryable());
        assert!(!BatchStatus::Cancelled.is_retryable());
    }

    #[test]
    fn test_patch_clears_nullable_fields() {
        let mut batch = Batch::new(BatchKind::SplitCreation, 2, BatchOptions::default());
        batch.error_message = Some("store unreachable".to_string());
        batch.completed_at = Some(Utc::now());

        let patch = BatchPatch {
            status: Some(BatchStatus::Pending),
            error_message: Some(None),
            completed_at: Some(None),
            ..Default::default()
        };
        patch.apply(&mut batch);

        assert_eq!(batch.status, BatchStatus::Pending);
        assert!(batch.error_message.is_none());
        assert!(batch.completed_at.is_none());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            BatchStatus::Pending,
            BatchStatus::Processing,
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::Partial,
            BatchStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<BatchStatus>(), Ok(status));
        }
        assert!("bogus".parse::<BatchStatus>().is_err());
    }
}
