//! Operation types.
//!
//! An operation is one independent unit of work inside a batch. Its `index` is its
//! position in the submitter's input and drives admission order.
//!
//! ```text
//! Pending ──> Processing ──> Completed
//!                 │  ▲
//!                 │  └── Retrying (automatic, while retry_count < cap)
//!                 └────> Failed ──retry_failed_operations──> Pending
//!
//! Pending | Processing | Retrying ──cancel──> Cancelled
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::batch::BatchId;
use super::payload::{OperationOutput, OperationPayload};

/// Unique identifier for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn new() -> Self {
        OperationId(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for OperationId {
    fn from(uuid: Uuid) -> Self {
        OperationId(uuid)
    }
}

impl std::ops::Deref for OperationId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Operation lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Retrying => "retrying",
            OperationStatus::Cancelled => "cancelled",
        }
    }

    /// Check if this status is terminal (Completed, Failed, or Cancelled).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    /// Statuses swept to `Cancelled` when the owning batch is cancelled.
    pub const CANCELLABLE: [OperationStatus; 3] = [
        OperationStatus::Pending,
        OperationStatus::Processing,
        OperationStatus::Retrying,
    ];
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "processing" => Ok(OperationStatus::Processing),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            "retrying" => Ok(OperationStatus::Retrying),
            "cancelled" => Ok(OperationStatus::Cancelled),
            _ => Err(format!("Invalid operation status: {}", s)),
        }
    }
}

/// One unit of work within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub batch_id: BatchId,
    /// Position within the batch, assigned at creation
    pub index: u32,
    pub status: OperationStatus,
    pub payload: OperationPayload,
    pub result: Option<OperationOutput>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    /// A fresh `Pending` operation at `index`.
    pub fn new(batch_id: BatchId, index: u32, payload: OperationPayload) -> Self {
        let now = Utc::now();
        Self {
            id: OperationId::new(),
            batch_id,
            index,
            status: OperationStatus::Pending,
            payload,
            result: None,
            error_message: None,
            error_code: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn summary(&self) -> OperationSummary {
        OperationSummary {
            id: self.id,
            index: self.index,
            status: self.status,
            error_message: self.error_message.clone(),
            error_code: self.error_code.clone(),
            retry_count: self.retry_count,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Partial update of an operation. `None` leaves a field untouched; for nullable
/// fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationPatch {
    pub status: Option<OperationStatus>,
    pub result: Option<Option<OperationOutput>>,
    pub error_message: Option<Option<String>>,
    pub error_code: Option<Option<String>>,
    pub retry_count: Option<u32>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl OperationPatch {
    pub fn status(status: OperationStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Apply the patch in place and bump `updated_at`.
    pub fn apply(&self, operation: &mut Operation) {
        if let Some(status) = self.status {
            operation.status = status;
        }
        if let Some(result) = &self.result {
            operation.result = result.clone();
        }
        if let Some(error_message) = &self.error_message {
            operation.error_message = error_message.clone();
        }
        if let Some(error_code) = &self.error_code {
            operation.error_code = error_code.clone();
        }
        if let Some(retry_count) = self.retry_count {
            operation.retry_count = retry_count;
        }
        if let Some(started_at) = self.started_at {
            operation.started_at = started_at;
        }
        if let Some(completed_at) = self.completed_at {
            operation.completed_at = completed_at;
        }
        operation.updated_at = Utc::now();
    }
}

/// Filter for querying operations. Results are always ordered by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFilter {
    pub batch_id: BatchId,
    /// Restrict to these statuses (any of)
    pub statuses: Option<Vec<OperationStatus>>,
    /// Restrict to these ids
    pub ids: Option<Vec<OperationId>>,
}

impl OperationFilter {
    pub fn for_batch(batch_id: BatchId) -> Self {
        Self {
            batch_id,
            statuses: None,
            ids: None,
        }
    }

    pub fn with_status(mut self, status: OperationStatus) -> Self {
        self.statuses = Some(vec![status]);
        self
    }

    pub fn with_statuses(mut self, statuses: Vec<OperationStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    pub fn with_ids(mut self, ids: Vec<OperationId>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn matches(&self, operation: &Operation) -> bool {
        operation.batch_id == self.batch_id
            && self
                .statuses
                .as_ref()
                .is_none_or(|statuses| statuses.contains(&operation.status))
            && self
                .ids
                .as_ref()
                .is_none_or(|ids| ids.contains(&operation.id))
    }
}

/// Per-operation line of a batch status view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationSummary {
    pub id: OperationId,
    pub index: u32,
    pub status: OperationStatus,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}
