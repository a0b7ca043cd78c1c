//! Error types for the batch processing core.
//!
//! Two layers of failure exist. [`VolleyError`] is returned by the public API and by
//! the executor when batch-level control logic fails. [`OperationError`] describes a
//! single operation's failure; it is recorded on the operation and never propagated
//! to the batch as a whole.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::{BatchId, BatchStatus, OperationId};

/// Result type alias using the volley error type.
pub type Result<T> = std::result::Result<T, VolleyError>;

/// Error code recorded when a handler fails without naming one.
pub const UNKNOWN_ERROR_CODE: &str = "UNKNOWN_ERROR";

/// Error code recorded when an operation payload fails validation.
pub const VALIDATION_ERROR_CODE: &str = "VALIDATION_ERROR";

/// Main error type for the batching system.
#[derive(Error, Debug)]
pub enum VolleyError {
    /// Rejected before any persistence (empty item list, out-of-range options, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Batch not found
    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    /// Operation not found
    #[error("Operation not found: {0}")]
    OperationNotFound(OperationId),

    /// Batch is in a state that does not allow the requested operation
    #[error("Invalid state: batch {batch_id} is '{status}': {reason}")]
    InvalidState {
        batch_id: BatchId,
        status: BatchStatus,
        reason: String,
    },

    /// The executor's own control logic failed. Surfaced to the queue so its
    /// attempts/backoff policy applies.
    #[error("Execution of batch {batch_id} failed: {message}")]
    FatalExecution { batch_id: BatchId, message: String },

    /// Queue interaction failed
    #[error("Queue error: {0}")]
    Queue(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VolleyError {
    /// Short, stable name of the variant, for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            VolleyError::InvalidArgument(_) => "invalid_argument",
            VolleyError::BatchNotFound(_) => "batch_not_found",
            VolleyError::OperationNotFound(_) => "operation_not_found",
            VolleyError::InvalidState { .. } => "invalid_state",
            VolleyError::FatalExecution { .. } => "fatal_execution",
            VolleyError::Queue(_) => "queue",
            VolleyError::Serialization(_) => "serialization",
            VolleyError::Other(_) => "other",
        }
    }
}

/// Failure of a single operation.
///
/// Produced by payload validation or by an [`OperationHandler`](crate::handler::OperationHandler).
/// `retriable` decides whether the executor moves the operation to `Retrying`
/// (while its retry budget lasts) or straight to terminal `Failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct OperationError {
    /// Machine-readable code; `UNKNOWN_ERROR` is recorded when absent.
    pub code: Option<String>,
    /// Human-readable message stored on the operation.
    pub message: String,
    /// Whether a further attempt may succeed.
    pub retriable: bool,
}

impl OperationError {
    /// Payload validation failure. Never retried automatically.
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            code: Some(VALIDATION_ERROR_CODE.to_string()),
            message: message.into(),
            retriable: false,
        }
    }

    /// Transient failure (timeouts, upstream unavailability) that may succeed later.
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            retriable: true,
        }
    }

    /// Failure that will not be fixed by retrying.
    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            retriable: false,
        }
    }

    /// The code to persist, falling back to `UNKNOWN_ERROR`.
    pub fn code_or_default(&self) -> &str {
        self.code.as_deref().unwrap_or(UNKNOWN_ERROR_CODE)
    }
}

/// Untyped handler errors carry no code and are assumed to be transient.
impl From<anyhow::Error> for OperationError {
    fn from(error: anyhow::Error) -> Self {
        Self {
            code: None,
            message: error.to_string(),
            retriable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_defaults_to_unknown_error() {
        let error = OperationError::from(anyhow::anyhow!("connection reset"));
        assert_eq!(error.code_or_default(), UNKNOWN_ERROR_CODE);
        assert_eq!(error.to_string(), "connection reset");
        assert!(error.retriable);
    }

    #[test]
    fn test_validation_errors_are_not_retriable() {
        let error = OperationError::validation("Invalid total amount");
        assert_eq!(error.code_or_default(), VALIDATION_ERROR_CODE);
        assert!(!error.retriable);
    }

    #[test]
    fn test_invalid_state_message() {
        let batch_id = BatchId::from(uuid::Uuid::new_v4());
        let error = VolleyError::InvalidState {
            batch_id,
            status: BatchStatus::Completed,
            reason: "cannot cancel".to_string(),
        };
        let message = error.to_string();
        assert!(message.contains("completed"));
        assert!(message.contains("cannot cancel"));
        assert_eq!(error.kind(), "invalid_state");
    }
}
