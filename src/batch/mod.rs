//! Batch, operation and payload types.
//!
//! This module re-exports types from `domain::batch`, `domain::operation` and
//! `domain::payload`. See those modules for the actual implementations.

pub use crate::domain::batch::{
    Batch, BatchFilter, BatchId, BatchKind, BatchList, BatchOptions, BatchPatch, BatchRecord,
    BatchStatus, BatchStatusView, MAX_CHUNK_SIZE, MAX_RETRY_ATTEMPTS,
};

pub use crate::domain::operation::{
    Operation, OperationFilter, OperationId, OperationPatch, OperationStatus, OperationSummary,
};

pub use crate::domain::payload::{
    OperationOutput, OperationPayload, Participant, PaymentPayload, ScheduledTaskPayload,
    ScheduledTaskType, SplitPayload,
};
