//! Durable batch execution with progress tracking, retry and cancellation.
//!
//! A [`BatchOrchestrator`] accepts batches of homogeneous operations (split
//! creations, payments, scheduled maintenance tasks), persists them through a
//! [`Storage`] and hands one execution job per batch to a queue. A [`Worker`]
//! consumes those jobs and drives a [`ChunkedExecutor`], which runs the batch's
//! pending operations in chunks with a bounded number in flight, retries transient
//! failures in place and keeps batch counters, ETA and events up to date through a
//! [`ProgressTracker`].
//!
//! Storage is in memory by default; the `postgres` feature adds a sqlx-backed store.

pub mod batch;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod executor;
pub mod handler;
pub mod manager;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod worker;

// Re-export commonly used types
pub use batch::*;
pub use config::{ExecutorConfig, QueueConfig, VolleyConfig};
pub use error::{OperationError, Result, VolleyError};
pub use events::{
    BatchEvent, BatchEventKind, BroadcastPublisher, EventPublisher, NoopPublisher,
    RecordingPublisher,
};
pub use executor::{ChunkedExecutor, ExecutionSummary};
pub use handler::{HandlerRegistry, MockOperationHandler, OperationHandler};
pub use manager::{InMemoryStorage, Storage};
pub use orchestrator::BatchOrchestrator;
pub use progress::ProgressTracker;
pub use queue::{InMemoryQueue, JobQueue, Lane};
pub use worker::Worker;

#[cfg(feature = "postgres")]
pub use manager::postgres::PostgresStorage;

/// Get the volley database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
