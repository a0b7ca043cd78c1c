//! Metrics emitted through the `metrics` facade.
//!
//! Nothing is recorded unless the embedding application installs a recorder
//! (for example a Prometheus exporter). Names and labels:
//!
//! - `volley_operations_total{kind, status}`: operation outcomes (`completed`, `failed`, `retrying`)
//! - `volley_operation_retries_total{kind}`: automatic retries scheduled
//! - `volley_operation_duration_seconds{kind}`: handler latency, per attempt
//! - `volley_batches_total{kind, status}`: batches reaching a terminal status
//! - `volley_operations_in_flight{kind}`: operations currently executing
//! - `volley_executions_total{lane, outcome}`: execution jobs run by the worker

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::batch::{BatchKind, BatchStatus, OperationStatus};
use crate::queue::Lane;

pub fn record_operation_outcome(kind: BatchKind, status: OperationStatus, duration: Duration) {
    counter!(
        "volley_operations_total",
        "kind" => kind.as_str(),
        "status" => status.as_str()
    )
    .increment(1);
    histogram!(
        "volley_operation_duration_seconds",
        "kind" => kind.as_str()
    )
    .record(duration.as_secs_f64());
}

pub fn record_operation_retry(kind: BatchKind) {
    counter!("volley_operation_retries_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_batch_finished(kind: BatchKind, status: BatchStatus) {
    counter!(
        "volley_batches_total",
        "kind" => kind.as_str(),
        "status" => status.as_str()
    )
    .increment(1);
}

pub fn operation_started(kind: BatchKind) {
    gauge!("volley_operations_in_flight", "kind" => kind.as_str()).increment(1.0);
}

pub fn operation_settled(kind: BatchKind) {
    gauge!("volley_operations_in_flight", "kind" => kind.as_str()).decrement(1.0);
}

pub fn record_execution(lane: Lane, outcome: &'static str) {
    counter!(
        "volley_executions_total",
        "lane" => lane.name(),
        "outcome" => outcome
    )
    .increment(1);
}
