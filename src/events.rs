//! Batch lifecycle events.
//!
//! Publishing is fire-and-forget: a publisher must never fail or block the
//! caller, and nothing is delivered twice on purpose. Subscribers that need a
//! durable view should read the batch status instead.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::batch::{Batch, BatchId, BatchStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BatchEventKind {
    /// After every progress recompute
    #[serde(rename = "batch.progress")]
    Progress,
    /// Once, on the transition into `Completed`
    #[serde(rename = "batch.completed")]
    Completed,
    /// Once, on the transition into `Failed`
    #[serde(rename = "batch.failed")]
    Failed,
}

impl BatchEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            BatchEventKind::Progress => "batch.progress",
            BatchEventKind::Completed => "batch.completed",
            BatchEventKind::Failed => "batch.failed",
        }
    }
}

impl std::fmt::Display for BatchEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchEvent {
    #[serde(rename = "event")]
    pub kind: BatchEventKind,
    pub batch_id: BatchId,
    pub progress_percent: u8,
    pub completed_operations: u64,
    pub failed_operations: u64,
    pub status: BatchStatus,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl BatchEvent {
    /// Snapshot of `batch` as an event of `kind`.
    pub fn from_batch(kind: BatchEventKind, batch: &Batch) -> Self {
        Self {
            kind,
            batch_id: batch.id,
            progress_percent: batch.progress_percent,
            completed_operations: batch.completed_operations,
            failed_operations: batch.failed_operations,
            status: batch.status,
            message: None,
            error: batch.error_message.clone(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Sink for batch events.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: BatchEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: BatchEvent) {}
}

/// Fans events out to any number of in-process subscribers.
///
/// Slow subscribers lag and lose the oldest events; publishing with no
/// subscribers is not an error.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<BatchEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: BatchEvent) {
        tracing::trace!(event = %event.kind, batch_id = %event.batch_id, "Publishing batch event");
        // Err only means there are no receivers right now
        let _ = self.sender.send(event);
    }
}

/// Records every event in memory, for tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<BatchEvent>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BatchEvent> {
        self.events.lock().clone()
    }

    /// Events of `kind` for `batch_id`.
    pub fn events_for(&self, batch_id: BatchId, kind: BatchEventKind) -> Vec<BatchEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.batch_id == batch_id && e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: BatchEventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: BatchEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchKind, BatchOptions};

    #[test]
    fn test_event_names() {
        assert_eq!(BatchEventKind::Progress.name(), "batch.progress");
        assert_eq!(BatchEventKind::Completed.name(), "batch.completed");
        assert_eq!(BatchEventKind::Failed.name(), "batch.failed");

        let batch = Batch::new(BatchKind::SplitCreation, 1, BatchOptions::default());
        let json = serde_json::to_value(BatchEvent::from_batch(BatchEventKind::Failed, &batch))
            .unwrap();
        assert_eq!(json["event"], "batch.failed");
        assert_eq!(json["status"], "pending");
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let publisher = BroadcastPublisher::new(16);
        let mut rx = publisher.subscribe();

        let batch = Batch::new(BatchKind::PaymentProcessing, 3, BatchOptions::default());
        publisher.publish(
            BatchEvent::from_batch(BatchEventKind::Progress, &batch).with_message("Waiting to start"),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.batch_id, batch.id);
        assert_eq!(event.message.as_deref(), Some("Waiting to start"));
    }

    #[test]
    fn test_broadcast_without_subscribers_is_silent() {
        let publisher = BroadcastPublisher::default();
        let batch = Batch::new(BatchKind::PaymentProcessing, 3, BatchOptions::default());
        publisher.publish(BatchEvent::from_batch(BatchEventKind::Completed, &batch));
    }

    #[test]
    fn test_recording_publisher_counts() {
        let publisher = RecordingPublisher::new();
        let batch = Batch::new(BatchKind::PaymentProcessing, 3, BatchOptions::default());
        publisher.publish(BatchEvent::from_batch(BatchEventKind::Progress, &batch));
        publisher.publish(BatchEvent::from_batch(BatchEventKind::Progress, &batch));
        publisher.publish(BatchEvent::from_batch(BatchEventKind::Completed, &batch));

        assert_eq!(publisher.count(BatchEventKind::Progress), 2);
        assert_eq!(publisher.events_for(batch.id, BatchEventKind::Completed).len(), 1);
        assert_eq!(publisher.count(BatchEventKind::Failed), 0);
    }
}
