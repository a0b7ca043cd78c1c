//! Operation handler abstraction.
//!
//! An [`OperationHandler`] holds the business logic for one batch kind (creating a
//! split, settling a payment, running a maintenance task). The executor owns
//! everything around it: status transitions, validation, retries and progress.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::batch::{BatchKind, Operation, OperationOutput, OperationPayload};
use crate::error::OperationError;

/// Trait for executing a single operation.
///
/// Implementations receive operations whose payload already passed validation.
/// Return a retriable [`OperationError`] for failures that may succeed on a later
/// attempt; anything else fails the operation for good.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn execute(&self, operation: &Operation) -> Result<OperationOutput, OperationError>;
}

/// Handlers by batch kind.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<BatchKind, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: BatchKind, handler: Arc<dyn OperationHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Register the same handler for every kind.
    pub fn with_all(handler: Arc<dyn OperationHandler>) -> Self {
        [
            BatchKind::SplitCreation,
            BatchKind::PaymentProcessing,
            BatchKind::ScheduledTask,
        ]
        .into_iter()
        .fold(Self::new(), |registry, kind| {
            registry.register(kind, handler.clone())
        })
    }

    pub fn get(&self, kind: BatchKind) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(&kind).cloned()
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

type MockResult = Result<OperationOutput, OperationError>;

/// Mock handler for testing.
///
/// Responses are configured per operation index and returned in FIFO order, so a
/// single index can fail a few times and then succeed. Operations with nothing
/// configured get the default response: a synthesized success unless overridden.
///
/// # Example
/// ```ignore
/// let mock = MockOperationHandler::new();
/// mock.add_response(3, Err(OperationError::transient("TIMEOUT", "upstream timed out")));
/// // index 3 fails once, then falls back to the default success
/// ```
#[derive(Clone, Default)]
pub struct MockOperationHandler {
    responses: Arc<Mutex<HashMap<u32, Vec<MockResponse>>>>,
    default_response: Arc<Mutex<Option<MockResult>>>,
    delay: Arc<Mutex<Option<Duration>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

/// A mock response that can optionally wait for a trigger before completing.
enum MockResponse {
    Immediate(MockResult),
    Triggered {
        response: MockResult,
        trigger: oneshot::Receiver<()>,
    },
}

/// Record of a call made to the mock handler.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub operation: Operation,
    /// Operations in flight when this call started, itself included
    pub in_flight_at_start: usize,
}

impl MockOperationHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the operation at `index`.
    pub fn add_response(&self, index: u32, response: MockResult) {
        self.responses
            .lock()
            .entry(index)
            .or_default()
            .push(MockResponse::Immediate(response));
    }

    /// Queue a response for `index` that is held back until the returned sender is
    /// triggered (by sending `()` or dropping it).
    pub fn add_response_with_trigger(
        &self,
        index: u32,
        response: MockResult,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.responses
            .lock()
            .entry(index)
            .or_default()
            .push(MockResponse::Triggered {
                response,
                trigger: rx,
            });
        tx
    }

    /// Response for operations with nothing queued.
    pub fn set_default_response(&self, response: MockResult) {
        *self.default_response.lock() = Some(response);
    }

    /// Sleep this long inside every call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Indices of the operations called, in call order.
    pub fn called_indices(&self) -> Vec<u32> {
        self.calls.lock().iter().map(|c| c.operation.index).collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn synthesize(operation: &Operation) -> OperationOutput {
        let now = chrono::Utc::now();
        match &operation.payload {
            OperationPayload::Split(split) => OperationOutput::Split {
                split_id: format!("split_{}", operation.id.0.simple()),
                total_amount: split.total_amount,
                participant_count: split.participants.len(),
                created_at: now,
            },
            OperationPayload::Payment(payment) => OperationOutput::Payment {
                payment_id: format!("payment_{}", operation.id.0.simple()),
                split_id: payment.split_id.clone(),
                participant_id: payment.participant_id.clone(),
                stellar_tx_hash: payment.stellar_tx_hash.clone(),
                status: "confirmed".to_string(),
                processed_at: now,
            },
            OperationPayload::ScheduledTask(task) => OperationOutput::ScheduledTask {
                task_type: task.task_type,
                items_processed: 0,
                items_failed: 0,
                report_generated: true,
            },
        }
    }
}

#[async_trait]
impl OperationHandler for MockOperationHandler {
    async fn execute(&self, operation: &Operation) -> Result<OperationOutput, OperationError> {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        // Decrement even if the call is cancelled
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        self.calls.lock().push(MockCall {
            operation: operation.clone(),
            in_flight_at_start: now_in_flight,
        });

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mock_response = {
            let mut responses = self.responses.lock();
            responses
                .get_mut(&operation.index)
                .filter(|queue| !queue.is_empty())
                .map(|queue| queue.remove(0))
        };

        match mock_response {
            Some(MockResponse::Immediate(response)) => response,
            Some(MockResponse::Triggered { response, trigger }) => {
                // Proceed whether triggered or dropped
                let _ = trigger.await;
                response
            }
            None => {
                let default = self.default_response.lock().clone();
                default.unwrap_or_else(|| Ok(Self::synthesize(operation)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchId, PaymentPayload};

    fn operation(index: u32) -> Operation {
        Operation::new(
            BatchId::new(),
            index,
            OperationPayload::Payment(PaymentPayload {
                split_id: "split-1".to_string(),
                participant_id: format!("user-{}", index),
                stellar_tx_hash: "a1b2c3d4e5f6a7b8c9d0".to_string(),
            }),
        )
    }

    #[tokio::test]
    async fn test_mock_defaults_to_success() {
        let mock = MockOperationHandler::new();
        let output = mock.execute(&operation(0)).await.unwrap();
        assert!(matches!(output, OperationOutput::Payment { ref status, .. } if status == "confirmed"));
        assert_eq!(mock.call_count(), 1);
        assert_eq!(mock.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_mock_responses_are_fifo_per_index() {
        let mock = MockOperationHandler::new();
        mock.add_response(1, Err(OperationError::transient("TIMEOUT", "first")));
        mock.add_response(1, Err(OperationError::permanent("DECLINED", "second")));

        assert_eq!(mock.execute(&operation(1)).await.unwrap_err().message, "first");
        assert_eq!(mock.execute(&operation(1)).await.unwrap_err().message, "second");
        assert!(mock.execute(&operation(1)).await.is_ok());
        assert_eq!(mock.called_indices(), vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn test_mock_default_response_override() {
        let mock = MockOperationHandler::new();
        mock.set_default_response(Err(OperationError::permanent("DOWN", "service down")));
        assert!(mock.execute(&operation(7)).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_with_trigger() {
        let mock = MockOperationHandler::new();
        let trigger = mock.add_response_with_trigger(
            0,
            Err(OperationError::permanent("LATE", "triggered")),
        );

        let mock_clone = mock.clone();
        let handle = tokio::spawn(async move { mock_clone.execute(&operation(0)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        assert_eq!(mock.in_flight_count(), 1);

        trigger.send(()).unwrap();
        let result = handle.await.unwrap();
        assert_eq!(result.unwrap_err().message, "triggered");
        assert_eq!(mock.in_flight_count(), 0);
        assert_eq!(mock.max_in_flight(), 1);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = HandlerRegistry::new().register(
            BatchKind::PaymentProcessing,
            Arc::new(MockOperationHandler::new()),
        );
        assert!(registry.get(BatchKind::PaymentProcessing).is_some());
        assert!(registry.get(BatchKind::SplitCreation).is_none());

        let registry = HandlerRegistry::with_all(Arc::new(MockOperationHandler::new()));
        assert!(registry.get(BatchKind::ScheduledTask).is_some());
    }
}
