//! Typed operation payloads and results.
//!
//! Each [`BatchKind`] has its own payload shape. Validation runs inside the
//! executor right before the handler is called, so a malformed item fails only
//! its own operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::batch::BatchKind;
use crate::error::OperationError;

/// Participant amounts may drift from the total by at most this much.
pub const AMOUNT_TOLERANCE: f64 = 0.01;

/// Minimum length of a Stellar transaction hash.
pub const MIN_TX_HASH_LEN: usize = 10;

/// Input for one operation, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationPayload {
    Split(SplitPayload),
    Payment(PaymentPayload),
    ScheduledTask(ScheduledTaskPayload),
}

impl OperationPayload {
    pub fn kind(&self) -> BatchKind {
        match self {
            OperationPayload::Split(_) => BatchKind::SplitCreation,
            OperationPayload::Payment(_) => BatchKind::PaymentProcessing,
            OperationPayload::ScheduledTask(_) => BatchKind::ScheduledTask,
        }
    }

    pub fn validate(&self) -> Result<(), OperationError> {
        match self {
            OperationPayload::Split(payload) => payload.validate(),
            OperationPayload::Payment(payload) => payload.validate(),
            OperationPayload::ScheduledTask(_) => Ok(()),
        }
    }
}

impl From<SplitPayload> for OperationPayload {
    fn from(payload: SplitPayload) -> Self {
        OperationPayload::Split(payload)
    }
}

impl From<PaymentPayload> for OperationPayload {
    fn from(payload: PaymentPayload) -> Self {
        OperationPayload::Payment(payload)
    }
}

impl From<ScheduledTaskPayload> for OperationPayload {
    fn from(payload: ScheduledTaskPayload) -> Self {
        OperationPayload::ScheduledTask(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_address: Option<String>,
}

/// Create one split among participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitPayload {
    pub total_amount: f64,
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_wallet_address: Option<String>,
}

impl SplitPayload {
    pub fn validate(&self) -> Result<(), OperationError> {
        if self.total_amount.is_nan() || self.total_amount <= 0.0 {
            return Err(OperationError::validation("Invalid total amount"));
        }
        if self.participants.is_empty() {
            return Err(OperationError::validation("No participants provided"));
        }
        let participant_total: f64 = self.participants.iter().map(|p| p.amount).sum();
        if (participant_total - self.total_amount).abs() > AMOUNT_TOLERANCE {
            return Err(OperationError::validation(
                "Participant amounts do not sum to total amount",
            ));
        }
        Ok(())
    }
}

/// Settle one participant's share of a split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPayload {
    pub split_id: String,
    pub participant_id: String,
    pub stellar_tx_hash: String,
}

impl PaymentPayload {
    pub fn validate(&self) -> Result<(), OperationError> {
        if self.split_id.is_empty() {
            return Err(OperationError::validation("Split ID is required"));
        }
        if self.participant_id.is_empty() {
            return Err(OperationError::validation("Participant ID is required"));
        }
        if self.stellar_tx_hash.len() < MIN_TX_HASH_LEN {
            return Err(OperationError::validation(
                "Invalid Stellar transaction hash",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledTaskType {
    DailyReconciliation,
    WeeklySummary,
    MonthlyAnalytics,
    CleanupOldBatches,
}

impl ScheduledTaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduledTaskType::DailyReconciliation => "daily_reconciliation",
            ScheduledTaskType::WeeklySummary => "weekly_summary",
            ScheduledTaskType::MonthlyAnalytics => "monthly_analytics",
            ScheduledTaskType::CleanupOldBatches => "cleanup_old_batches",
        }
    }
}

impl std::fmt::Display for ScheduledTaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled maintenance task. Tracked as a single-operation batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTaskPayload {
    pub task_type: ScheduledTaskType,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// Result of a successful operation, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationOutput {
    Split {
        split_id: String,
        total_amount: f64,
        participant_count: usize,
        created_at: DateTime<Utc>,
    },
    Payment {
        payment_id: String,
        split_id: String,
        participant_id: String,
        stellar_tx_hash: String,
        status: String,
        processed_at: DateTime<Utc>,
    },
    ScheduledTask {
        task_type: ScheduledTaskType,
        items_processed: u64,
        items_failed: u64,
        report_generated: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(total: f64, amounts: &[f64]) -> SplitPayload {
        SplitPayload {
            total_amount: total,
            participants: amounts
                .iter()
                .enumerate()
                .map(|(i, amount)| Participant {
                    user_id: format!("user-{}", i),
                    amount: *amount,
                    wallet_address: None,
                })
                .collect(),
            description: Some("Dinner".to_string()),
            preferred_currency: None,
            creator_wallet_address: None,
        }
    }

    #[test]
    fn test_split_validation() {
        assert!(split(100.0, &[50.0, 50.0]).validate().is_ok());
        // Within tolerance
        assert!(split(100.0, &[33.33, 33.33, 33.33]).validate().is_ok());

        let err = split(0.0, &[]).validate().unwrap_err();
        assert_eq!(err.message, "Invalid total amount");
        assert!(!err.retriable);

        let err = split(10.0, &[]).validate().unwrap_err();
        assert_eq!(err.message, "No participants provided");

        let err = split(100.0, &[50.0, 40.0]).validate().unwrap_err();
        assert_eq!(err.message, "Participant amounts do not sum to total amount");
    }

    #[test]
    fn test_split_rejects_nan_total() {
        assert!(split(f64::NAN, &[1.0]).validate().is_err());
    }

    #[test]
    fn test_payment_validation() {
        let payment = PaymentPayload {
            split_id: "split-1".to_string(),
            participant_id: "user-1".to_string(),
            stellar_tx_hash: "short".to_string(),
        };
        let err = OperationPayload::from(payment.clone()).validate().unwrap_err();
        assert_eq!(err.message, "Invalid Stellar transaction hash");
        assert_eq!(err.code_or_default(), "VALIDATION_ERROR");

        let payment = PaymentPayload {
            stellar_tx_hash: "0123456789".to_string(),
            ..payment
        };
        assert!(payment.validate().is_ok());

        let payment = PaymentPayload {
            split_id: String::new(),
            ..payment
        };
        assert_eq!(payment.validate().unwrap_err().message, "Split ID is required");
    }

    #[test]
    fn test_payload_serializes_with_type_tag() {
        let payload = OperationPayload::ScheduledTask(ScheduledTaskPayload {
            task_type: ScheduledTaskType::CleanupOldBatches,
            params: serde_json::Map::new(),
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "scheduled_task");
        assert_eq!(json["task_type"], "cleanup_old_batches");
        assert_eq!(payload.kind(), BatchKind::ScheduledTask);

        let back: OperationPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
