//! Error types for the action engine.

use deputy_core::error::DeputyError;
use deputy_core::payload::PayloadError;
use deputy_core::trust::TrustLevel;
use deputy_core::types::{ActionState, ActionType};
use uuid::Uuid;

/// A state change that is not an edge of the action lifecycle graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Invalid state transition: {0} -> {1}")]
    InvalidTransition(ActionState, ActionState),
}

/// Errors from submitting, cancelling, or reading actions.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// Rejected at submit; nothing was stored.
    #[error("Invalid action: {0}")]
    InvalidAction(String),
    #[error("Action not found: {0}")]
    NotFound(Uuid),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    /// The audit record could not be written, so the transition was rolled back.
    #[error("Audit write failed: {0}")]
    AuditWriteFailure(String),
    #[error("Engine is shutting down")]
    ShuttingDown,
    #[error("Storage error: {0}")]
    Storage(DeputyError),
}

impl From<PayloadError> for ActionError {
    fn from(err: PayloadError) -> Self {
        ActionError::InvalidAction(err.to_string())
    }
}

impl From<DeputyError> for ActionError {
    fn from(err: DeputyError) -> Self {
        match err {
            DeputyError::AuditWrite(msg) => ActionError::AuditWriteFailure(msg),
            DeputyError::ShuttingDown => ActionError::ShuttingDown,
            other => ActionError::Storage(other),
        }
    }
}

/// Errors from the trust gate.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("Account {account_id} is not eligible for the next level: {reason}")]
    NotEligible { account_id: String, reason: String },
    #[error("Level change requires explicit user confirmation")]
    NotConfirmed,
    #[error("Account {0} is already at the maximum level")]
    AtMaximumLevel(String),
    #[error("Invalid trust level: {0}")]
    InvalidLevel(String),
    /// Another change to the same account committed first.
    #[error("Trust level for {account_id} changed concurrently (expected {expected})")]
    Conflict {
        account_id: String,
        expected: TrustLevel,
    },
    #[error("Storage error: {0}")]
    Storage(#[from] DeputyError),
}

/// Failures reported by a delivery client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("Provider error: {0}")]
    Provider(String),
    #[error("Delivery timed out after {0} seconds")]
    Timeout(u64),
    #[error("No delivery client registered for {0}")]
    Unsupported(ActionType),
}

/// Errors from policy management and evaluation.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),
    #[error("Policy not found: {0}")]
    NotFound(Uuid),
    #[error("Failed to submit policy action: {0}")]
    Submit(#[from] ActionError),
    #[error("Storage error: {0}")]
    Storage(#[from] DeputyError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_error_display() {
        let err = TransitionError::InvalidTransition(ActionState::Executed, ActionState::Pending);
        assert_eq!(err.to_string(), "Invalid state transition: executed -> pending");
    }

    #[test]
    fn test_audit_write_maps_to_failure_variant() {
        let err: ActionError = DeputyError::AuditWrite("disk full".to_string()).into();
        assert!(matches!(err, ActionError::AuditWriteFailure(_)));
        assert_eq!(err.to_string(), "Audit write failed: disk full");
    }

    #[test]
    fn test_storage_error_wraps() {
        let err: ActionError = DeputyError::Storage("locked".to_string()).into();
        assert!(matches!(err, ActionError::Storage(_)));
        assert!(err.to_string().contains("locked"));
    }

    #[test]
    fn test_payload_error_is_invalid_action() {
        let err: ActionError = PayloadError::UnknownType("launch_rocket".to_string()).into();
        assert!(matches!(err, ActionError::InvalidAction(_)));
        assert!(err.to_string().contains("launch_rocket"));
    }

    #[test]
    fn test_delivery_error_display() {
        assert_eq!(
            DeliveryError::Timeout(30).to_string(),
            "Delivery timed out after 30 seconds"
        );
        assert_eq!(
            DeliveryError::Unsupported(ActionType::DeleteItem).to_string(),
            "No delivery client registered for delete_item"
        );
    }

    #[test]
    fn test_trust_error_display() {
        let err = TrustError::NotEligible {
            account_id: "acct".to_string(),
            reason: "2 of 3 days at level".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Account acct is not eligible for the next level: 2 of 3 days at level"
        );
        let err = TrustError::Conflict {
            account_id: "acct".to_string(),
            expected: TrustLevel::Organize,
        };
        assert!(err.to_string().contains("2 (organize)"));
    }

    #[test]
    fn test_policy_error_from_action_error() {
        let err: PolicyError = ActionError::InvalidAction("bad".to_string()).into();
        assert!(matches!(err, PolicyError::Submit(_)));
    }
}
