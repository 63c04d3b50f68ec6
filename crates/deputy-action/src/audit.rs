//! Audit Log: read access and integrity checks.
//!
//! Appends happen only inside [`ActionStore::transition`](crate::store::ActionStore::transition),
//! in the same transaction as the state change. This type exposes the
//! export side: queries, per-account chain verification, and per-action
//! trail completeness.

use std::sync::Arc;

use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use deputy_core::audit::{verify_chain, AuditRecord, ChainVerification};
use deputy_core::error::DeputyError;
use deputy_core::types::{Action, ActionState};
use deputy_storage::{AuditQuery, AuditRepository, Database};

use crate::store::state_machine::is_edge;

/// Result of checking one action's audit trail against its current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrailVerification {
    pub action_id: Uuid,
    pub valid: bool,
    pub records: usize,
    pub current_state: ActionState,
    pub error: Option<String>,
}

pub struct AuditLog {
    repo: AuditRepository,
}

impl AuditLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            repo: AuditRepository::new(db),
        }
    }

    pub fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>, DeputyError> {
        self.repo.query(query)
    }

    pub fn for_action(&self, action_id: Uuid) -> Result<Vec<AuditRecord>, DeputyError> {
        self.repo.for_action(action_id)
    }

    /// Recompute the account's hash chain from its first record.
    pub fn verify_account(&self, account_id: &str) -> Result<ChainVerification, DeputyError> {
        let chain = self.repo.chain(account_id)?;
        let result = verify_chain(&chain);
        if !result.valid {
            error!(
                account_id = %account_id,
                first_invalid_index = ?result.first_invalid_index,
                error = ?result.error_message,
                "Audit chain verification failed"
            );
        }
        Ok(result)
    }

    /// Check that `action`'s records form a contiguous lifecycle path from
    /// `pending` to its current state, and that each record's digest holds.
    pub fn verify_action_trail(&self, action: &Action) -> Result<TrailVerification, DeputyError> {
        let records = self.repo.for_action(action.id)?;
        let error = trail_error(action, &records);
        Ok(TrailVerification {
            action_id: action.id,
            valid: error.is_none(),
            records: records.len(),
            current_state: action.state,
            error,
        })
    }
}

fn trail_error(action: &Action, records: &[AuditRecord]) -> Option<String> {
    let mut state = ActionState::Pending;
    for (i, record) in records.iter().enumerate() {
        if record.compute_digest() != record.digest {
            return Some(format!("record {} has an invalid digest", i));
        }
        if record.account_id != action.account_id {
            return Some(format!("record {} belongs to account {}", i, record.account_id));
        }
        if record.from_state != state {
            return Some(format!(
                "gap before record {}: expected from {}, found {}",
                i, state, record.from_state
            ));
        }
        if !is_edge(record.from_state, record.to_state) {
            return Some(format!(
                "record {} is not a lifecycle edge: {} -> {}",
                i, record.from_state, record.to_state
            ));
        }
        state = record.to_state;
    }
    if state != action.state {
        return Some(format!(
            "trail ends at {} but action is {}",
            state, action.state
        ));
    }
    None
}
