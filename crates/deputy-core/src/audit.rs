//! Audit records and hash-chain integrity.
//!
//! Each account has its own chain: every record stores the digest of the
//! account's previous record, so a removed, reordered, or edited record
//! shows up as a broken link when the chain is recomputed.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::types::{ActionState, Actor, Timestamp};

/// One immutable entry in the audit log, recording a single state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Insertion order assigned by the store. Not covered by the digest.
    pub seq: i64,
    pub id: Uuid,
    pub account_id: String,
    pub action_id: Uuid,
    pub from_state: ActionState,
    pub to_state: ActionState,
    pub actor: Actor,
    pub timestamp: Timestamp,
    /// Redacted summary: payload digest, provider reference, or failure reason.
    pub result_summary: String,
    pub prev_digest: Option<String>,
    pub digest: String,
}

/// An audit record that has not yet been linked into its account chain.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditDraft {
    pub account_id: String,
    pub action_id: Uuid,
    pub from_state: ActionState,
    pub to_state: ActionState,
    pub actor: Actor,
    pub timestamp: Timestamp,
    pub result_summary: String,
}

impl AuditDraft {
    /// Link the draft after `prev_digest` and compute its own digest.
    pub fn seal(self, prev_digest: Option<String>) -> AuditRecord {
        let mut record = AuditRecord {
            seq: 0,
            id: Uuid::new_v4(),
            account_id: self.account_id,
            action_id: self.action_id,
            from_state: self.from_state,
            to_state: self.to_state,
            actor: self.actor,
            timestamp: self.timestamp,
            result_summary: self.result_summary,
            prev_digest,
            digest: String::new(),
        };
        record.digest = record.compute_digest();
        record
    }
}

impl AuditRecord {
    /// Recompute the digest from the record's content and link.
    pub fn compute_digest(&self) -> String {
        let input = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.id,
            self.account_id,
            self.action_id,
            self.from_state,
            self.to_state,
            self.actor,
            self.timestamp.0,
            self.result_summary,
            self.prev_digest.as_deref().unwrap_or("")
        );
        hex::encode(Sha256::digest(input.as_bytes()))
    }
}

/// Outcome of recomputing an account chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub total_records: usize,
    pub verified_records: usize,
    /// Index of the first record that fails verification.
    pub first_invalid_index: Option<usize>,
    pub error_message: Option<String>,
}

/// Verify a complete account chain, oldest record first.
///
/// The first record must have no predecessor; every later record must
/// link to the digest of the one before it.
pub fn verify_chain(records: &[AuditRecord]) -> ChainVerification {
    let mut result = ChainVerification {
        valid: true,
        total_records: records.len(),
        verified_records: 0,
        first_invalid_index: None,
        error_message: None,
    };

    for (i, record) in records.iter().enumerate() {
        let failure = if record.compute_digest() != record.digest {
            Some(format!("Record {} has an invalid digest", record.id))
        } else if i == 0 && record.prev_digest.is_some() {
            Some(format!(
                "Record {} links to a predecessor that is not in the chain",
                record.id
            ))
        } else if i > 0 && record.prev_digest.as_ref() != Some(&records[i - 1].digest) {
            Some(format!(
                "Record {} has a broken chain link (expected prev: {}, got: {:?})",
                record.id,
                records[i - 1].digest,
                record.prev_digest
            ))
        } else {
            None
        };

        if let Some(message) = failure {
            result.valid = false;
            result.first_invalid_index = Some(i);
            result.error_message = Some(message);
            return result;
        }
        result.verified_records = i + 1;
    }

    result
}
