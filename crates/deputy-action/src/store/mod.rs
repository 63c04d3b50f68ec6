//! Action Store: the only component that changes action state.
//!
//! Every change goes through [`ActionStore::transition`], a compare-and-swap
//! on the expected current state that commits together with its audit
//! record. Two callers racing on the same action get exactly one winner;
//! the loser sees `Ok(None)`.

pub mod state_machine;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use deputy_core::audit::AuditRecord;
use deputy_core::events::EngineEvent;
use deputy_core::payload::ActionPayload;
use deputy_core::types::{Action, ActionState, Actor, Origin, Timestamp};
use deputy_storage::{ActionFilter, ActionRepository, Database, TransitionRequest};

use crate::error::ActionError;
use state_machine::validate_transition;

const MAX_ACCOUNT_ID_LEN: usize = 256;
const DEFAULT_MAX_UNDO_WINDOW: Duration = Duration::from_secs(86_400);

/// An untyped request to act on a user's behalf.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub account_id: String,
    pub action_type: String,
    pub payload: serde_json::Value,
    pub origin: Origin,
    /// Overrides the configured default undo window.
    pub undo_window: Option<Duration>,
}

impl SubmitRequest {
    pub fn new(
        account_id: impl Into<String>,
        action_type: impl Into<String>,
        payload: serde_json::Value,
        origin: Origin,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            action_type: action_type.into(),
            payload,
            origin,
            undo_window: None,
        }
    }

    pub fn with_undo_window(mut self, window: Duration) -> Self {
        self.undo_window = Some(window);
        self
    }
}

pub struct ActionStore {
    actions: ActionRepository,
    default_undo_window: Duration,
    max_undo_window: Duration,
    events: broadcast::Sender<EngineEvent>,
}

impl ActionStore {
    pub fn new(
        db: Arc<Database>,
        default_undo_window: Duration,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            actions: ActionRepository::new(db),
            default_undo_window,
            max_undo_window: DEFAULT_MAX_UNDO_WINDOW.max(default_undo_window),
            events,
        }
    }

    /// Cap on per-request undo windows. Longer requests are rejected.
    pub fn with_max_undo_window(mut self, max: Duration) -> Self {
        self.max_undo_window = max;
        self
    }

    /// Validate and store a new pending action.
    ///
    /// Unknown action types and payloads that fail their schema are
    /// rejected with [`ActionError::InvalidAction`] and never stored.
    pub fn submit(&self, request: SubmitRequest) -> Result<Action, ActionError> {
        let payload = ActionPayload::parse(&request.action_type, request.payload)?;
        self.submit_payload(
            &request.account_id,
            payload,
            request.origin,
            request.undo_window,
        )
    }

    /// Store an already-validated payload as a new pending action.
    pub fn submit_payload(
        &self,
        account_id: &str,
        payload: ActionPayload,
        origin: Origin,
        undo_window: Option<Duration>,
    ) -> Result<Action, ActionError> {
        validate_account_id(account_id)?;
        if let Some(window) = undo_window {
            if window > self.max_undo_window {
                return Err(ActionError::InvalidAction(format!(
                    "undo window of {}s exceeds the maximum of {}s",
                    window.as_secs(),
                    self.max_undo_window.as_secs()
                )));
            }
        }
        let action = self.new_pending(account_id, payload, origin, undo_window, None);
        self.actions.insert(&action)?;

        info!(
            action_id = %action.id,
            account_id = %action.account_id,
            action_type = %action.action_type(),
            origin = %action.origin,
            undo_deadline = %action.undo_deadline,
            "Action submitted"
        );
        let _ = self.events.send(EngineEvent::ActionSubmitted {
            action_id: action.id,
            account_id: action.account_id.clone(),
            action_type: action.action_type(),
            undo_deadline: action.undo_deadline,
        });
        Ok(action)
    }

    /// Cancel a pending action.
    ///
    /// Returns false when the action has already left `pending`; callers
    /// should read that as "too late", not as an error.
    pub fn cancel(&self, id: Uuid, actor: Actor) -> Result<bool, ActionError> {
        let action = self.get(id)?;
        let summary = format!("cancelled {}", action.payload.digest());
        let won = self
            .transition(id, ActionState::Pending, ActionState::Undone, actor, summary)?
            .is_some();
        if !won {
            info!(action_id = %id, "Cancel arrived too late");
        }
        Ok(won)
    }

    /// Replace a pending action's payload.
    ///
    /// The original is moved to `undone` and a new action referencing it
    /// through `supersedes` is stored in the same transaction, with the
    /// same undo window length. Returns `Ok(None)` if the original is no
    /// longer pending.
    pub fn amend(
        &self,
        id: Uuid,
        payload: serde_json::Value,
        actor: Actor,
    ) -> Result<Option<Action>, ActionError> {
        let original = self.get(id)?;
        let payload = ActionPayload::parse(&original.action_type().to_string(), payload)?;
        let window = original.undo_deadline.since(original.created_at);
        let replacement = self.new_pending(
            &original.account_id,
            payload,
            original.origin,
            Some(window),
            Some(original.id),
        );

        let cancel = TransitionRequest {
            action_id: id,
            from: ActionState::Pending,
            to: ActionState::Undone,
            actor,
            result_summary: format!(
                "superseded_by {} {}",
                replacement.id,
                original.payload.digest()
            ),
            at: replacement.created_at,
        };
        let record = match self.actions.supersede(&cancel, &replacement)? {
            Some(record) => record,
            None => {
                info!(action_id = %id, "Amend arrived too late");
                return Ok(None);
            }
        };

        info!(
            action_id = %replacement.id,
            supersedes = %id,
            account_id = %replacement.account_id,
            "Action amended"
        );
        self.publish_transition(&record);
        let _ = self.events.send(EngineEvent::ActionSubmitted {
            action_id: replacement.id,
            account_id: replacement.account_id.clone(),
            action_type: replacement.action_type(),
            undo_deadline: replacement.undo_deadline,
        });
        Ok(Some(replacement))
    }

    pub fn get(&self, id: Uuid) -> Result<Action, ActionError> {
        self.actions
            .find_by_id(id)?
            .ok_or(ActionError::NotFound(id))
    }

    pub fn list(&self, filter: &ActionFilter) -> Result<Vec<Action>, ActionError> {
        Ok(self.actions.list(filter)?)
    }

    /// All actions currently in `state`, earliest deadline first.
    pub fn in_state(&self, state: ActionState) -> Result<Vec<Action>, ActionError> {
        Ok(self.actions.find_by_state(state)?)
    }

    pub fn count_executed_since(
        &self,
        account_id: &str,
        since: Timestamp,
    ) -> Result<u64, ActionError> {
        Ok(self.actions.count_executed_since(account_id, since)?)
    }

    /// Atomically move `id` from `from` to `to`, writing its audit record.
    ///
    /// Returns `Ok(None)` if the action was not in `from`. Edges outside the
    /// lifecycle graph are rejected before touching storage.
    pub fn transition(
        &self,
        id: Uuid,
        from: ActionState,
        to: ActionState,
        actor: Actor,
        result_summary: impl Into<String>,
    ) -> Result<Option<AuditRecord>, ActionError> {
        validate_transition(from, to)?;

        let request = TransitionRequest {
            action_id: id,
            from,
            to,
            actor,
            result_summary: result_summary.into(),
            at: Timestamp::now(),
        };
        let record = match self.actions.transition(&request)? {
            Some(record) => record,
            None => return Ok(None),
        };

        self.publish_transition(&record);
        Ok(Some(record))
    }

    fn new_pending(
        &self,
        account_id: &str,
        payload: ActionPayload,
        origin: Origin,
        undo_window: Option<Duration>,
        supersedes: Option<Uuid>,
    ) -> Action {
        let now = Timestamp::now();
        Action {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            payload,
            origin,
            state: ActionState::Pending,
            undo_deadline: now.plus(undo_window.unwrap_or(self.default_undo_window)),
            created_at: now,
            state_changed_at: now,
            supersedes,
        }
    }

    fn publish_transition(&self, record: &AuditRecord) {
        info!(
            action_id = %record.action_id,
            account_id = %record.account_id,
            from = %record.from_state,
            to = %record.to_state,
            actor = %record.actor,
            "Action transitioned"
        );
        let _ = self.events.send(EngineEvent::ActionTransitioned {
            action_id: record.action_id,
            account_id: record.account_id.clone(),
            from: record.from_state,
            to: record.to_state,
            timestamp: record.timestamp,
        });

        if !matches!(record.to_state, ActionState::Failed | ActionState::Expired) {
            return;
        }
        let action_type = match self.actions.find_by_id(record.action_id) {
            Ok(Some(action)) => action.action_type(),
            _ => return,
        };
        let event = if record.to_state == ActionState::Failed {
            warn!(
                action_id = %record.action_id,
                account_id = %record.account_id,
                action_type = %action_type,
                reason = %record.result_summary,
                "Action failed"
            );
            EngineEvent::ActionFailed {
                action_id: record.action_id,
                account_id: record.account_id.clone(),
                action_type,
                reason: record.result_summary.clone(),
                timestamp: record.timestamp,
            }
        } else {
            warn!(
                action_id = %record.action_id,
                account_id = %record.account_id,
                action_type = %action_type,
                "Action expired while execution was paused"
            );
            EngineEvent::ActionExpired {
                action_id: record.action_id,
                account_id: record.account_id.clone(),
                action_type,
                timestamp: record.timestamp,
            }
        };
        let _ = self.events.send(event);
    }
}

fn validate_account_id(account_id: &str) -> Result<(), ActionError> {
    if account_id.trim().is_empty() {
        return Err(ActionError::InvalidAction(
            "account_id must not be empty".to_string(),
        ));
    }
    if account_id.len() > MAX_ACCOUNT_ID_LEN {
        return Err(ActionError::InvalidAction(format!(
            "account_id exceeds {} bytes",
            MAX_ACCOUNT_ID_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use deputy_storage::AuditRepository;
    use serde_json::json;

    fn make_store() -> (ActionStore, Arc<Database>, broadcast::Receiver<EngineEvent>) {
        let db = Arc::new(Database::in_memory().unwrap());
        let (tx, rx) = broadcast::channel(64);
        let store = ActionStore::new(db.clone(), Duration::from_secs(30), tx);
        (store, db, rx)
    }

    fn archive_request(account: &str) -> SubmitRequest {
        SubmitRequest::new(
            account,
            "archive_message",
            json!({"message_id": "m-1"}),
            Origin::Human,
        )
    }

    // =========================================================================
    // Submit
    // =========================================================================

    #[test]
    fn test_submit_rejects_oversized_undo_window() {
        let (store, _db, _rx) = make_store();
        let store = store.with_max_undo_window(Duration::from_secs(3600));

        let err = store
            .submit(archive_request("acct").with_undo_window(Duration::from_secs(u64::MAX)))
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidAction(_)));
        assert!(err.to_string().contains("exceeds the maximum"));
        assert!(store.list(&ActionFilter::default()).unwrap().is_empty());

        let before = Timestamp::now();
        let action = store
            .submit(archive_request("acct").with_undo_window(Duration::from_secs(3600)))
            .unwrap();
        assert!(action.undo_deadline >= before.plus(Duration::from_secs(3600)));
    }

    #[test]
    fn test_submit_stores_pending() {
        let (store, _db, mut rx) = make_store();
        let action = store.submit(archive_request("acct")).unwrap();
        assert_eq!(action.state, ActionState::Pending);
        assert_eq!(
            action.undo_deadline.since(action.created_at),
            Duration::from_secs(30)
        );
        assert_eq!(store.get(action.id).unwrap(), action);
        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::ActionSubmitted { .. }
        ));
    }

    #[test]
    fn test_submit_custom_undo_window() {
        let (store, _db, _rx) = make_store();
        let action = store
            .submit(archive_request("acct").with_undo_window(Duration::from_millis(1500)))
            .unwrap();
        assert_eq!(
            action.undo_deadline.since(action.created_at),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_submit_unknown_type_rejected_and_not_stored() {
        let (store, _db, _rx) = make_store();
        let request = SubmitRequest::new("acct", "launch_rocket", json!({}), Origin::Human);
        let err = store.submit(request).unwrap_err();
        assert!(matches!(err, ActionError::InvalidAction(_)));
        assert!(store.list(&ActionFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_submit_bad_payload_rejected() {
        let (store, _db, _rx) = make_store();
        let request = SubmitRequest::new(
            "acct",
            "send_message",
            json!({"to": ["not-an-address"], "subject": "hi", "body": "x"}),
            Origin::Human,
        );
        assert!(matches!(
            store.submit(request),
            Err(ActionError::InvalidAction(_))
        ));
    }

    #[test]
    fn test_submit_empty_account_rejected() {
        let (store, _db, _rx) = make_store();
        assert!(matches!(
            store.submit(archive_request("  ")),
            Err(ActionError::InvalidAction(_))
        ));
    }

    // =========================================================================
    // Cancel / transition
    // =========================================================================

    #[test]
    fn test_cancel_pending() {
        let (store, db, _rx) = make_store();
        let action = store.submit(archive_request("acct")).unwrap();
        assert!(store.cancel(action.id, Actor::User).unwrap());
        assert_eq!(store.get(action.id).unwrap().state, ActionState::Undone);

        let records = AuditRepository::new(db).for_action(action.id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].actor, Actor::User);
        assert!(records[0].result_summary.starts_with("cancelled sha256:"));
    }

    #[test]
    fn test_cancel_too_late_returns_false() {
        let (store, _db, _rx) = make_store();
        let action = store.submit(archive_request("acct")).unwrap();
        store
            .transition(action.id, ActionState::Pending, ActionState::Ready, Actor::System, "")
            .unwrap()
            .unwrap();
        assert!(!store.cancel(action.id, Actor::User).unwrap());
        assert_eq!(store.get(action.id).unwrap().state, ActionState::Ready);
    }

    #[test]
    fn test_cancel_unknown_action() {
        let (store, _db, _rx) = make_store();
        assert!(matches!(
            store.cancel(Uuid::new_v4(), Actor::User),
            Err(ActionError::NotFound(_))
        ));
    }

    #[test]
    fn test_invalid_edge_rejected_without_touching_storage() {
        let (store, db, _rx) = make_store();
        let action = store.submit(archive_request("acct")).unwrap();
        let err = store
            .transition(action.id, ActionState::Pending, ActionState::Executed, Actor::System, "")
            .unwrap_err();
        assert!(matches!(err, ActionError::Transition(_)));
        assert_eq!(store.get(action.id).unwrap().state, ActionState::Pending);
        assert_eq!(AuditRepository::new(db).count().unwrap(), 0);
    }

    #[test]
    fn test_failed_transition_publishes_failure_event() {
        let (store, _db, mut rx) = make_store();
        let action = store.submit(archive_request("acct")).unwrap();
        store
            .transition(action.id, ActionState::Pending, ActionState::Ready, Actor::System, "")
            .unwrap();
        store
            .transition(
                action.id,
                ActionState::Ready,
                ActionState::Failed,
                Actor::System,
                "authorization_revoked",
            )
            .unwrap();

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::ActionFailed { reason, .. } = &event {
                assert_eq!(reason, "authorization_revoked");
                assert!(event.requires_attention());
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    // =========================================================================
    // Amend
    // =========================================================================

    #[test]
    fn test_amend_supersedes_original() {
        let (store, _db, _rx) = make_store();
        let original = store
            .submit(SubmitRequest::new(
                "acct",
                "auto_respond",
                json!({"message_id": "m-1", "body": "Thanks"}),
                Origin::Human,
            ))
            .unwrap();

        let replacement = store
            .amend(
                original.id,
                json!({"message_id": "m-1", "body": "Thanks, will reply Monday"}),
                Actor::User,
            )
            .unwrap()
            .unwrap();

        assert_eq!(replacement.supersedes, Some(original.id));
        assert_eq!(replacement.action_type(), original.action_type());
        assert_ne!(replacement.payload, original.payload);
        assert_eq!(store.get(original.id).unwrap().state, ActionState::Undone);
        // The original payload is untouched.
        assert_eq!(store.get(original.id).unwrap().payload, original.payload);
    }

    #[test]
    fn test_amend_after_ready_is_none() {
        let (store, _db, _rx) = make_store();
        let action = store.submit(archive_request("acct")).unwrap();
        store
            .transition(action.id, ActionState::Pending, ActionState::Ready, Actor::System, "")
            .unwrap();
        let result = store
            .amend(action.id, json!({"message_id": "m-2"}), Actor::User)
            .unwrap();
        assert!(result.is_none());
        assert_eq!(store.list(&ActionFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_amend_invalid_payload_keeps_original_pending() {
        let (store, _db, _rx) = make_store();
        let action = store.submit(archive_request("acct")).unwrap();
        let err = store
            .amend(action.id, json!({"message_id": ""}), Actor::User)
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidAction(_)));
        assert_eq!(store.get(action.id).unwrap().state, ActionState::Pending);
    }
}
