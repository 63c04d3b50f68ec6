use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::trust::TrustLevel;
use crate::types::{ActionState, ActionType, PauseScope, Timestamp};

/// Events broadcast by the engine after a change has been committed.
///
/// Consumed by the SSE stream and by anything that has to tell the user
/// about work that did not happen.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum EngineEvent {
    ActionSubmitted {
        action_id: Uuid,
        account_id: String,
        action_type: ActionType,
        undo_deadline: Timestamp,
    },

    ActionTransitioned {
        action_id: Uuid,
        account_id: String,
        from: ActionState,
        to: ActionState,
        timestamp: Timestamp,
    },

    /// An action ended in `failed`.
    ActionFailed {
        action_id: Uuid,
        account_id: String,
        action_type: ActionType,
        reason: String,
        timestamp: Timestamp,
    },

    /// An action aged out while execution was paused.
    ActionExpired {
        action_id: Uuid,
        account_id: String,
        action_type: ActionType,
        timestamp: Timestamp,
    },

    Paused {
        scope: PauseScope,
        reason: String,
        timestamp: Timestamp,
    },

    Resumed {
        scope: PauseScope,
        timestamp: Timestamp,
    },

    TrustChanged {
        account_id: String,
        from: TrustLevel,
        to: TrustLevel,
        timestamp: Timestamp,
    },
}

impl EngineEvent {
    /// Whether the user must be told about this event proactively.
    pub fn requires_attention(&self) -> bool {
        matches!(
            self,
            EngineEvent::ActionFailed { .. } | EngineEvent::ActionExpired { .. }
        )
    }
}
