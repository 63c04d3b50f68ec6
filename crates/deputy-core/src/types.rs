//! Core types and value objects shared by every Deputy crate.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payload::ActionPayload;

// =============================================================================
// Timestamp
// =============================================================================

/// Millisecond-precision UTC timestamp.
///
/// Stored as an INTEGER column in SQLite and compared directly by the
/// deadline dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0).unwrap_or_default()
    }

    /// `self + d`, saturating at `i64::MAX`.
    pub fn plus(&self, d: Duration) -> Self {
        let millis = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// Elapsed time from `earlier` to `self`, zero if `earlier` is later.
    pub fn since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0).max(0) as u64)
    }

    /// Whole days elapsed between `self` and `now`.
    pub fn age_days(&self, now: Timestamp) -> u32 {
        (now.since(*self).as_secs() / 86_400) as u32
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Action lifecycle states.
///
/// `Undone`, `Executed`, `Failed` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Pending,
    Undone,
    Ready,
    Executing,
    Executed,
    Failed,
    Expired,
}

impl ActionState {
    pub const ALL: [ActionState; 7] = [
        ActionState::Pending,
        ActionState::Undone,
        ActionState::Ready,
        ActionState::Executing,
        ActionState::Executed,
        ActionState::Failed,
        ActionState::Expired,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionState::Undone | ActionState::Executed | ActionState::Failed | ActionState::Expired
        )
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionState::Pending => write!(f, "pending"),
            ActionState::Undone => write!(f, "undone"),
            ActionState::Ready => write!(f, "ready"),
            ActionState::Executing => write!(f, "executing"),
            ActionState::Executed => write!(f, "executed"),
            ActionState::Failed => write!(f, "failed"),
            ActionState::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for ActionState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ActionState::Pending),
            "undone" => Ok(ActionState::Undone),
            "ready" => Ok(ActionState::Ready),
            "executing" => Ok(ActionState::Executing),
            "executed" => Ok(ActionState::Executed),
            "failed" => Ok(ActionState::Failed),
            "expired" => Ok(ActionState::Expired),
            _ => Err(format!("Unknown action state: {}", s)),
        }
    }
}

/// Kinds of work the engine can carry out on a user's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    LabelMessage,
    ArchiveMessage,
    AutoRespond,
    ScheduleEvent,
    UpdateEvent,
    SendMessage,
    DeleteItem,
}

impl ActionType {
    pub const ALL: [ActionType; 7] = [
        ActionType::LabelMessage,
        ActionType::ArchiveMessage,
        ActionType::AutoRespond,
        ActionType::ScheduleEvent,
        ActionType::UpdateEvent,
        ActionType::SendMessage,
        ActionType::DeleteItem,
    ];
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionType::LabelMessage => write!(f, "label_message"),
            ActionType::ArchiveMessage => write!(f, "archive_message"),
            ActionType::AutoRespond => write!(f, "auto_respond"),
            ActionType::ScheduleEvent => write!(f, "schedule_event"),
            ActionType::UpdateEvent => write!(f, "update_event"),
            ActionType::SendMessage => write!(f, "send_message"),
            ActionType::DeleteItem => write!(f, "delete_item"),
        }
    }
}

impl std::str::FromStr for ActionType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "label_message" => Ok(ActionType::LabelMessage),
            "archive_message" => Ok(ActionType::ArchiveMessage),
            "auto_respond" => Ok(ActionType::AutoRespond),
            "schedule_event" => Ok(ActionType::ScheduleEvent),
            "update_event" => Ok(ActionType::UpdateEvent),
            "send_message" => Ok(ActionType::SendMessage),
            "delete_item" => Ok(ActionType::DeleteItem),
            _ => Err(format!("Unknown action type: {}", s)),
        }
    }
}

/// Who requested an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Origin {
    Human,
    Policy { policy_id: Uuid },
}

impl Origin {
    pub fn policy_id(&self) -> Option<Uuid> {
        match self {
            Origin::Human => None,
            Origin::Policy { policy_id } => Some(*policy_id),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Human => write!(f, "human"),
            Origin::Policy { policy_id } => write!(f, "policy:{}", policy_id),
        }
    }
}

/// Who caused a state transition. Recorded on every audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    User,
    System,
    Policy { policy_id: Uuid },
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::User => write!(f, "user"),
            Actor::System => write!(f, "system"),
            Actor::Policy { policy_id } => write!(f, "policy:{}", policy_id),
        }
    }
}

impl std::str::FromStr for Actor {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Actor::User),
            "system" => Ok(Actor::System),
            other => match other.strip_prefix("policy:") {
                Some(id) => Uuid::parse_str(id)
                    .map(|policy_id| Actor::Policy { policy_id })
                    .map_err(|e| format!("Invalid policy actor '{}': {}", s, e)),
                None => Err(format!("Unknown actor: {}", s)),
            },
        }
    }
}

// =============================================================================
// Domain Structs
// =============================================================================

/// A unit of work requested on a user's behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    pub account_id: String,
    pub payload: ActionPayload,
    pub origin: Origin,
    pub state: ActionState,
    pub undo_deadline: Timestamp,
    pub created_at: Timestamp,
    pub state_changed_at: Timestamp,
    /// The action this one replaced, if it was created by an amendment.
    pub supersedes: Option<Uuid>,
}

impl Action {
    pub fn action_type(&self) -> ActionType {
        self.payload.action_type()
    }
}

/// Scope of an emergency pause.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "account_id", rename_all = "snake_case")]
pub enum PauseScope {
    Global,
    Account(String),
}

impl PauseScope {
    /// Storage key for the scope.
    pub fn key(&self) -> String {
        match self {
            PauseScope::Global => "global".to_string(),
            PauseScope::Account(id) => format!("account:{}", id),
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        if key == "global" {
            return Some(PauseScope::Global);
        }
        key.strip_prefix("account:")
            .map(|id| PauseScope::Account(id.to_string()))
    }

    /// Whether this scope covers the given account.
    pub fn covers(&self, account_id: &str) -> bool {
        match self {
            PauseScope::Global => true,
            PauseScope::Account(id) => id == account_id,
        }
    }
}

impl fmt::Display for PauseScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Persisted state of one pause switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseState {
    pub scope: PauseScope,
    pub paused: bool,
    pub paused_at: Option<Timestamp>,
    pub paused_by: Option<String>,
    pub reason: Option<String>,
}

impl PauseState {
    pub fn clear(scope: PauseScope) -> Self {
        Self {
            scope,
            paused: false,
            paused_at: None,
            paused_by: None,
            reason: None,
        }
    }
}
