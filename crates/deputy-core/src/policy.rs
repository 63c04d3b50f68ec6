//! Policy rules and the triggering events they are evaluated against.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ActionType, Timestamp};

/// Kinds of events emitted by channel and calendar watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    NewMessage,
    CalendarChange,
    TimeTick,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::NewMessage => write!(f, "new_message"),
            TriggerKind::CalendarChange => write!(f, "calendar_change"),
            TriggerKind::TimeTick => write!(f, "time_tick"),
        }
    }
}

/// An event from a trigger source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event_type: TriggerKind,
    pub account_id: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default = "Timestamp::now")]
    pub occurred_at: Timestamp,
}

impl TriggerEvent {
    pub fn new(event_type: TriggerKind, account_id: impl Into<String>) -> Self {
        Self {
            event_type,
            account_id: account_id.into(),
            fields: BTreeMap::new(),
            occurred_at: Timestamp::now(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Structured predicate over a triggering event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Always,
    EventType { event_type: TriggerKind },
    FieldEquals { field: String, value: String },
    /// Case-insensitive substring match.
    FieldContains { field: String, value: String },
    /// Regular-expression match.
    FieldMatches { field: String, pattern: String },
    FieldExists { field: String },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

/// How to build an action from a matching event.
///
/// String values in `payload` may reference event fields as `{field}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub action_type: ActionType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A condition → action rule owned by one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: Uuid,
    pub account_id: String,
    pub name: String,
    pub conditions: Condition,
    pub action_template: ActionTemplate,
    /// Higher is evaluated first.
    pub priority: i32,
    pub enabled: bool,
    pub created_at: Timestamp,
}
