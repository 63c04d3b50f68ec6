//! Progressive trust tiers.
//!
//! Each tier unlocks a fixed set of action types for autonomous (policy
//! driven) execution. Tiers are cumulative: a higher tier permits
//! everything below it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{ActionType, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Level 1: nothing runs autonomously.
    Observe,
    /// Level 2: inbox housekeeping.
    Organize,
    /// Level 3: canned replies to incoming messages.
    Respond,
    /// Level 4: calendar changes.
    Schedule,
    /// Level 5: outbound mail and deletion.
    Act,
}

impl TrustLevel {
    pub const MIN: TrustLevel = TrustLevel::Observe;
    pub const MAX: TrustLevel = TrustLevel::Act;

    pub const ALL: [TrustLevel; 5] = [
        TrustLevel::Observe,
        TrustLevel::Organize,
        TrustLevel::Respond,
        TrustLevel::Schedule,
        TrustLevel::Act,
    ];

    pub fn as_u8(&self) -> u8 {
        match self {
            TrustLevel::Observe => 1,
            TrustLevel::Organize => 2,
            TrustLevel::Respond => 3,
            TrustLevel::Schedule => 4,
            TrustLevel::Act => 5,
        }
    }

    pub fn from_u8(level: u8) -> Option<Self> {
        match level {
            1 => Some(TrustLevel::Observe),
            2 => Some(TrustLevel::Organize),
            3 => Some(TrustLevel::Respond),
            4 => Some(TrustLevel::Schedule),
            5 => Some(TrustLevel::Act),
            _ => None,
        }
    }

    pub fn next(&self) -> Option<Self> {
        Self::from_u8(self.as_u8() + 1)
    }

    /// Action types that first become permitted at this level.
    pub fn unlocks(&self) -> &'static [ActionType] {
        match self {
            TrustLevel::Observe => &[],
            TrustLevel::Organize => &[ActionType::LabelMessage, ActionType::ArchiveMessage],
            TrustLevel::Respond => &[ActionType::AutoRespond],
            TrustLevel::Schedule => &[ActionType::ScheduleEvent, ActionType::UpdateEvent],
            TrustLevel::Act => &[ActionType::SendMessage, ActionType::DeleteItem],
        }
    }

    /// Lowest level at which `action_type` may run autonomously.
    pub fn required_for(action_type: ActionType) -> TrustLevel {
        Self::ALL
            .into_iter()
            .find(|level| level.unlocks().contains(&action_type))
            .unwrap_or(TrustLevel::MAX)
    }

    pub fn permits(&self, action_type: ActionType) -> bool {
        Self::required_for(action_type) <= *self
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrustLevel::Observe => "observe",
            TrustLevel::Organize => "organize",
            TrustLevel::Respond => "respond",
            TrustLevel::Schedule => "schedule",
            TrustLevel::Act => "act",
        };
        write!(f, "{} ({})", self.as_u8(), name)
    }
}

/// Persisted trust state for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustState {
    pub account_id: String,
    pub level: TrustLevel,
    pub level_entered_at: Timestamp,
    /// Executed actions per type, across all levels.
    pub action_history_count: BTreeMap<ActionType, u64>,
}

impl TrustState {
    pub fn new(account_id: impl Into<String>, now: Timestamp) -> Self {
        Self {
            account_id: account_id.into(),
            level: TrustLevel::MIN,
            level_entered_at: now,
            action_history_count: BTreeMap::new(),
        }
    }

    pub fn total_actions(&self) -> u64 {
        self.action_history_count.values().sum()
    }
}
