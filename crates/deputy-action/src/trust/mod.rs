//! Trust Gate: per-account autonomy levels.
//!
//! A level only ever rises through [`TrustGate::advance_level`], one step at
//! a time, after an explicit user confirmation. It falls through a user
//! downgrade or an emergency reset.

pub mod state_machine;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use deputy_core::config::TrustConfig;
use deputy_core::events::EngineEvent;
use deputy_core::trust::{TrustLevel, TrustState};
use deputy_core::types::{ActionType, Timestamp};
use deputy_storage::{ActionRepository, Database, TrustChange, TrustRepository};

use crate::error::TrustError;
pub use state_machine::{Eligibility, TrustTransition};

/// The user's answer to an upgrade prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub confirmed: bool,
    #[serde(default)]
    pub confirmed_by: Option<String>,
}

impl Confirmation {
    pub fn yes() -> Self {
        Self {
            confirmed: true,
            confirmed_by: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrustStatus {
    pub state: TrustState,
    pub eligibility: Eligibility,
}

pub struct TrustGate {
    levels: TrustRepository,
    actions: ActionRepository,
    config: TrustConfig,
    events: broadcast::Sender<EngineEvent>,
}

impl TrustGate {
    pub fn new(
        db: Arc<Database>,
        config: TrustConfig,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            levels: TrustRepository::new(db.clone()),
            actions: ActionRepository::new(db),
            config,
            events,
        }
    }

    /// Current state, creating the account at level 1 on first sight.
    pub fn ensure_account(&self, account_id: &str) -> Result<TrustState, TrustError> {
        Ok(self.levels.ensure(account_id, Timestamp::now())?)
    }

    pub fn status(&self, account_id: &str) -> Result<TrustStatus, TrustError> {
        let state = self.ensure_account(account_id)?;
        let eligibility = self.eligibility_for(&state, Timestamp::now())?;
        Ok(TrustStatus { state, eligibility })
    }

    /// Read-only check of the next level's thresholds.
    pub fn check_upgrade_eligibility(&self, account_id: &str) -> Result<Eligibility, TrustError> {
        let now = Timestamp::now();
        let state = self
            .levels
            .get(account_id)?
            .unwrap_or_else(|| TrustState::new(account_id, now));
        self.eligibility_for(&state, now)
    }

    /// Move the account up exactly one level.
    ///
    /// Requires a positive confirmation and a passing eligibility check at
    /// the moment of the change.
    pub fn advance_level(
        &self,
        account_id: &str,
        confirmation: &Confirmation,
    ) -> Result<TrustChange, TrustError> {
        if !confirmation.confirmed {
            return Err(TrustError::NotConfirmed);
        }
        let now = Timestamp::now();
        let state = self.levels.ensure(account_id, now)?;
        let eligibility = self.eligibility_for(&state, now)?;
        let change = self.apply(&state, TrustTransition::Advance(eligibility), now)?;
        info!(
            account_id = %account_id,
            level = %change.to,
            confirmed_by = ?confirmation.confirmed_by,
            "Trust level advanced"
        );
        Ok(change)
    }

    /// Lower the account to `level`. Takes effect for the next authorization check.
    pub fn downgrade(&self, account_id: &str, level: u8) -> Result<TrustChange, TrustError> {
        let target = TrustLevel::from_u8(level)
            .ok_or_else(|| TrustError::InvalidLevel(format!("{} is not in 1..=5", level)))?;
        let now = Timestamp::now();
        let state = self.levels.ensure(account_id, now)?;
        let change = self.apply(&state, TrustTransition::Downgrade(target), now)?;
        info!(account_id = %account_id, level = %change.to, "Trust level downgraded");
        Ok(change)
    }

    /// Drop the account to level 1. A no-op for accounts already there.
    pub fn force_reset(&self, account_id: &str) -> Result<Option<TrustChange>, TrustError> {
        let now = Timestamp::now();
        let state = self.levels.ensure(account_id, now)?;
        self.reset_state(&state, now)
    }

    /// Drop every known account to level 1.
    pub fn force_reset_all(&self) -> Result<Vec<TrustChange>, TrustError> {
        let now = Timestamp::now();
        let mut changes = Vec::new();
        for state in self.levels.list()? {
            if let Some(change) = self.reset_state(&state, now)? {
                changes.push(change);
            }
        }
        Ok(changes)
    }

    /// Whether `action_type` may run autonomously for the account right now.
    ///
    /// Fails closed: a storage error denies.
    pub fn is_authorized(&self, account_id: &str, action_type: ActionType) -> bool {
        match self.levels.get(account_id) {
            Ok(Some(state)) => state.level.permits(action_type),
            Ok(None) => TrustLevel::MIN.permits(action_type),
            Err(e) => {
                error!(account_id = %account_id, error = %e, "Trust lookup failed; denying");
                false
            }
        }
    }

    pub fn record_execution(
        &self,
        account_id: &str,
        action_type: ActionType,
    ) -> Result<(), TrustError> {
        Ok(self.levels.increment_action_count(account_id, action_type)?)
    }

    pub fn history(&self, account_id: &str) -> Result<Vec<TrustChange>, TrustError> {
        Ok(self.levels.history(account_id)?)
    }

    fn reset_state(
        &self,
        state: &TrustState,
        now: Timestamp,
    ) -> Result<Option<TrustChange>, TrustError> {
        if state.level == TrustLevel::MIN {
            return Ok(None);
        }
        let change = self.apply(state, TrustTransition::EmergencyReset, now)?;
        warn!(account_id = %state.account_id, from = %change.from, "Trust level reset by emergency pause");
        Ok(Some(change))
    }

    fn eligibility_for(&self, state: &TrustState, now: Timestamp) -> Result<Eligibility, TrustError> {
        let actions = self
            .actions
            .count_executed_since(&state.account_id, state.level_entered_at)?;
        Ok(state_machine::eligibility(state, actions, &self.config, now))
    }

    fn apply(
        &self,
        state: &TrustState,
        transition: TrustTransition,
        now: Timestamp,
    ) -> Result<TrustChange, TrustError> {
        let to = state_machine::apply(state, &transition)?;
        let change = TrustChange {
            account_id: state.account_id.clone(),
            from: state.level,
            to,
            reason: transition.reason().to_string(),
            changed_at: now,
        };
        if !self.levels.set_level(&change)? {
            return Err(TrustError::Conflict {
                account_id: state.account_id.clone(),
                expected: state.level,
            });
        }
        let _ = self.events.send(EngineEvent::TrustChanged {
            account_id: change.account_id.clone(),
            from: change.from,
            to: change.to,
            timestamp: now,
        });
        Ok(change)
    }
}
