//! Emergency Pause Switch.
//!
//! Switch state lives in memory behind a read-write lock and is persisted
//! on every change. Transitions into `ready` or `executing` run under the
//! read lock via [`PauseSwitch::run_if_clear`], so once [`PauseSwitch::pause`]
//! returns no such transition can start for the covered accounts.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{info, warn};

use deputy_core::error::DeputyError;
use deputy_core::types::{PauseScope, PauseState, Timestamp};
use deputy_storage::{Database, PauseRepository};

pub struct PauseSwitch {
    active: RwLock<HashMap<PauseScope, PauseState>>,
    repo: PauseRepository,
}

impl PauseSwitch {
    /// Load persisted switches; anything paused before a restart stays paused.
    pub fn load(db: Arc<Database>) -> Result<Self, DeputyError> {
        let repo = PauseRepository::new(db);
        let active: HashMap<_, _> = repo
            .load_all()?
            .into_iter()
            .filter(|s| s.paused)
            .map(|s| (s.scope.clone(), s))
            .collect();
        if !active.is_empty() {
            warn!(count = active.len(), "Pause switches restored from storage");
        }
        Ok(Self {
            active: RwLock::new(active),
            repo,
        })
    }

    /// Set a switch. Re-pausing an active scope updates its reason.
    pub fn pause(
        &self,
        scope: PauseScope,
        reason: &str,
        paused_by: Option<String>,
    ) -> Result<PauseState, DeputyError> {
        let state = PauseState {
            scope: scope.clone(),
            paused: true,
            paused_at: Some(Timestamp::now()),
            paused_by,
            reason: Some(reason.to_string()),
        };

        let mut active = self.write();
        self.repo.save(&state)?;
        active.insert(scope.clone(), state.clone());
        drop(active);

        warn!(scope = %scope, reason = %reason, "Execution paused");
        Ok(state)
    }

    /// Clear a switch. Returns false if it was not set.
    pub fn resume(&self, scope: &PauseScope) -> Result<bool, DeputyError> {
        let mut active = self.write();
        if !active.contains_key(scope) {
            return Ok(false);
        }
        self.repo.save(&PauseState::clear(scope.clone()))?;
        active.remove(scope);
        drop(active);

        info!(scope = %scope, "Execution resumed");
        Ok(true)
    }

    /// Whether execution is halted for `account_id`, globally or per account.
    pub fn is_paused(&self, account_id: &str) -> bool {
        covers(&self.read(), account_id)
    }

    /// Run `f` only if `account_id` is not paused, holding the switch steady
    /// for the duration. Returns `None` without calling `f` when paused.
    pub fn run_if_clear<R>(&self, account_id: &str, f: impl FnOnce() -> R) -> Option<R> {
        let active = self.read();
        if covers(&active, account_id) {
            return None;
        }
        Some(f())
    }

    /// Active switches.
    pub fn status(&self) -> Vec<PauseState> {
        let mut states: Vec<_> = self.read().values().cloned().collect();
        states.sort_by_key(|s| s.scope.key());
        states
    }

    // A poisoned lock still holds valid switch state; keep honouring it.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<PauseScope, PauseState>> {
        self.active.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<PauseScope, PauseState>> {
        self.active.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn covers(active: &HashMap<PauseScope, PauseState>, account_id: &str) -> bool {
    active.keys().any(|scope| scope.covers(account_id))
}
