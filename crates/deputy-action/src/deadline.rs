//! Undo/Deadline Manager.
//!
//! Keeps a min-heap of action ids keyed by the time they next need
//! attention and sleeps until the earliest one. When a pending action's
//! undo deadline passes it is promoted to `ready` and handed to the
//! executor, unless its account is paused. Paused actions are re-checked
//! every `pause_recheck` and expire once they have been held past the
//! maximum hold.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use deputy_core::config::EngineConfig;
use deputy_core::types::{Action, ActionState, Actor, Timestamp};

use crate::error::ActionError;
use crate::executor::Executor;
use crate::pause::PauseSwitch;
use crate::store::ActionStore;

// =============================================================================
// Schedule
// =============================================================================

/// Ids ordered by due time. Re-scheduling an id replaces its earlier entry.
#[derive(Default)]
struct Schedule {
    heap: BinaryHeap<Reverse<(Timestamp, Uuid)>>,
    due: HashMap<Uuid, Timestamp>,
}

impl Schedule {
    fn push(&mut self, id: Uuid, at: Timestamp) {
        self.due.insert(id, at);
        self.heap.push(Reverse((at, id)));
    }

    /// Remove and return every id due at or before `now`.
    fn pop_due(&mut self, now: Timestamp) -> Vec<Uuid> {
        let mut ready = Vec::new();
        while let Some(&Reverse((at, id))) = self.heap.peek() {
            if at > now {
                break;
            }
            self.heap.pop();
            if self.due.get(&id) == Some(&at) {
                self.due.remove(&id);
                ready.push(id);
            }
        }
        ready
    }

    fn next_due(&mut self) -> Option<Timestamp> {
        // Drop stale entries left behind by re-scheduling.
        while let Some(&Reverse((at, id))) = self.heap.peek() {
            if self.due.get(&id) == Some(&at) {
                return Some(at);
            }
            self.heap.pop();
        }
        None
    }

    fn len(&self) -> usize {
        self.due.len()
    }
}

/// Shared schedule of actions awaiting the deadline manager.
#[derive(Default)]
pub struct DispatchQueue {
    schedule: Mutex<Schedule>,
    wake: Notify,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for `id` to be processed at `at` and wake the manager.
    pub fn schedule(&self, id: Uuid, at: Timestamp) {
        self.lock().push(id, at);
        self.wake.notify_one();
    }

    /// Number of distinct actions scheduled.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop_due(&self, now: Timestamp) -> Vec<Uuid> {
        self.lock().pop_due(now)
    }

    fn next_due(&self) -> Option<Timestamp> {
        self.lock().next_due()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// =============================================================================
// DeadlineManager
// =============================================================================

pub struct DeadlineManager {
    store: Arc<ActionStore>,
    pause: Arc<PauseSwitch>,
    executor: Arc<Executor>,
    queue: Arc<DispatchQueue>,
    max_hold: Duration,
    recheck: Duration,
    idle_wakeup: Duration,
    shutdown: Notify,
}

impl DeadlineManager {
    pub fn new(
        store: Arc<ActionStore>,
        pause: Arc<PauseSwitch>,
        executor: Arc<Executor>,
        queue: Arc<DispatchQueue>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            pause,
            executor,
            queue,
            max_hold: config.max_pause_hold(),
            recheck: config.pause_recheck(),
            idle_wakeup: config.idle_wakeup(),
            shutdown: Notify::new(),
        }
    }

    /// Run until [`DeadlineManager::shutdown`] is called.
    ///
    /// Processes everything due, then sleeps until the next due entry, a
    /// new schedule, or the idle wakeup, whichever comes first.
    pub async fn run(&self) {
        info!("Deadline manager started");
        loop {
            for id in self.queue.pop_due(Timestamp::now()) {
                self.process(id);
            }

            let sleep_for = match self.queue.next_due() {
                Some(at) => at.since(Timestamp::now()).min(self.idle_wakeup),
                None => self.idle_wakeup,
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.queue.wake.notified() => {}
                _ = self.shutdown.notified() => {
                    info!("Deadline manager stopped");
                    return;
                }
            }
        }
    }

    /// Signal the run loop to exit.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Rebuild the schedule from storage after a restart.
    ///
    /// Actions found in `executing` were interrupted mid-delivery; whether
    /// the side effect happened is unknown, so they are failed rather than
    /// retried. Returns the number of actions scheduled.
    pub fn recover(&self) -> Result<usize, ActionError> {
        let mut interrupted = 0;
        for action in self.store.in_state(ActionState::Executing)? {
            let record = self.store.transition(
                action.id,
                ActionState::Executing,
                ActionState::Failed,
                Actor::System,
                "interrupted: engine stopped during delivery",
            )?;
            if record.is_some() {
                interrupted += 1;
            }
        }
        if interrupted > 0 {
            warn!(count = interrupted, "Failed actions interrupted during delivery");
        }

        let scheduled = self.rescan()?;
        info!(scheduled, "Deadline schedule recovered");
        Ok(scheduled)
    }

    /// Schedule every pending and ready action from storage.
    pub fn rescan(&self) -> Result<usize, ActionError> {
        let now = Timestamp::now();
        let pending = self.store.in_state(ActionState::Pending)?;
        let ready = self.store.in_state(ActionState::Ready)?;
        let count = pending.len() + ready.len();
        for action in pending {
            self.queue.schedule(action.id, action.undo_deadline.max(now));
        }
        for action in ready {
            self.queue.schedule(action.id, now);
        }
        Ok(count)
    }

    /// Handle one due entry.
    pub fn process(&self, id: Uuid) {
        let action = match self.store.get(id) {
            Ok(action) => action,
            Err(e) => {
                error!(action_id = %id, error = %e, "Failed to load scheduled action");
                return;
            }
        };
        let now = Timestamp::now();

        match action.state {
            ActionState::Pending if now < action.undo_deadline => {
                self.queue.schedule(id, action.undo_deadline);
            }
            ActionState::Pending | ActionState::Ready => self.promote(&action, now),
            // Cancelled, executing, or finished since it was scheduled.
            _ => debug!(action_id = %id, state = %action.state, "Scheduled action no longer waiting"),
        }
    }

    fn promote(&self, action: &Action, now: Timestamp) {
        let promoted = self.pause.run_if_clear(&action.account_id, || {
            if action.state == ActionState::Ready {
                return Ok(true);
            }
            self.store
                .transition(
                    action.id,
                    ActionState::Pending,
                    ActionState::Ready,
                    Actor::System,
                    action.payload.digest(),
                )
                .map(|record| record.is_some())
        });

        match promoted {
            Some(Ok(true)) => self.executor.dispatch(action.id),
            Some(Ok(false)) => {
                debug!(action_id = %action.id, "Action left pending before its deadline fired");
            }
            Some(Err(e)) => {
                error!(action_id = %action.id, error = %e, "Promotion failed; will retry");
                self.queue.schedule(action.id, now.plus(self.recheck));
            }
            None => self.hold(action, now),
        }
    }

    fn hold(&self, action: &Action, now: Timestamp) {
        let limit = action.undo_deadline.plus(self.max_hold);
        if now < limit {
            debug!(action_id = %action.id, account_id = %action.account_id, "Action held by pause");
            self.queue.schedule(action.id, now.plus(self.recheck).min(limit));
            return;
        }

        let summary = format!(
            "pause_hold_exceeded held_ms={}",
            now.since(action.undo_deadline).as_millis()
        );
        if let Err(e) = self.store.transition(
            action.id,
            action.state,
            ActionState::Expired,
            Actor::System,
            summary,
        ) {
            error!(action_id = %action.id, error = %e, "Expiry failed; will retry");
            self.queue.schedule(action.id, now.plus(self.recheck));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Schedule
    // =========================================================================

    #[test]
    fn test_pop_due_in_deadline_order() {
        let mut schedule = Schedule::default();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        schedule.push(a, Timestamp(30));
        schedule.push(b, Timestamp(10));
        schedule.push(c, Timestamp(20));

        assert_eq!(schedule.next_due(), Some(Timestamp(10)));
        assert_eq!(schedule.pop_due(Timestamp(25)), vec![b, c]);
        assert_eq!(schedule.len(), 1);
        assert!(schedule.pop_due(Timestamp(29)).is_empty());
        assert_eq!(schedule.pop_due(Timestamp(30)), vec![a]);
        assert_eq!(schedule.next_due(), None);
    }

    #[test]
    fn test_reschedule_replaces_entry() {
        let mut schedule = Schedule::default();
        let id = Uuid::new_v4();
        schedule.push(id, Timestamp(10));
        schedule.push(id, Timestamp(50));

        assert_eq!(schedule.len(), 1);
        assert_eq!(schedule.next_due(), Some(Timestamp(50)));
        assert!(schedule.pop_due(Timestamp(20)).is_empty());
        assert_eq!(schedule.pop_due(Timestamp(50)), vec![id]);
    }

    #[test]
    fn test_reschedule_earlier() {
        let mut schedule = Schedule::default();
        let id = Uuid::new_v4();
        schedule.push(id, Timestamp(50));
        schedule.push(id, Timestamp(5));
        assert_eq!(schedule.pop_due(Timestamp(5)), vec![id]);
        // The stale later entry does not fire again.
        assert!(schedule.pop_due(Timestamp(100)).is_empty());
    }

    #[test]
    fn test_queue_len() {
        let queue = DispatchQueue::new();
        assert!(queue.is_empty());
        queue.schedule(Uuid::new_v4(), Timestamp(1));
        queue.schedule(Uuid::new_v4(), Timestamp(2));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_due(Timestamp(1)).len(), 1);
        assert_eq!(queue.len(), 1);
    }
}
