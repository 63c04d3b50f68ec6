//! Executor: performs the side effect of ready actions.
//!
//! Each action gets at most one delivery attempt. Before delivering, the
//! executor re-checks the trust level for policy-origin actions and moves
//! the action to `executing`, both under the pause switch, so a pause that
//! lands first keeps the action in `ready`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use deputy_core::config::EngineConfig;
use deputy_core::types::{Action, ActionState, Actor, Origin, Timestamp};

use crate::deadline::DispatchQueue;
use crate::error::{ActionError, DeliveryError};
use crate::handler::DeliveryRegistry;
use crate::pause::PauseSwitch;
use crate::store::ActionStore;
use crate::trust::TrustGate;

const FINISH_ATTEMPTS: u32 = 3;

/// Outcome of one call to [`Executor::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Executed { reference: String },
    Failed { reason: String },
    /// Still `ready`; rescheduled because of a pause or a failed audit write.
    Deferred,
    /// Not `ready` any more, or the executor is shutting down.
    Skipped,
}

enum Claim {
    Started,
    Unauthorized,
    /// Someone else moved the action out of `ready` first.
    Lost,
}

pub struct Executor {
    store: Arc<ActionStore>,
    trust: Arc<TrustGate>,
    pause: Arc<PauseSwitch>,
    registry: DeliveryRegistry,
    queue: Arc<DispatchQueue>,
    permits: Arc<Semaphore>,
    parallelism: usize,
    account_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    serialize_per_account: bool,
    delivery_timeout: Duration,
    recheck: Duration,
}

impl Executor {
    pub fn new(
        store: Arc<ActionStore>,
        trust: Arc<TrustGate>,
        pause: Arc<PauseSwitch>,
        registry: DeliveryRegistry,
        queue: Arc<DispatchQueue>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            trust,
            pause,
            registry,
            queue,
            permits: Arc::new(Semaphore::new(config.executor_parallelism)),
            parallelism: config.executor_parallelism,
            account_locks: Mutex::new(HashMap::new()),
            serialize_per_account: config.serialize_per_account,
            delivery_timeout: config.delivery_timeout(),
            recheck: config.pause_recheck(),
        }
    }

    /// Execute `id` on a background task.
    pub fn dispatch(self: &Arc<Self>, id: Uuid) {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            executor.execute(id).await;
        });
    }

    /// Run one ready action through delivery.
    ///
    /// With per-account serialization the account lock is taken before an
    /// executor permit, so actions queued behind a busy account hold no
    /// permit while they wait.
    pub async fn execute(&self, id: Uuid) -> ExecutionResult {
        if !self.serialize_per_account {
            return self.execute_with_permit(id).await;
        }

        let account_id = match self.store.get(id) {
            Ok(action) => action.account_id,
            Err(e) => {
                error!(action_id = %id, error = %e, "Failed to load action for execution");
                return ExecutionResult::Skipped;
            }
        };
        let lock = self.account_lock(&account_id);
        let guard = Arc::clone(&lock).lock_owned().await;
        let result = self.execute_with_permit(id).await;
        drop(guard);
        self.release_account_lock(&account_id, lock);
        result
    }

    async fn execute_with_permit(&self, id: Uuid) -> ExecutionResult {
        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                debug!(action_id = %id, "Executor closed; leaving action ready");
                return ExecutionResult::Skipped;
            }
        };

        // Reload: the state may have moved while waiting.
        let action = match self.store.get(id) {
            Ok(action) if action.state == ActionState::Ready => action,
            Ok(action) => {
                debug!(action_id = %id, state = %action.state, "Action not ready; skipping");
                return ExecutionResult::Skipped;
            }
            Err(e) => {
                error!(action_id = %id, error = %e, "Failed to reload action");
                return ExecutionResult::Skipped;
            }
        };

        match self.pause.run_if_clear(&action.account_id, || self.claim(&action)) {
            Some(Ok(Claim::Started)) => {}
            Some(Ok(Claim::Unauthorized)) => return self.revoke(&action),
            Some(Ok(Claim::Lost)) => return ExecutionResult::Skipped,
            Some(Err(e)) => {
                error!(action_id = %id, error = %e, "Could not start execution; will retry");
                self.defer(id);
                return ExecutionResult::Deferred;
            }
            None => {
                debug!(action_id = %id, "Execution paused; action stays ready");
                self.defer(id);
                return ExecutionResult::Deferred;
            }
        }

        let outcome = match tokio::time::timeout(
            self.delivery_timeout,
            self.registry.deliver(&action.payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.delivery_timeout.as_secs())),
        };

        match outcome {
            Ok(receipt) => {
                let summary = format!("delivered ref={}", receipt.reference);
                if self.finish(&action, ActionState::Executed, summary).await {
                    if let Err(e) = self
                        .trust
                        .record_execution(&action.account_id, action.action_type())
                    {
                        warn!(action_id = %id, error = %e, "Failed to count executed action");
                    }
                }
                info!(
                    action_id = %id,
                    account_id = %action.account_id,
                    reference = %receipt.reference,
                    "Action executed"
                );
                ExecutionResult::Executed {
                    reference: receipt.reference,
                }
            }
            Err(e) => {
                let reason = format!("delivery_error: {}", e);
                self.finish(&action, ActionState::Failed, reason.clone()).await;
                ExecutionResult::Failed { reason }
            }
        }
    }

    /// Wait for in-flight deliveries and refuse new ones.
    pub async fn drain(&self) {
        match self.permits.acquire_many(self.parallelism as u32).await {
            Ok(permits) => {
                self.permits.close();
                drop(permits);
            }
            Err(_) => self.permits.close(),
        }
        info!("Executor drained");
    }

    // Runs under the pause read lock: a pause, and the trust reset that
    // follows it, cannot land between the authorization check and the claim.
    fn claim(&self, action: &Action) -> Result<Claim, ActionError> {
        if let Origin::Policy { .. } = action.origin {
            if !self.trust.is_authorized(&action.account_id, action.action_type()) {
                return Ok(Claim::Unauthorized);
            }
        }
        let started = self.store.transition(
            action.id,
            ActionState::Ready,
            ActionState::Executing,
            Actor::System,
            action.payload.digest(),
        )?;
        Ok(if started.is_some() {
            Claim::Started
        } else {
            Claim::Lost
        })
    }

    fn revoke(&self, action: &Action) -> ExecutionResult {
        let reason = "authorization_revoked".to_string();
        match self.store.transition(
            action.id,
            ActionState::Ready,
            ActionState::Failed,
            Actor::System,
            reason.as_str(),
        ) {
            Ok(Some(_)) => ExecutionResult::Failed { reason },
            Ok(None) => ExecutionResult::Skipped,
            Err(e) => {
                error!(action_id = %action.id, error = %e, "Could not fail unauthorized action; will retry");
                self.defer(action.id);
                ExecutionResult::Deferred
            }
        }
    }

    // The side effect has happened (or definitively failed); retry the
    // closing transition a few times before leaving it to restart recovery.
    // Returns whether this call committed the outcome.
    async fn finish(&self, action: &Action, to: ActionState, summary: String) -> bool {
        for attempt in 1..=FINISH_ATTEMPTS {
            match self.store.transition(
                action.id,
                ActionState::Executing,
                to,
                Actor::System,
                summary.as_str(),
            ) {
                Ok(Some(_)) => return true,
                Ok(None) => {
                    warn!(
                        action_id = %action.id,
                        to = %to,
                        "Action left executing elsewhere; outcome not recorded"
                    );
                    return false;
                }
                Err(ActionError::AuditWriteFailure(e)) if attempt < FINISH_ATTEMPTS => {
                    warn!(action_id = %action.id, attempt, error = %e, "Audit write failed; retrying");
                    tokio::time::sleep(self.recheck).await;
                }
                Err(e) => {
                    error!(
                        action_id = %action.id,
                        to = %to,
                        error = %e,
                        "Could not record execution outcome"
                    );
                    return false;
                }
            }
        }
        false
    }

    fn defer(&self, id: Uuid) {
        self.queue.schedule(id, Timestamp::now().plus(self.recheck));
    }

    fn account_lock(&self, account_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.account_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(account_id.to_string()).or_default())
    }

    // Clones are only handed out under the map mutex, so a count of one
    // seen here means no task holds or waits on the lock.
    fn release_account_lock(&self, account_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.account_locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(lock);
        if locks
            .get(account_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(account_id);
        }
    }

    #[cfg(test)]
    fn tracked_accounts(&self) -> usize {
        self.account_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{DeliveryClient, DeliveryReceipt};
    use async_trait::async_trait;
    use deputy_core::payload::ActionPayload;
    use deputy_storage::Database;
    use tokio::sync::broadcast;

    struct Recording {
        fail: bool,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl DeliveryClient for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deliver(&self, _payload: &ActionPayload) -> Result<DeliveryReceipt, DeliveryError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.fail {
                Err(DeliveryError::Provider("mailbox unavailable".to_string()))
            } else {
                Ok(DeliveryReceipt {
                    reference: "ref-1".to_string(),
                })
            }
        }
    }

    struct Fixture {
        store: Arc<ActionStore>,
        trust: Arc<TrustGate>,
        pause: Arc<PauseSwitch>,
        executor: Executor,
        client: Arc<Recording>,
        queue: Arc<DispatchQueue>,
    }

    fn fixture(fail: bool) -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        let (tx, _) = broadcast::channel(64);
        let config = EngineConfig::default();
        let store = Arc::new(ActionStore::new(db.clone(), Duration::from_secs(0), tx.clone()));
        let trust = Arc::new(TrustGate::new(db.clone(), Default::default(), tx));
        let pause = Arc::new(PauseSwitch::load(db).unwrap());
        let client = Arc::new(Recording {
            fail,
            calls: Default::default(),
        });
        let registry = DeliveryRegistry::new().with_fallback(client.clone());
        let queue = Arc::new(DispatchQueue::new());
        let executor = Executor::new(
            store.clone(),
            trust.clone(),
            pause.clone(),
            registry,
            queue.clone(),
            &config,
        );
        Fixture {
            store,
            trust,
            pause,
            executor,
            client,
            queue,
        }
    }

    fn ready_action(f: &Fixture, origin: Origin) -> Uuid {
        ready_action_for(f, "acct", origin)
    }

    fn ready_action_for(f: &Fixture, account: &str, origin: Origin) -> Uuid {
        let action = f
            .store
            .submit(crate::store::SubmitRequest::new(
                account,
                "archive_message",
                serde_json::json!({"message_id": "m-1"}),
                origin,
            ))
            .unwrap();
        f.store
            .transition(action.id, ActionState::Pending, ActionState::Ready, Actor::System, "")
            .unwrap()
            .unwrap();
        action.id
    }

    /// Executor over the fixture's store and switches with another client.
    fn executor_with(
        f: &Fixture,
        client: Arc<dyn DeliveryClient>,
        config: &EngineConfig,
    ) -> Executor {
        Executor::new(
            f.store.clone(),
            f.trust.clone(),
            f.pause.clone(),
            DeliveryRegistry::new().with_fallback(client),
            f.queue.clone(),
            config,
        )
    }

    /// Holds the first delivery until `release` gets a permit.
    struct Gated {
        release: Semaphore,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl DeliveryClient for Gated {
        fn name(&self) -> &str {
            "gated"
        }

        async fn deliver(&self, _payload: &ActionPayload) -> Result<DeliveryReceipt, DeliveryError> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                let _ = self.release.acquire().await;
            }
            Ok(DeliveryReceipt {
                reference: format!("ref-{}", n),
            })
        }
    }

    /// Moves the action out of `executing` while delivering, the way
    /// restart recovery would.
    struct Interrupted {
        store: Arc<ActionStore>,
        id: Uuid,
    }

    #[async_trait]
    impl DeliveryClient for Interrupted {
        fn name(&self) -> &str {
            "interrupted"
        }

        async fn deliver(&self, _payload: &ActionPayload) -> Result<DeliveryReceipt, DeliveryError> {
            self.store
                .transition(
                    self.id,
                    ActionState::Executing,
                    ActionState::Failed,
                    Actor::System,
                    "interrupted",
                )
                .unwrap()
                .unwrap();
            Ok(DeliveryReceipt {
                reference: "ref-late".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_execute_delivers_once() {
        let f = fixture(false);
        let id = ready_action(&f, Origin::Human);

        let result = f.executor.execute(id).await;
        assert_eq!(
            result,
            ExecutionResult::Executed {
                reference: "ref-1".to_string()
            }
        );
        assert_eq!(f.store.get(id).unwrap().state, ActionState::Executed);

        // A second attempt finds nothing to do.
        assert_eq!(f.executor.execute(id).await, ExecutionResult::Skipped);
        assert_eq!(f.client.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        let state = f.trust.ensure_account("acct").unwrap();
        assert_eq!(state.total_actions(), 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_terminal() {
        let f = fixture(true);
        let id = ready_action(&f, Origin::Human);

        match f.executor.execute(id).await {
            ExecutionResult::Failed { reason } => {
                assert!(reason.starts_with("delivery_error:"));
                assert!(reason.contains("mailbox unavailable"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(f.store.get(id).unwrap().state, ActionState::Failed);
    }

    #[tokio::test]
    async fn test_paused_account_is_deferred() {
        let f = fixture(false);
        let id = ready_action(&f, Origin::Human);
        f.pause
            .pause(deputy_core::types::PauseScope::Global, "stop", None)
            .unwrap();

        assert_eq!(f.executor.execute(id).await, ExecutionResult::Deferred);
        assert_eq!(f.store.get(id).unwrap().state, ActionState::Ready);
        assert_eq!(f.client.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_policy_action_fails() {
        let f = fixture(false);
        let id = ready_action(
            &f,
            Origin::Policy {
                policy_id: Uuid::new_v4(),
            },
        );

        // The account is at level 1, which permits nothing autonomously.
        assert_eq!(
            f.executor.execute(id).await,
            ExecutionResult::Failed {
                reason: "authorization_revoked".to_string()
            }
        );
        assert_eq!(f.client.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drain_rejects_new_work() {
        let f = fixture(false);
        let id = ready_action(&f, Origin::Human);
        f.executor.drain().await;
        assert_eq!(f.executor.execute(id).await, ExecutionResult::Skipped);
        assert_eq!(f.store.get(id).unwrap().state, ActionState::Ready);
    }

    // =========================================================================
    // Claim under the pause switch
    // =========================================================================

    #[tokio::test]
    async fn test_paused_policy_action_stays_ready_until_resume() {
        let f = fixture(false);
        let id = ready_action(
            &f,
            Origin::Policy {
                policy_id: Uuid::new_v4(),
            },
        );
        f.pause
            .pause(deputy_core::types::PauseScope::Global, "stop", None)
            .unwrap();

        // The trust check runs with the claim, so a pause holds the action
        // instead of failing it.
        assert_eq!(f.executor.execute(id).await, ExecutionResult::Deferred);
        assert_eq!(f.store.get(id).unwrap().state, ActionState::Ready);

        f.pause
            .resume(&deputy_core::types::PauseScope::Global)
            .unwrap();
        assert_eq!(
            f.executor.execute(id).await,
            ExecutionResult::Failed {
                reason: "authorization_revoked".to_string()
            }
        );
        assert_eq!(f.store.get(id).unwrap().state, ActionState::Failed);
        assert_eq!(f.client.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    // =========================================================================
    // Outcome recording
    // =========================================================================

    #[tokio::test]
    async fn test_uncommitted_outcome_is_not_counted() {
        let f = fixture(false);
        let id = ready_action(&f, Origin::Human);
        let client = Arc::new(Interrupted {
            store: f.store.clone(),
            id,
        });
        let executor = executor_with(&f, client, &EngineConfig::default());

        let result = executor.execute(id).await;
        assert!(matches!(result, ExecutionResult::Executed { .. }));

        let action = f.store.get(id).unwrap();
        assert_eq!(action.state, ActionState::Failed);
        let state = f.trust.ensure_account("acct").unwrap();
        assert_eq!(state.total_actions(), 0);
    }

    // =========================================================================
    // Per-account serialization
    // =========================================================================

    #[tokio::test]
    async fn test_account_locks_released_after_execution() {
        let f = fixture(false);
        let first = ready_action_for(&f, "a", Origin::Human);
        let second = ready_action_for(&f, "b", Origin::Human);

        f.executor.execute(first).await;
        f.executor.execute(second).await;
        assert_eq!(f.executor.tracked_accounts(), 0);

        // Skipped runs release their lock too.
        f.executor.execute(first).await;
        assert_eq!(f.executor.tracked_accounts(), 0);
    }

    #[tokio::test]
    async fn test_queued_account_does_not_hold_permit() {
        let f = fixture(false);
        let config = EngineConfig {
            executor_parallelism: 2,
            serialize_per_account: true,
            ..Default::default()
        };
        let client = Arc::new(Gated {
            release: Semaphore::new(0),
            calls: Default::default(),
        });
        let executor = Arc::new(executor_with(&f, client.clone(), &config));

        let a1 = ready_action_for(&f, "a", Origin::Human);
        let a2 = ready_action_for(&f, "a", Origin::Human);
        let b1 = ready_action_for(&f, "b", Origin::Human);

        let slow = tokio::spawn({
            let executor = Arc::clone(&executor);
            async move { executor.execute(a1).await }
        });
        while client.calls.load(std::sync::atomic::Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let queued = tokio::spawn({
            let executor = Arc::clone(&executor);
            async move { executor.execute(a2).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // `a2` waits on the account lock without a permit, leaving one for `b`.
        let other = tokio::time::timeout(Duration::from_secs(2), executor.execute(b1))
            .await
            .unwrap();
        assert!(matches!(other, ExecutionResult::Executed { .. }));
        assert_eq!(f.store.get(a2).unwrap().state, ActionState::Ready);

        client.release.add_permits(1);
        assert!(matches!(slow.await.unwrap(), ExecutionResult::Executed { .. }));
        assert!(matches!(queued.await.unwrap(), ExecutionResult::Executed { .. }));
        assert_eq!(executor.tracked_accounts(), 0);
    }
}
