//! Engine facade wiring the store, deadline manager, executor, trust gate,
//! policy engine, audit log and pause switch together.
//!
//! This is the surface the API layer talks to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use deputy_core::audit::{AuditRecord, ChainVerification};
use deputy_core::config::DeputyConfig;
use deputy_core::error::DeputyError;
use deputy_core::events::EngineEvent;
use deputy_core::policy::{Policy, TriggerEvent};
use deputy_core::types::{Action, Actor, PauseScope, PauseState, Timestamp};
use deputy_storage::{ActionFilter, AuditQuery, Database, TrustChange};

use crate::audit::{AuditLog, TrailVerification};
use crate::deadline::{DeadlineManager, DispatchQueue};
use crate::error::{ActionError, PolicyError, TrustError};
use crate::executor::Executor;
use crate::handler::DeliveryRegistry;
use crate::pause::PauseSwitch;
use crate::policy::{NewPolicy, PolicyEngine, PolicyMatch};
use crate::store::{ActionStore, SubmitRequest};
use crate::trust::{Confirmation, Eligibility, TrustGate, TrustStatus};

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct Engine {
    config: DeputyConfig,
    store: Arc<ActionStore>,
    audit: AuditLog,
    trust: Arc<TrustGate>,
    pause: Arc<PauseSwitch>,
    policies: PolicyEngine,
    executor: Arc<Executor>,
    deadlines: Arc<DeadlineManager>,
    queue: Arc<DispatchQueue>,
    events: broadcast::Sender<EngineEvent>,
    runner: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
}

impl Engine {
    pub fn new(
        db: Arc<Database>,
        config: DeputyConfig,
        registry: DeliveryRegistry,
    ) -> Result<Self, DeputyError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let store = Arc::new(
            ActionStore::new(
                db.clone(),
                config.engine.default_undo_window(),
                events.clone(),
            )
            .with_max_undo_window(config.engine.max_undo_window()),
        );
        let trust = Arc::new(TrustGate::new(
            db.clone(),
            config.trust.clone(),
            events.clone(),
        ));
        let pause = Arc::new(PauseSwitch::load(db.clone())?);
        let queue = Arc::new(DispatchQueue::new());
        let executor = Arc::new(Executor::new(
            store.clone(),
            trust.clone(),
            pause.clone(),
            registry,
            queue.clone(),
            &config.engine,
        ));
        let deadlines = Arc::new(DeadlineManager::new(
            store.clone(),
            pause.clone(),
            executor.clone(),
            queue.clone(),
            &config.engine,
        ));
        let policies = PolicyEngine::new(db.clone(), trust.clone(), store.clone(), config.policy.mode);

        Ok(Self {
            audit: AuditLog::new(db),
            config,
            store,
            trust,
            pause,
            policies,
            executor,
            deadlines,
            queue,
            events,
            runner: Mutex::new(None),
            stopping: AtomicBool::new(false),
        })
    }

    /// Recover persisted work and start the deadline manager.
    pub fn start(&self) -> Result<usize, ActionError> {
        let recovered = self.deadlines.recover()?;
        let deadlines = Arc::clone(&self.deadlines);
        let handle = tokio::spawn(async move { deadlines.run().await });
        *self.runner.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info!(recovered, "Engine started");
        Ok(recovered)
    }

    /// Stop accepting work, stop the deadline manager, and wait for
    /// in-flight deliveries to finish.
    pub async fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.deadlines.shutdown();
        let handle = self.runner.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Deadline manager task failed");
            }
        }
        self.executor.drain().await;
        info!("Engine stopped");
    }

    pub fn config(&self) -> &DeputyConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // =========================================================================
    // Actions
    // =========================================================================

    pub fn submit_action(&self, request: SubmitRequest) -> Result<Action, ActionError> {
        self.ensure_running()?;
        let action = self.store.submit(request)?;
        self.queue.schedule(action.id, action.undo_deadline);
        Ok(action)
    }

    /// Cancel a pending action. False means too late.
    pub fn cancel_action(&self, id: Uuid, actor: Actor) -> Result<bool, ActionError> {
        self.store.cancel(id, actor)
    }

    pub fn amend_action(
        &self,
        id: Uuid,
        payload: serde_json::Value,
    ) -> Result<Option<Action>, ActionError> {
        self.ensure_running()?;
        let replacement = self.store.amend(id, payload, Actor::User)?;
        if let Some(action) = &replacement {
            self.queue.schedule(action.id, action.undo_deadline);
        }
        Ok(replacement)
    }

    pub fn get_action(&self, id: Uuid) -> Result<Action, ActionError> {
        self.store.get(id)
    }

    pub fn list_actions(&self, filter: &ActionFilter) -> Result<Vec<Action>, ActionError> {
        self.store.list(filter)
    }

    // =========================================================================
    // Pause
    // =========================================================================

    /// Halt execution for `scope` and drop the affected accounts to trust
    /// level 1. Takes effect before this returns.
    pub fn pause(
        &self,
        scope: PauseScope,
        reason: &str,
        paused_by: Option<String>,
    ) -> Result<PauseState, DeputyError> {
        let state = self.pause.pause(scope.clone(), reason, paused_by)?;
        let _ = self.events.send(EngineEvent::Paused {
            scope: scope.clone(),
            reason: reason.to_string(),
            timestamp: state.paused_at.unwrap_or_else(Timestamp::now),
        });

        let reset = match &scope {
            PauseScope::Global => self.trust.force_reset_all().map(|c| c.len()),
            PauseScope::Account(account_id) => {
                self.trust.force_reset(account_id).map(|c| usize::from(c.is_some()))
            }
        };
        match reset {
            Ok(count) => info!(scope = %scope, accounts = count, "Trust reset by pause"),
            Err(e) => {
                error!(scope = %scope, error = %e, "Trust reset after pause failed");
                return Err(DeputyError::Storage(e.to_string()));
            }
        }
        Ok(state)
    }

    /// Clear the switch for `scope`. Held actions are rescheduled at once;
    /// trust levels stay where the pause left them.
    pub fn resume(&self, scope: PauseScope) -> Result<bool, DeputyError> {
        if !self.pause.resume(&scope)? {
            return Ok(false);
        }
        let _ = self.events.send(EngineEvent::Resumed {
            scope: scope.clone(),
            timestamp: Timestamp::now(),
        });
        if let Err(e) = self.deadlines.rescan() {
            warn!(scope = %scope, error = %e, "Rescan after resume failed; held actions wait for their recheck");
        }
        Ok(true)
    }

    pub fn pause_status(&self) -> Vec<PauseState> {
        self.pause.status()
    }

    pub fn is_paused(&self, account_id: &str) -> bool {
        self.pause.is_paused(account_id)
    }

    // =========================================================================
    // Audit
    // =========================================================================

    pub fn list_audit(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>, DeputyError> {
        self.audit.query(query)
    }

    pub fn verify_audit(&self, account_id: &str) -> Result<ChainVerification, DeputyError> {
        self.audit.verify_account(account_id)
    }

    pub fn verify_action_trail(&self, id: Uuid) -> Result<TrailVerification, ActionError> {
        let action = self.store.get(id)?;
        Ok(self.audit.verify_action_trail(&action)?)
    }

    // =========================================================================
    // Trust
    // =========================================================================

    pub fn trust_status(&self, account_id: &str) -> Result<TrustStatus, TrustError> {
        self.trust.status(account_id)
    }

    pub fn check_upgrade_eligibility(&self, account_id: &str) -> Result<Eligibility, TrustError> {
        self.trust.check_upgrade_eligibility(account_id)
    }

    /// Advance one level and install the default policies it unlocks.
    pub fn advance_trust_level(
        &self,
        account_id: &str,
        confirmation: &Confirmation,
    ) -> Result<TrustChange, TrustError> {
        let change = self.trust.advance_level(account_id, confirmation)?;
        match self
            .policies
            .seed_defaults(account_id, change.to, &self.config.policy.defaults)
        {
            Ok(seeded) if !seeded.is_empty() => {
                info!(account_id = %account_id, count = seeded.len(), "Default policies installed");
            }
            Ok(_) => {}
            Err(e) => warn!(account_id = %account_id, error = %e, "Failed to install default policies"),
        }
        Ok(change)
    }

    pub fn downgrade_trust_level(
        &self,
        account_id: &str,
        level: u8,
    ) -> Result<TrustChange, TrustError> {
        self.trust.downgrade(account_id, level)
    }

    pub fn trust_history(&self, account_id: &str) -> Result<Vec<TrustChange>, TrustError> {
        self.trust.history(account_id)
    }

    // =========================================================================
    // Policies
    // =========================================================================

    /// Evaluate a triggering event and schedule the resulting actions.
    pub fn handle_trigger(&self, event: &TriggerEvent) -> Result<Vec<Action>, PolicyError> {
        self.ensure_running()?;
        let actions = self.policies.handle_trigger(event)?;
        for action in &actions {
            self.queue.schedule(action.id, action.undo_deadline);
        }
        Ok(actions)
    }

    /// Dry-run evaluation: which policies would fire for `event`.
    pub fn evaluate_trigger(&self, event: &TriggerEvent) -> Result<Vec<PolicyMatch>, PolicyError> {
        self.policies.evaluate(event)
    }

    pub fn add_policy(&self, policy: NewPolicy) -> Result<Policy, PolicyError> {
        self.policies.add_policy(policy)
    }

    pub fn list_policies(&self, account_id: &str) -> Result<Vec<Policy>, PolicyError> {
        self.policies.list_policies(account_id)
    }

    pub fn set_policy_enabled(&self, id: Uuid, enabled: bool) -> Result<Policy, PolicyError> {
        self.policies.set_enabled(id, enabled)
    }

    fn ensure_running(&self) -> Result<(), ActionError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(ActionError::ShuttingDown);
        }
        Ok(())
    }
}
