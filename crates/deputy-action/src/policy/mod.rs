//! Policy Engine: turns triggering events into policy-origin actions.
//!
//! Enabled policies for the event's account are evaluated in priority
//! order. A match produces an action only if the account's trust level
//! permits the action type at evaluation time; the executor checks again
//! before delivery.

pub mod conditions;
pub mod template;

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use deputy_core::config::{DefaultPolicy, PolicyMode};
use deputy_core::payload::ActionPayload;
use deputy_core::policy::{ActionTemplate, Condition, Policy, TriggerEvent};
use deputy_core::trust::TrustLevel;
use deputy_core::types::{Action, Origin, Timestamp};
use deputy_storage::{Database, PolicyRepository};

use crate::error::PolicyError;
use conditions::PatternCache;
use crate::store::ActionStore;
use crate::trust::TrustGate;

const MAX_POLICY_NAME_LEN: usize = 200;

fn default_enabled() -> bool {
    true
}

/// A policy as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPolicy {
    pub account_id: String,
    pub name: String,
    pub conditions: Condition,
    pub action_template: ActionTemplate,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// A policy that fired for an event, with its materialized payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyMatch {
    pub policy_id: Uuid,
    pub policy_name: String,
    pub priority: i32,
    pub payload: ActionPayload,
}

pub struct PolicyEngine {
    policies: PolicyRepository,
    trust: Arc<TrustGate>,
    store: Arc<ActionStore>,
    mode: PolicyMode,
    patterns: PatternCache,
}

impl PolicyEngine {
    pub fn new(
        db: Arc<Database>,
        trust: Arc<TrustGate>,
        store: Arc<ActionStore>,
        mode: PolicyMode,
    ) -> Self {
        Self {
            policies: PolicyRepository::new(db),
            trust,
            store,
            mode,
            patterns: PatternCache::default(),
        }
    }

    /// Policies that fire for `event`, after trust gating and conflict
    /// resolution. Does not submit anything.
    pub fn evaluate(&self, event: &TriggerEvent) -> Result<Vec<PolicyMatch>, PolicyError> {
        let mut matches = Vec::new();
        let mut claimed = HashSet::new();

        for policy in self.policies.list_for_account(&event.account_id, true)? {
            if !conditions::matches(&policy.conditions, event, &self.patterns) {
                continue;
            }
            let action_type = policy.action_template.action_type;
            if !self.trust.is_authorized(&event.account_id, action_type) {
                debug!(
                    policy_id = %policy.id,
                    account_id = %event.account_id,
                    action_type = %action_type,
                    "Policy matched but trust level does not permit it"
                );
                continue;
            }
            let payload = match template::materialize(&policy.action_template, event) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(policy_id = %policy.id, error = %e, "Policy template could not be filled");
                    continue;
                }
            };
            if let Some(target) = payload.target() {
                if !claimed.insert(target.clone()) {
                    debug!(
                        policy_id = %policy.id,
                        target = %target,
                        "Lower-priority policy dropped: target already claimed"
                    );
                    continue;
                }
            }

            matches.push(PolicyMatch {
                policy_id: policy.id,
                policy_name: policy.name,
                priority: policy.priority,
                payload,
            });
            if self.mode == PolicyMode::HighestPriority {
                break;
            }
        }
        Ok(matches)
    }

    /// Evaluate `event` and submit one pending action per match.
    pub fn handle_trigger(&self, event: &TriggerEvent) -> Result<Vec<Action>, PolicyError> {
        let mut actions = Vec::new();
        for m in self.evaluate(event)? {
            let action = self.store.submit_payload(
                &event.account_id,
                m.payload,
                Origin::Policy {
                    policy_id: m.policy_id,
                },
                None,
            )?;
            info!(
                action_id = %action.id,
                policy = %m.policy_name,
                event_type = %event.event_type,
                "Policy submitted action"
            );
            actions.push(action);
        }
        Ok(actions)
    }

    pub fn add_policy(&self, new: NewPolicy) -> Result<Policy, PolicyError> {
        validate(&new)?;
        let policy = Policy {
            id: Uuid::new_v4(),
            account_id: new.account_id,
            name: new.name.trim().to_string(),
            conditions: new.conditions,
            action_template: new.action_template,
            priority: new.priority,
            enabled: new.enabled,
            created_at: Timestamp::now(),
        };
        self.policies.insert(&policy)?;
        info!(policy_id = %policy.id, account_id = %policy.account_id, name = %policy.name, "Policy added");
        Ok(policy)
    }

    /// All policies for an account, enabled or not, in evaluation order.
    pub fn list_policies(&self, account_id: &str) -> Result<Vec<Policy>, PolicyError> {
        Ok(self.policies.list_for_account(account_id, false)?)
    }

    pub fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<Policy, PolicyError> {
        if !self.policies.set_enabled(id, enabled)? {
            return Err(PolicyError::NotFound(id));
        }
        self.policies.find_by_id(id)?.ok_or(PolicyError::NotFound(id))
    }

    /// Install the defaults unlocked by `level` that the account does not
    /// already have (matched by name).
    pub fn seed_defaults(
        &self,
        account_id: &str,
        level: TrustLevel,
        defaults: &[DefaultPolicy],
    ) -> Result<Vec<Policy>, PolicyError> {
        let mut seeded = Vec::new();
        for default in defaults.iter().filter(|d| d.unlock_level == level.as_u8()) {
            if self.policies.exists_with_name(account_id, &default.name)? {
                continue;
            }
            seeded.push(self.add_policy(NewPolicy {
                account_id: account_id.to_string(),
                name: default.name.clone(),
                conditions: default.conditions.clone(),
                action_template: default.action_template.clone(),
                priority: default.priority,
                enabled: true,
            })?);
        }
        Ok(seeded)
    }
}

fn validate(new: &NewPolicy) -> Result<(), PolicyError> {
    if new.account_id.trim().is_empty() {
        return Err(PolicyError::InvalidPolicy("account_id must not be empty".to_string()));
    }
    let name = new.name.trim();
    if name.is_empty() || name.len() > MAX_POLICY_NAME_LEN {
        return Err(PolicyError::InvalidPolicy(format!(
            "name must be 1-{} characters",
            MAX_POLICY_NAME_LEN
        )));
    }
    let invalid = conditions::invalid_patterns(&new.conditions);
    if !invalid.is_empty() {
        return Err(PolicyError::InvalidPolicy(format!(
            "invalid pattern: {}",
            invalid.join("; ")
        )));
    }
    if !new.action_template.payload.is_object() && !new.action_template.payload.is_null() {
        return Err(PolicyError::InvalidPolicy(
            "action_template.payload must be a JSON object".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::Confirmation;
    use deputy_core::config::{PolicyConfig, TrustConfig, TrustThreshold};
    use deputy_core::policy::TriggerKind;
    use deputy_core::types::ActionType;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn make_engine(mode: PolicyMode, level: u8) -> PolicyEngine {
        let db = Arc::new(Database::in_memory().unwrap());
        let (tx, _) = broadcast::channel(64);
        let open = TrustConfig {
            thresholds: (2..=5)
                .map(|level| TrustThreshold {
                    level,
                    min_days_at_previous_level: 0,
                    min_actions_at_previous_level: 0,
                })
                .collect(),
        };
        let trust = Arc::new(TrustGate::new(db.clone(), open, tx.clone()));
        for _ in 1..level {
            trust.advance_level("acct", &Confirmation::yes()).unwrap();
        }
        let store = Arc::new(ActionStore::new(db.clone(), Duration::from_secs(30), tx));
        PolicyEngine::new(db, trust, store, mode)
    }

    fn archive_policy(name: &str, priority: i32) -> NewPolicy {
        NewPolicy {
            account_id: "acct".to_string(),
            name: name.to_string(),
            conditions: Condition::EventType {
                event_type: TriggerKind::NewMessage,
            },
            action_template: ActionTemplate {
                action_type: ActionType::ArchiveMessage,
                payload: json!({"message_id": "{message_id}"}),
            },
            priority,
            enabled: true,
        }
    }

    fn label_policy(name: &str, priority: i32) -> NewPolicy {
        NewPolicy {
            action_template: ActionTemplate {
                action_type: ActionType::LabelMessage,
                payload: json!({"message_id": "{message_id}", "label": "auto"}),
            },
            ..archive_policy(name, priority)
        }
    }

    fn schedule_policy(priority: i32) -> NewPolicy {
        NewPolicy {
            action_template: ActionTemplate {
                action_type: ActionType::ScheduleEvent,
                payload: json!({
                    "title": "Follow up",
                    "starts_at": "2030-01-01T10:00:00Z",
                    "ends_at": "2030-01-01T10:30:00Z"
                }),
            },
            ..archive_policy("schedule", priority)
        }
    }

    fn message() -> TriggerEvent {
        TriggerEvent::new(TriggerKind::NewMessage, "acct").with_field("message_id", "m-1")
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    #[test]
    fn test_untrusted_account_produces_nothing() {
        let engine = make_engine(PolicyMode::HighestPriority, 1);
        engine.add_policy(archive_policy("archive", 0)).unwrap();
        assert!(engine.handle_trigger(&message()).unwrap().is_empty());
    }

    #[test]
    fn test_trusted_match_submits_policy_action() {
        let engine = make_engine(PolicyMode::HighestPriority, 2);
        let policy = engine.add_policy(archive_policy("archive", 0)).unwrap();
        let actions = engine.handle_trigger(&message()).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(
            actions[0].origin,
            Origin::Policy {
                policy_id: policy.id
            }
        );
        assert_eq!(actions[0].action_type(), ActionType::ArchiveMessage);
    }

    #[test]
    fn test_unpermitted_type_skipped_lower_priority_fires() {
        let engine = make_engine(PolicyMode::HighestPriority, 2);
        engine.add_policy(schedule_policy(100)).unwrap();
        engine.add_policy(archive_policy("archive", 1)).unwrap();

        let matches = engine.evaluate(&message()).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].policy_name, "archive");
    }

    #[test]
    fn test_highest_priority_wins() {
        let engine = make_engine(PolicyMode::HighestPriority, 2);
        engine.add_policy(archive_policy("low", 1)).unwrap();
        engine.add_policy(label_policy("high", 5)).unwrap();

        let matches = engine.evaluate(&message()).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].policy_name, "high");
    }

    #[test]
    fn test_fan_out_drops_conflicting_target() {
        let engine = make_engine(PolicyMode::FanOut, 4);
        engine.add_policy(label_policy("label", 5)).unwrap();
        engine.add_policy(archive_policy("archive", 1)).unwrap();
        engine.add_policy(schedule_policy(0)).unwrap();

        let matches = engine.evaluate(&message()).unwrap();
        let names: Vec<_> = matches.iter().map(|m| m.policy_name.as_str()).collect();
        // archive touches the same message as label and loses.
        assert_eq!(names, vec!["label", "schedule"]);
    }

    #[test]
    fn test_disabled_policy_ignored() {
        let engine = make_engine(PolicyMode::HighestPriority, 2);
        let policy = engine.add_policy(archive_policy("archive", 0)).unwrap();
        let updated = engine.set_enabled(policy.id, false).unwrap();
        assert!(!updated.enabled);
        assert!(engine.evaluate(&message()).unwrap().is_empty());
        assert_eq!(engine.list_policies("acct").unwrap().len(), 1);
    }

    #[test]
    fn test_template_failure_skips_policy() {
        let engine = make_engine(PolicyMode::HighestPriority, 2);
        engine.add_policy(archive_policy("archive", 0)).unwrap();
        let no_id = TriggerEvent::new(TriggerKind::NewMessage, "acct");
        assert!(engine.evaluate(&no_id).unwrap().is_empty());
    }

    // =========================================================================
    // Management
    // =========================================================================

    #[test]
    fn test_add_policy_validation() {
        let engine = make_engine(PolicyMode::HighestPriority, 1);
        let mut bad = archive_policy("  ", 0);
        assert!(matches!(engine.add_policy(bad.clone()), Err(PolicyError::InvalidPolicy(_))));

        bad.name = "regex".to_string();
        bad.conditions = Condition::FieldMatches {
            field: "subject".to_string(),
            pattern: "(".to_string(),
        };
        assert!(matches!(engine.add_policy(bad), Err(PolicyError::InvalidPolicy(_))));
    }

    #[test]
    fn test_set_enabled_unknown() {
        let engine = make_engine(PolicyMode::HighestPriority, 1);
        assert!(matches!(
            engine.set_enabled(Uuid::new_v4(), true),
            Err(PolicyError::NotFound(_))
        ));
    }

    #[test]
    fn test_seed_defaults_is_idempotent() {
        let engine = make_engine(PolicyMode::HighestPriority, 2);
        let defaults = PolicyConfig::default().defaults;

        assert!(engine
            .seed_defaults("acct", TrustLevel::Observe, &defaults)
            .unwrap()
            .is_empty());
        assert_eq!(
            engine
                .seed_defaults("acct", TrustLevel::Organize, &defaults)
                .unwrap()
                .len(),
            1
        );
        assert!(engine
            .seed_defaults("acct", TrustLevel::Organize, &defaults)
            .unwrap()
            .is_empty());

        let newsletter = message().with_field("list_unsubscribe", "<mailto:x@example.com>");
        assert_eq!(engine.handle_trigger(&newsletter).unwrap().len(), 1);
        assert!(engine.handle_trigger(&message()).unwrap().is_empty());
    }
}
