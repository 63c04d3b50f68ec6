//! Property tests: any sequence of store operations leaves every action with
//! a complete audit trail and every account with an intact hash chain.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;
use tokio::sync::broadcast;
use uuid::Uuid;

use deputy_action::{ActionStore, AuditLog, SubmitRequest};
use deputy_core::types::{ActionState, Actor, Origin};
use deputy_storage::{ActionFilter, Database};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Op {
    Submit { account: usize },
    Cancel(usize),
    Amend(usize),
    Step { action: usize, to: ActionState },
    Arbitrary { action: usize, from: ActionState, to: ActionState },
}

fn arb_state() -> impl Strategy<Value = ActionState> {
    prop::sample::select(ActionState::ALL.to_vec())
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..3).prop_map(|account| Op::Submit { account }),
        2 => any::<usize>().prop_map(Op::Cancel),
        1 => any::<usize>().prop_map(Op::Amend),
        4 => (any::<usize>(), arb_state()).prop_map(|(action, to)| Op::Step { action, to }),
        2 => (any::<usize>(), arb_state(), arb_state())
            .prop_map(|(action, from, to)| Op::Arbitrary { action, from, to }),
    ]
}

fn pick(ids: &[Uuid], i: usize) -> Option<Uuid> {
    if ids.is_empty() {
        None
    } else {
        Some(ids[i % ids.len()])
    }
}

fn apply(store: &ActionStore, ids: &mut Vec<Uuid>, op: Op) {
    match op {
        Op::Submit { account } => {
            let action = store
                .submit(SubmitRequest::new(
                    format!("acct-{}", account),
                    "archive_message",
                    json!({"message_id": format!("m-{}", ids.len())}),
                    Origin::Human,
                ))
                .unwrap();
            ids.push(action.id);
        }
        Op::Cancel(i) => {
            if let Some(id) = pick(ids, i) {
                store.cancel(id, Actor::User).unwrap();
            }
        }
        Op::Amend(i) => {
            if let Some(id) = pick(ids, i) {
                if let Some(replacement) = store
                    .amend(id, json!({"message_id": "amended"}), Actor::User)
                    .unwrap()
                {
                    ids.push(replacement.id);
                }
            }
        }
        Op::Step { action, to } => {
            if let Some(id) = pick(ids, action) {
                let from = store.get(id).unwrap().state;
                // Invalid edges are rejected; losing the CAS is Ok(None).
                let _ = store.transition(id, from, to, Actor::System, "step");
            }
        }
        Op::Arbitrary { action, from, to } => {
            if let Some(id) = pick(ids, action) {
                let _ = store.transition(id, from, to, Actor::System, "arbitrary");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Property Tests
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every action's trail replays from pending to its current state.
    #[test]
    fn trails_always_complete(ops in prop::collection::vec(arb_op(), 1..60)) {
        let db = Arc::new(Database::in_memory().unwrap());
        let (tx, _) = broadcast::channel(1024);
        let store = ActionStore::new(db.clone(), Duration::from_secs(30), tx);
        let log = AuditLog::new(db);

        let mut ids = Vec::new();
        for op in ops {
            apply(&store, &mut ids, op);
        }

        for action in store.list(&ActionFilter::default()).unwrap() {
            let trail = log.verify_action_trail(&action).unwrap();
            prop_assert!(trail.valid, "{}: {:?}", action.id, trail.error);
        }
        for account in 0..3 {
            let chain = log.verify_account(&format!("acct-{}", account)).unwrap();
            prop_assert!(chain.valid, "{:?}", chain.error_message);
        }
    }

    /// No action is ever recorded as both undone and ready.
    #[test]
    fn undone_and_ready_are_exclusive(ops in prop::collection::vec(arb_op(), 1..60)) {
        let db = Arc::new(Database::in_memory().unwrap());
        let (tx, _) = broadcast::channel(1024);
        let store = ActionStore::new(db.clone(), Duration::from_secs(30), tx);
        let log = AuditLog::new(db);

        let mut ids = Vec::new();
        for op in ops {
            apply(&store, &mut ids, op);
        }

        for id in ids {
            let records = log.for_action(id).unwrap();
            let undone = records.iter().any(|r| r.to_state == ActionState::Undone);
            let ready = records.iter().any(|r| r.to_state == ActionState::Ready);
            prop_assert!(!(undone && ready), "{} reached both undone and ready", id);

            // Terminal states are final.
            let terminal = records.iter().filter(|r| r.to_state.is_terminal()).count();
            prop_assert!(terminal <= 1);
        }
    }
}
