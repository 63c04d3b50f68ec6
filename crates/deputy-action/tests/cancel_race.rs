//! Cancel racing the deadline: exactly one side wins, every time.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use deputy_action::{ActionStore, AuditLog, SubmitRequest};
use deputy_core::types::{ActionState, Actor, Origin};
use deputy_storage::Database;

const TRIALS: usize = 2000;

#[test]
fn test_cancel_vs_promotion_has_single_winner() {
    let db = Arc::new(Database::in_memory().unwrap());
    let (tx, _) = broadcast::channel(16);
    let store = ActionStore::new(db.clone(), Duration::from_secs(0), tx);
    let log = AuditLog::new(db);

    let (mut cancels, mut promotions) = (0, 0);
    for i in 0..TRIALS {
        let action = store
            .submit(SubmitRequest::new(
                "acct",
                "archive_message",
                json!({"message_id": format!("m-{}", i)}),
                Origin::Human,
            ))
            .unwrap();

        let barrier = Barrier::new(2);
        let (cancelled, promoted) = thread::scope(|s| {
            let cancel = s.spawn(|| {
                barrier.wait();
                store.cancel(action.id, Actor::User).unwrap()
            });
            let promote = s.spawn(|| {
                barrier.wait();
                store
                    .transition(
                        action.id,
                        ActionState::Pending,
                        ActionState::Ready,
                        Actor::System,
                        "deadline",
                    )
                    .unwrap()
                    .is_some()
            });
            (cancel.join().unwrap(), promote.join().unwrap())
        });

        assert!(cancelled ^ promoted, "trial {}: cancel={} promote={}", i, cancelled, promoted);
        let state = store.get(action.id).unwrap().state;
        if cancelled {
            cancels += 1;
            assert_eq!(state, ActionState::Undone);
        } else {
            promotions += 1;
            assert_eq!(state, ActionState::Ready);
        }
        assert_eq!(log.for_action(action.id).unwrap().len(), 1);
    }

    assert_eq!(cancels + promotions, TRIALS);
    assert!(log.verify_account("acct").unwrap().valid);
}

#[test]
fn test_double_cancel_single_record() {
    let db = Arc::new(Database::in_memory().unwrap());
    let (tx, _) = broadcast::channel(16);
    let store = ActionStore::new(db.clone(), Duration::from_secs(30), tx);

    let action = store
        .submit(SubmitRequest::new(
            "acct",
            "archive_message",
            json!({"message_id": "m-1"}),
            Origin::Human,
        ))
        .unwrap();

    let barrier = Barrier::new(4);
    let wins: usize = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    store.cancel(action.id, Actor::User).unwrap() as usize
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    assert_eq!(wins, 1);
    assert_eq!(AuditLog::new(db).for_action(action.id).unwrap().len(), 1);
}
