//! Action persistence and the atomic transition primitive.

use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use deputy_core::audit::{AuditDraft, AuditRecord};
use deputy_core::error::DeputyError;
use deputy_core::payload::ActionPayload;
use deputy_core::types::{Action, ActionState, Actor, Origin, Timestamp};

use crate::audit::append_record;
use crate::db::Database;

const ACTION_COLUMNS: &str = "id, account_id, action_type, payload, origin, policy_id, state, \
                              undo_deadline, created_at, state_changed_at, supersedes";

/// Filters for listing actions.
#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    pub account_id: Option<String>,
    pub state: Option<ActionState>,
    pub limit: Option<u32>,
}

/// One compare-and-swap on an action's state.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub action_id: Uuid,
    pub from: ActionState,
    pub to: ActionState,
    pub actor: Actor,
    pub result_summary: String,
    pub at: Timestamp,
}

/// Repository for action rows.
pub struct ActionRepository {
    db: Arc<Database>,
}

impl ActionRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store a newly submitted action.
    pub fn insert(&self, action: &Action) -> Result<(), DeputyError> {
        self.db.with_conn(|conn| insert_action(conn, action))
    }

    pub fn find_by_id(&self, id: Uuid) -> Result<Option<Action>, DeputyError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM actions WHERE id = ?1", ACTION_COLUMNS))
                .map_err(|e| DeputyError::Storage(e.to_string()))?;

            let result = stmt
                .query_row(rusqlite::params![id.to_string()], |row| Ok(row_to_action(row)))
                .optional()
                .map_err(|e| DeputyError::Storage(e.to_string()))?;

            match result {
                Some(action) => Ok(Some(action?)),
                None => Ok(None),
            }
        })
    }

    /// List actions, newest first.
    pub fn list(&self, filter: &ActionFilter) -> Result<Vec<Action>, DeputyError> {
        let mut sql = format!("SELECT {} FROM actions WHERE 1 = 1", ACTION_COLUMNS);
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref account_id) = filter.account_id {
            params.push(Box::new(account_id.clone()));
            sql.push_str(&format!(" AND account_id = ?{}", params.len()));
        }
        if let Some(state) = filter.state {
            params.push(Box::new(state.to_string()));
            sql.push_str(&format!(" AND state = ?{}", params.len()));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC");
        if let Some(limit) = filter.limit {
            params.push(Box::new(limit));
            sql.push_str(&format!(" LIMIT ?{}", params.len()));
        }

        self.query_actions(&sql, params)
    }

    /// All actions currently in `state`, earliest deadline first.
    pub fn find_by_state(&self, state: ActionState) -> Result<Vec<Action>, DeputyError> {
        let sql = format!(
            "SELECT {} FROM actions WHERE state = ?1 ORDER BY undo_deadline ASC, rowid ASC",
            ACTION_COLUMNS
        );
        self.query_actions(&sql, vec![Box::new(state.to_string())])
    }

    /// Atomically move an action from `request.from` to `request.to` and
    /// append the matching audit record.
    ///
    /// Returns `Ok(None)` when the action is not in `request.from` (another
    /// caller won the race). If the audit record cannot be written the
    /// state change is rolled back and [`DeputyError::AuditWrite`] returned.
    pub fn transition(
        &self,
        request: &TransitionRequest,
    ) -> Result<Option<AuditRecord>, DeputyError> {
        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| DeputyError::Storage(format!("Failed to begin transaction: {}", e)))?;

            let record = match transition_in_tx(&tx, request)? {
                Some(record) => record,
                None => return Ok(None),
            };

            tx.commit()
                .map_err(|e| DeputyError::AuditWrite(format!("Failed to commit: {}", e)))?;
            Ok(Some(record))
        })
    }

    /// Cancel a pending action and store its replacement in one transaction.
    ///
    /// `cancel` must describe a `pending -> undone` move of the original.
    /// Returns `Ok(None)` without storing the replacement if the original
    /// was no longer pending.
    pub fn supersede(
        &self,
        cancel: &TransitionRequest,
        replacement: &Action,
    ) -> Result<Option<AuditRecord>, DeputyError> {
        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| DeputyError::Storage(format!("Failed to begin transaction: {}", e)))?;

            let record = match transition_in_tx(&tx, cancel)? {
                Some(record) => record,
                None => return Ok(None),
            };
            insert_action(&tx, replacement)?;

            tx.commit()
                .map_err(|e| DeputyError::AuditWrite(format!("Failed to commit: {}", e)))?;
            Ok(Some(record))
        })
    }

    /// Count actions per state for one account.
    pub fn count_by_state(&self, account_id: &str) -> Result<Vec<(ActionState, u64)>, DeputyError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT state, COUNT(*) FROM actions WHERE account_id = ?1
                     GROUP BY state ORDER BY state",
                )
                .map_err(|e| DeputyError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params![account_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(|e| DeputyError::Storage(e.to_string()))?;

            let mut counts = Vec::new();
            for row in rows {
                let (state, count) = row.map_err(|e| DeputyError::Storage(e.to_string()))?;
                counts.push((state.parse().map_err(DeputyError::Storage)?, count as u64));
            }
            Ok(counts)
        })
    }

    /// Actions for `account_id` that reached `executed` at or after `since`.
    pub fn count_executed_since(
        &self,
        account_id: &str,
        since: Timestamp,
    ) -> Result<u64, DeputyError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM actions
                     WHERE account_id = ?1 AND state = 'executed' AND state_changed_at >= ?2",
                    rusqlite::params![account_id, since.0],
                    |row| row.get(0),
                )
                .map_err(|e| DeputyError::Storage(e.to_string()))?;
            Ok(count as u64)
        })
    }

    fn query_actions(
        &self,
        sql: &str,
        params: Vec<Box<dyn rusqlite::ToSql>>,
    ) -> Result<Vec<Action>, DeputyError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| DeputyError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                    Ok(row_to_action(row))
                })
                .map_err(|e| DeputyError::Storage(e.to_string()))?;

            let mut actions = Vec::new();
            for row in rows {
                actions.push(row.map_err(|e| DeputyError::Storage(e.to_string()))??);
            }
            Ok(actions)
        })
    }
}

fn insert_action(conn: &Connection, action: &Action) -> Result<(), DeputyError> {
    let payload = serde_json::to_string(&action.payload)?;
    let origin = match action.origin {
        Origin::Human => "human",
        Origin::Policy { .. } => "policy",
    };
    conn.execute(
        "INSERT INTO actions (id, account_id, action_type, payload, origin, policy_id, state,
                              undo_deadline, created_at, state_changed_at, supersedes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            action.id.to_string(),
            action.account_id,
            action.action_type().to_string(),
            payload,
            origin,
            action.origin.policy_id().map(|id| id.to_string()),
            action.state.to_string(),
            action.undo_deadline.0,
            action.created_at.0,
            action.state_changed_at.0,
            action.supersedes.map(|id| id.to_string()),
        ],
    )
    .map_err(|e| DeputyError::Storage(format!("Failed to save action: {}", e)))?;
    Ok(())
}

/// The compare-and-swap plus audit append, on an open transaction.
fn transition_in_tx(
    conn: &Connection,
    request: &TransitionRequest,
) -> Result<Option<AuditRecord>, DeputyError> {
    let changed = conn
        .execute(
            "UPDATE actions SET state = ?1, state_changed_at = ?2 WHERE id = ?3 AND state = ?4",
            rusqlite::params![
                request.to.to_string(),
                request.at.0,
                request.action_id.to_string(),
                request.from.to_string(),
            ],
        )
        .map_err(|e| DeputyError::Storage(format!("Failed to update action state: {}", e)))?;

    if changed == 0 {
        debug!(
            action_id = %request.action_id,
            from = %request.from,
            to = %request.to,
            "Transition lost: action not in expected state"
        );
        return Ok(None);
    }

    let account_id: String = conn
        .query_row(
            "SELECT account_id FROM actions WHERE id = ?1",
            rusqlite::params![request.action_id.to_string()],
            |row| row.get(0),
        )
        .map_err(|e| DeputyError::Storage(e.to_string()))?;

    let record = append_record(
        conn,
        AuditDraft {
            account_id,
            action_id: request.action_id,
            from_state: request.from,
            to_state: request.to,
            actor: request.actor,
            timestamp: request.at,
            result_summary: request.result_summary.clone(),
        },
    )?;
    Ok(Some(record))
}

fn row_to_action(row: &rusqlite::Row<'_>) -> Result<Action, DeputyError> {
    let get_text = |idx: usize| -> Result<String, DeputyError> {
        row.get(idx).map_err(|e| DeputyError::Storage(e.to_string()))
    };
    let get_i64 = |idx: usize| -> Result<i64, DeputyError> {
        row.get(idx).map_err(|e| DeputyError::Storage(e.to_string()))
    };
    let get_uuid = |idx: usize| -> Result<Option<Uuid>, DeputyError> {
        let raw: Option<String> = row
            .get(idx)
            .map_err(|e| DeputyError::Storage(e.to_string()))?;
        raw.map(|s| {
            Uuid::parse_str(&s).map_err(|e| DeputyError::Storage(format!("Invalid UUID: {}", e)))
        })
        .transpose()
    };

    let id = get_uuid(0)?.ok_or_else(|| DeputyError::Storage("Action without id".to_string()))?;
    let payload: ActionPayload = serde_json::from_str(&get_text(3)?)?;
    let origin = match get_text(4)?.as_str() {
        "human" => Origin::Human,
        "policy" => Origin::Policy {
            policy_id: get_uuid(5)?.ok_or_else(|| {
                DeputyError::Storage(format!("Policy action {} has no policy_id", id))
            })?,
        },
        other => return Err(DeputyError::Storage(format!("Unknown origin: {}", other))),
    };

    Ok(Action {
        id,
        account_id: get_text(1)?,
        payload,
        origin,
        state: get_text(6)?.parse().map_err(DeputyError::Storage)?,
        undo_deadline: Timestamp(get_i64(7)?),
        created_at: Timestamp(get_i64(8)?),
        state_changed_at: Timestamp(get_i64(9)?),
        supersedes: get_uuid(10)?,
    })
}
