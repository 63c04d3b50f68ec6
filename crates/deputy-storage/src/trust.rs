//! Trust level persistence.

use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use deputy_core::error::DeputyError;
use deputy_core::trust::{TrustLevel, TrustState};
use deputy_core::types::{ActionType, Timestamp};

use crate::db::Database;

/// A committed change of an account's trust level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustChange {
    pub account_id: String,
    pub from: TrustLevel,
    pub to: TrustLevel,
    /// `advance`, `downgrade`, or `emergency_pause`.
    pub reason: String,
    pub changed_at: Timestamp,
}

pub struct TrustRepository {
    db: Arc<Database>,
}

impl TrustRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Return the account's trust state, creating it at the lowest level
    /// if the account has never been seen.
    pub fn ensure(&self, account_id: &str, now: Timestamp) -> Result<TrustState, DeputyError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO trust_levels (account_id, current_level, level_entered_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![account_id, TrustLevel::MIN.as_u8(), now.0],
            )
            .map_err(|e| DeputyError::Storage(format!("Failed to create trust level: {}", e)))?;
            load_state(conn, account_id)?.ok_or_else(|| {
                DeputyError::Storage(format!("Trust level for {} vanished", account_id))
            })
        })
    }

    pub fn get(&self, account_id: &str) -> Result<Option<TrustState>, DeputyError> {
        self.db.with_conn(|conn| load_state(conn, account_id))
    }

    /// Every account with a trust row.
    pub fn list(&self) -> Result<Vec<TrustState>, DeputyError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT account_id FROM trust_levels ORDER BY account_id")
                .map_err(|e| DeputyError::Storage(e.to_string()))?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| DeputyError::Storage(e.to_string()))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| DeputyError::Storage(e.to_string()))?;

            let mut states = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(state) = load_state(conn, &id)? {
                    states.push(state);
                }
            }
            Ok(states)
        })
    }

    /// Apply `change` if the account is still at `change.from`.
    ///
    /// Resets `level_entered_at` and records the change in the history
    /// table. Returns false when the stored level differs from `change.from`.
    pub fn set_level(&self, change: &TrustChange) -> Result<bool, DeputyError> {
        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| DeputyError::Storage(format!("Failed to begin transaction: {}", e)))?;

            let changed = tx
                .execute(
                    "UPDATE trust_levels SET current_level = ?1, level_entered_at = ?2
                     WHERE account_id = ?3 AND current_level = ?4",
                    rusqlite::params![
                        change.to.as_u8(),
                        change.changed_at.0,
                        change.account_id,
                        change.from.as_u8(),
                    ],
                )
                .map_err(|e| DeputyError::Storage(format!("Failed to update trust level: {}", e)))?;
            if changed == 0 {
                return Ok(false);
            }

            tx.execute(
                "INSERT INTO trust_history (account_id, from_level, to_level, reason, changed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    change.account_id,
                    change.from.as_u8(),
                    change.to.as_u8(),
                    change.reason,
                    change.changed_at.0,
                ],
            )
            .map_err(|e| DeputyError::Storage(format!("Failed to record trust change: {}", e)))?;

            tx.commit()
                .map_err(|e| DeputyError::Storage(format!("Failed to commit: {}", e)))?;
            Ok(true)
        })
    }

    /// Count one executed action, whatever its origin.
    pub fn increment_action_count(
        &self,
        account_id: &str,
        action_type: ActionType,
    ) -> Result<(), DeputyError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO trust_action_counts (account_id, action_type, count)
                 VALUES (?1, ?2, 1)
                 ON CONFLICT (account_id, action_type) DO UPDATE SET count = count + 1",
                rusqlite::params![account_id, action_type.to_string()],
            )
            .map_err(|e| DeputyError::Storage(format!("Failed to count action: {}", e)))?;
            Ok(())
        })
    }

    /// Level changes for an account, oldest first.
    pub fn history(&self, account_id: &str) -> Result<Vec<TrustChange>, DeputyError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT from_level, to_level, reason, changed_at FROM trust_history
                     WHERE account_id = ?1 ORDER BY id ASC",
                )
                .map_err(|e| DeputyError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params![account_id], |row| {
                    Ok((
                        row.get::<_, u8>(0)?,
                        row.get::<_, u8>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .map_err(|e| DeputyError::Storage(e.to_string()))?;

            let mut changes = Vec::new();
            for row in rows {
                let (from, to, reason, at) =
                    row.map_err(|e| DeputyError::Storage(e.to_string()))?;
                changes.push(TrustChange {
                    account_id: account_id.to_string(),
                    from: level_from_db(from)?,
                    to: level_from_db(to)?,
                    reason,
                    changed_at: Timestamp(at),
                });
            }
            Ok(changes)
        })
    }
}

fn level_from_db(level: u8) -> Result<TrustLevel, DeputyError> {
    TrustLevel::from_u8(level)
        .ok_or_else(|| DeputyError::Storage(format!("Invalid trust level in database: {}", level)))
}

fn load_state(conn: &Connection, account_id: &str) -> Result<Option<TrustState>, DeputyError> {
    let row: Option<(u8, i64)> = conn
        .query_row(
            "SELECT current_level, level_entered_at FROM trust_levels WHERE account_id = ?1",
            rusqlite::params![account_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| DeputyError::Storage(e.to_string()))?;

    let (level, entered_at) = match row {
        Some(row) => row,
        None => return Ok(None),
    };

    let mut stmt = conn
        .prepare("SELECT action_type, count FROM trust_action_counts WHERE account_id = ?1")
        .map_err(|e| DeputyError::Storage(e.to_string()))?;
    let rows = stmt
        .query_map(rusqlite::params![account_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(|e| DeputyError::Storage(e.to_string()))?;

    let mut counts = BTreeMap::new();
    for row in rows {
        let (action_type, count) = row.map_err(|e| DeputyError::Storage(e.to_string()))?;
        let action_type: ActionType = action_type.parse().map_err(DeputyError::Storage)?;
        counts.insert(action_type, count as u64);
    }

    Ok(Some(TrustState {
        account_id: account_id.to_string(),
        level: level_from_db(level)?,
        level_entered_at: Timestamp(entered_at),
        action_history_count: counts,
    }))
}
