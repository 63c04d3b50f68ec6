//! Persisted pause switches, one row per scope.

use std::sync::Arc;

use deputy_core::error::DeputyError;
use deputy_core::types::{PauseScope, PauseState, Timestamp};

use crate::db::Database;

pub struct PauseRepository {
    db: Arc<Database>,
}

impl PauseRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn save(&self, state: &PauseState) -> Result<(), DeputyError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pause_states (scope, paused, paused_at, paused_by, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (scope) DO UPDATE SET
                    paused = excluded.paused,
                    paused_at = excluded.paused_at,
                    paused_by = excluded.paused_by,
                    reason = excluded.reason",
                rusqlite::params![
                    state.scope.key(),
                    state.paused as i32,
                    state.paused_at.map(|t| t.0),
                    state.paused_by,
                    state.reason,
                ],
            )
            .map_err(|e| DeputyError::Storage(format!("Failed to save pause state: {}", e)))?;
            Ok(())
        })
    }

    /// All stored switches, paused or not.
    pub fn load_all(&self) -> Result<Vec<PauseState>, DeputyError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT scope, paused, paused_at, paused_by, reason FROM pause_states")
                .map_err(|e| DeputyError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i32>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })
                .map_err(|e| DeputyError::Storage(e.to_string()))?;

            let mut states = Vec::new();
            for row in rows {
                let (key, paused, paused_at, paused_by, reason) =
                    row.map_err(|e| DeputyError::Storage(e.to_string()))?;
                let scope = PauseScope::from_key(&key).ok_or_else(|| {
                    DeputyError::Storage(format!("Invalid pause scope: {}", key))
                })?;
                states.push(PauseState {
                    scope,
                    paused: paused != 0,
                    paused_at: paused_at.map(Timestamp),
                    paused_by,
                    reason,
                });
            }
            Ok(states)
        })
    }
}
