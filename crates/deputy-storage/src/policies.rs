//! Policy persistence.

use std::sync::Arc;

use rusqlite::OptionalExtension;
use uuid::Uuid;

use deputy_core::error::DeputyError;
use deputy_core::policy::Policy;
use deputy_core::types::Timestamp;

use crate::db::Database;

const POLICY_COLUMNS: &str =
    "id, account_id, name, conditions, action_template, priority, enabled, created_at";

pub struct PolicyRepository {
    db: Arc<Database>,
}

impl PolicyRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn insert(&self, policy: &Policy) -> Result<(), DeputyError> {
        let conditions = serde_json::to_string(&policy.conditions)?;
        let template = serde_json::to_string(&policy.action_template)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO policies (id, account_id, name, conditions, action_template,
                                       priority, enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    policy.id.to_string(),
                    policy.account_id,
                    policy.name,
                    conditions,
                    template,
                    policy.priority,
                    policy.enabled as i32,
                    policy.created_at.0,
                ],
            )
            .map_err(|e| DeputyError::Storage(format!("Failed to save policy: {}", e)))?;
            Ok(())
        })
    }

    pub fn find_by_id(&self, id: Uuid) -> Result<Option<Policy>, DeputyError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM policies WHERE id = ?1", POLICY_COLUMNS))
                .map_err(|e| DeputyError::Storage(e.to_string()))?;
            let result = stmt
                .query_row(rusqlite::params![id.to_string()], |row| Ok(row_to_policy(row)))
                .optional()
                .map_err(|e| DeputyError::Storage(e.to_string()))?;
            result.transpose()
        })
    }

    /// Policies for an account in evaluation order: priority descending,
    /// then creation order.
    pub fn list_for_account(
        &self,
        account_id: &str,
        enabled_only: bool,
    ) -> Result<Vec<Policy>, DeputyError> {
        let sql = format!(
            "SELECT {} FROM policies WHERE account_id = ?1 {} \
             ORDER BY priority DESC, created_at ASC, rowid ASC",
            POLICY_COLUMNS,
            if enabled_only { "AND enabled = 1" } else { "" }
        );
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| DeputyError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params![account_id], |row| Ok(row_to_policy(row)))
                .map_err(|e| DeputyError::Storage(e.to_string()))?;

            let mut policies = Vec::new();
            for row in rows {
                policies.push(row.map_err(|e| DeputyError::Storage(e.to_string()))??);
            }
            Ok(policies)
        })
    }

    /// Toggle a policy. Returns false if it does not exist.
    pub fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, DeputyError> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE policies SET enabled = ?1 WHERE id = ?2",
                    rusqlite::params![enabled as i32, id.to_string()],
                )
                .map_err(|e| DeputyError::Storage(format!("Failed to update policy: {}", e)))?;
            Ok(changed > 0)
        })
    }

    pub fn exists_with_name(&self, account_id: &str, name: &str) -> Result<bool, DeputyError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM policies WHERE account_id = ?1 AND name = ?2",
                    rusqlite::params![account_id, name],
                    |row| row.get(0),
                )
                .map_err(|e| DeputyError::Storage(e.to_string()))?;
            Ok(count > 0)
        })
    }
}

fn row_to_policy(row: &rusqlite::Row<'_>) -> Result<Policy, DeputyError> {
    let get_text = |idx: usize| -> Result<String, DeputyError> {
        row.get(idx).map_err(|e| DeputyError::Storage(e.to_string()))
    };

    let id = Uuid::parse_str(&get_text(0)?)
        .map_err(|e| DeputyError::Storage(format!("Invalid policy id: {}", e)))?;
    let priority: i32 = row.get(5).map_err(|e| DeputyError::Storage(e.to_string()))?;
    let enabled: i32 = row.get(6).map_err(|e| DeputyError::Storage(e.to_string()))?;
    let created_at: i64 = row.get(7).map_err(|e| DeputyError::Storage(e.to_string()))?;

    Ok(Policy {
        id,
        account_id: get_text(1)?,
        name: get_text(2)?,
        conditions: serde_json::from_str(&get_text(3)?)?,
        action_template: serde_json::from_str(&get_text(4)?)?,
        priority,
        enabled: enabled != 0,
        created_at: Timestamp(created_at),
    })
}
