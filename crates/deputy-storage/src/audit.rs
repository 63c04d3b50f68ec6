//! Append-only audit record persistence.
//!
//! Records are only ever inserted through [`append_record`], which runs on
//! the caller's transaction so the state change and its audit entry commit
//! or roll back together. There is no update or delete path.

use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use deputy_core::audit::{AuditDraft, AuditRecord};
use deputy_core::error::DeputyError;
use deputy_core::types::Timestamp;

use crate::db::Database;

const AUDIT_COLUMNS: &str = "seq, id, account_id, action_id, from_state, to_state, actor, \
                             timestamp, result_summary, prev_digest, digest";

/// Filters for reading an account's audit trail.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub account_id: String,
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
    pub action_id: Option<Uuid>,
    pub limit: Option<u32>,
}

impl AuditQuery {
    pub fn for_account(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            ..Default::default()
        }
    }
}

/// Link `draft` onto its account chain and insert it.
///
/// Every failure is reported as [`DeputyError::AuditWrite`]; callers must
/// not commit the surrounding transaction in that case.
pub fn append_record(conn: &Connection, draft: AuditDraft) -> Result<AuditRecord, DeputyError> {
    let prev_digest: Option<String> = conn
        .query_row(
            "SELECT digest FROM audit_records WHERE account_id = ?1 ORDER BY seq DESC LIMIT 1",
            rusqlite::params![draft.account_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| DeputyError::AuditWrite(format!("Failed to read chain head: {}", e)))?;

    let mut record = draft.seal(prev_digest);
    conn.execute(
        "INSERT INTO audit_records (id, account_id, action_id, from_state, to_state, actor,
                                    timestamp, result_summary, prev_digest, digest)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            record.id.to_string(),
            record.account_id,
            record.action_id.to_string(),
            record.from_state.to_string(),
            record.to_state.to_string(),
            record.actor.to_string(),
            record.timestamp.0,
            record.result_summary,
            record.prev_digest,
            record.digest,
        ],
    )
    .map_err(|e| DeputyError::AuditWrite(format!("Failed to insert audit record: {}", e)))?;
    record.seq = conn.last_insert_rowid();
    Ok(record)
}

/// Read-only access to the audit log.
pub struct AuditRepository {
    db: Arc<Database>,
}

impl AuditRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Records matching `query`, oldest first.
    pub fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>, DeputyError> {
        let mut sql = format!(
            "SELECT {} FROM audit_records WHERE account_id = ?1",
            AUDIT_COLUMNS
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(query.account_id.clone())];

        if let Some(since) = query.since {
            params.push(Box::new(since.0));
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len()));
        }
        if let Some(until) = query.until {
            params.push(Box::new(until.0));
            sql.push_str(&format!(" AND timestamp <= ?{}", params.len()));
        }
        if let Some(action_id) = query.action_id {
            params.push(Box::new(action_id.to_string()));
            sql.push_str(&format!(" AND action_id = ?{}", params.len()));
        }
        sql.push_str(" ORDER BY seq ASC");
        if let Some(limit) = query.limit {
            params.push(Box::new(limit));
            sql.push_str(&format!(" LIMIT ?{}", params.len()));
        }

        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| DeputyError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                    Ok(row_to_record(row))
                })
                .map_err(|e| DeputyError::Storage(e.to_string()))?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row.map_err(|e| DeputyError::Storage(e.to_string()))??);
            }
            Ok(records)
        })
    }

    /// The complete chain for an account, oldest first.
    pub fn chain(&self, account_id: &str) -> Result<Vec<AuditRecord>, DeputyError> {
        self.query(&AuditQuery::for_account(account_id))
    }

    /// Every record for one action, in the order the transitions happened.
    pub fn for_action(&self, action_id: Uuid) -> Result<Vec<AuditRecord>, DeputyError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM audit_records WHERE action_id = ?1 ORDER BY seq ASC",
                    AUDIT_COLUMNS
                ))
                .map_err(|e| DeputyError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params![action_id.to_string()], |row| {
                    Ok(row_to_record(row))
                })
                .map_err(|e| DeputyError::Storage(e.to_string()))?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row.map_err(|e| DeputyError::Storage(e.to_string()))??);
            }
            Ok(records)
        })
    }

    /// Total number of records across all accounts.
    pub fn count(&self) -> Result<u64, DeputyError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM audit_records", [], |row| row.get(0))
                .map_err(|e| DeputyError::Storage(e.to_string()))?;
            Ok(count as u64)
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<AuditRecord, DeputyError> {
    let get_text = |idx: usize| -> Result<String, DeputyError> {
        row.get(idx).map_err(|e| DeputyError::Storage(e.to_string()))
    };

    let seq: i64 = row.get(0).map_err(|e| DeputyError::Storage(e.to_string()))?;
    let id = Uuid::parse_str(&get_text(1)?)
        .map_err(|e| DeputyError::Storage(format!("Invalid audit id: {}", e)))?;
    let action_id = Uuid::parse_str(&get_text(3)?)
        .map_err(|e| DeputyError::Storage(format!("Invalid action id: {}", e)))?;
    let timestamp: i64 = row.get(7).map_err(|e| DeputyError::Storage(e.to_string()))?;
    let prev_digest: Option<String> =
        row.get(9).map_err(|e| DeputyError::Storage(e.to_string()))?;

    Ok(AuditRecord {
        seq,
        id,
        account_id: get_text(2)?,
        action_id,
        from_state: get_text(4)?.parse().map_err(DeputyError::Storage)?,
        to_state: get_text(5)?.parse().map_err(DeputyError::Storage)?,
        actor: get_text(6)?.parse().map_err(DeputyError::Storage)?,
        timestamp: Timestamp(timestamp),
        result_summary: get_text(8)?,
        prev_digest,
        digest: get_text(10)?,
    })
}
