//! Database schema migrations.
//!
//! Applies the initial schema: actions, audit_records, trust_levels,
//! trust_action_counts, trust_history, policies, pause_states, and the
//! schema_migrations bookkeeping table.

use rusqlite::Connection;
use tracing::info;

use deputy_core::error::DeputyError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), DeputyError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| DeputyError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| DeputyError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<(), DeputyError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS actions (
            id                  TEXT PRIMARY KEY NOT NULL,
            account_id          TEXT NOT NULL,
            action_type         TEXT NOT NULL,
            payload             TEXT NOT NULL,
            origin              TEXT NOT NULL CHECK (origin IN ('human', 'policy')),
            policy_id           TEXT,
            state               TEXT NOT NULL
                                CHECK (state IN ('pending', 'undone', 'ready', 'executing',
                                                 'executed', 'failed', 'expired')),
            undo_deadline       INTEGER NOT NULL,
            created_at          INTEGER NOT NULL,
            state_changed_at    INTEGER NOT NULL,
            supersedes          TEXT REFERENCES actions(id),
            CHECK ((origin = 'policy') = (policy_id IS NOT NULL))
        );

        CREATE INDEX IF NOT EXISTS idx_actions_account
            ON actions (account_id, created_at DESC);

        CREATE INDEX IF NOT EXISTS idx_actions_state_deadline
            ON actions (state, undo_deadline ASC);

        -- Only state and state_changed_at may ever change.
        CREATE TRIGGER IF NOT EXISTS actions_content_immutable
        BEFORE UPDATE OF id, account_id, action_type, payload, origin, policy_id,
                         undo_deadline, created_at, supersedes ON actions
        BEGIN
            SELECT RAISE(ABORT, 'action content is immutable');
        END;

        CREATE TRIGGER IF NOT EXISTS actions_terminal_final
        BEFORE UPDATE OF state ON actions
        WHEN OLD.state IN ('undone', 'executed', 'failed', 'expired')
        BEGIN
            SELECT RAISE(ABORT, 'terminal action state is final');
        END;

        CREATE TRIGGER IF NOT EXISTS actions_no_delete
        BEFORE DELETE ON actions
        BEGIN
            SELECT RAISE(ABORT, 'actions are never deleted');
        END;

        -- Append-only audit log with a per-account hash chain.
        CREATE TABLE IF NOT EXISTS audit_records (
            seq             INTEGER PRIMARY KEY AUTOINCREMENT,
            id              TEXT NOT NULL UNIQUE,
            account_id      TEXT NOT NULL,
            action_id       TEXT NOT NULL,
            from_state      TEXT NOT NULL,
            to_state        TEXT NOT NULL,
            actor           TEXT NOT NULL,
            timestamp       INTEGER NOT NULL,
            result_summary  TEXT NOT NULL,
            prev_digest     TEXT,
            digest          TEXT NOT NULL UNIQUE
        );

        CREATE INDEX IF NOT EXISTS idx_audit_account_seq
            ON audit_records (account_id, seq ASC);

        CREATE INDEX IF NOT EXISTS idx_audit_action_seq
            ON audit_records (action_id, seq ASC);

        CREATE INDEX IF NOT EXISTS idx_audit_account_time
            ON audit_records (account_id, timestamp ASC);

        -- A chain link may be claimed once; a second claim would fork the chain.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_audit_chain_link
            ON audit_records (account_id, prev_digest)
            WHERE prev_digest IS NOT NULL;

        CREATE TRIGGER IF NOT EXISTS audit_records_no_update
        BEFORE UPDATE ON audit_records
        BEGIN
            SELECT RAISE(ABORT, 'audit log is append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS audit_records_no_delete
        BEFORE DELETE ON audit_records
        BEGIN
            SELECT RAISE(ABORT, 'audit log is append-only');
        END;

        CREATE TABLE IF NOT EXISTS trust_levels (
            account_id          TEXT PRIMARY KEY NOT NULL,
            current_level       INTEGER NOT NULL CHECK (current_level BETWEEN 1 AND 5),
            level_entered_at    INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS trust_action_counts (
            account_id      TEXT NOT NULL REFERENCES trust_levels(account_id),
            action_type     TEXT NOT NULL,
            count           INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (account_id, action_type)
        );

        CREATE TABLE IF NOT EXISTS trust_history (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id      TEXT NOT NULL REFERENCES trust_levels(account_id),
            from_level      INTEGER NOT NULL,
            to_level        INTEGER NOT NULL,
            reason          TEXT NOT NULL,
            changed_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_trust_history_account
            ON trust_history (account_id, id ASC);

        CREATE TABLE IF NOT EXISTS policies (
            id              TEXT PRIMARY KEY NOT NULL,
            account_id      TEXT NOT NULL,
            name            TEXT NOT NULL,
            conditions      TEXT NOT NULL,
            action_template TEXT NOT NULL,
            priority        INTEGER NOT NULL DEFAULT 0,
            enabled         INTEGER NOT NULL DEFAULT 1,
            created_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_policies_account_priority
            ON policies (account_id, priority DESC, created_at ASC);

        CREATE TABLE IF NOT EXISTS pause_states (
            scope       TEXT PRIMARY KEY NOT NULL,
            paused      INTEGER NOT NULL DEFAULT 0,
            paused_at   INTEGER,
            paused_by   TEXT,
            reason      TEXT
        );

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| DeputyError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}
