//! Versioned schema migrations.
//!
//! Each migration runs once inside its own transaction; applied versions are
//! recorded in `_migrations`.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

struct Migration {
    version: u32,
    description: &'static str,
    /// May contain multiple statements separated by `;`.
    sql: &'static str,
}

/// Append new migrations to the end.  Never edit an applied one.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "request contexts and transition history",
        sql: r#"
            CREATE TABLE request_contexts (
                request_id           TEXT PRIMARY KEY,
                state                TEXT NOT NULL CHECK(state IN (
                    'received','routing','risk_assessing','awaiting_approval',
                    'approved','rejected','edited','expired',
                    'dispatching','completed','failed')),
                payload              TEXT NOT NULL,
                decision             TEXT,
                edited_decision      TEXT,
                risk                 TEXT,
                approval_id          TEXT,
                workflow_instance_id TEXT,
                result               TEXT,
                error                TEXT,
                created_at           INTEGER NOT NULL,
                updated_at           INTEGER NOT NULL,
                version              INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX idx_contexts_state ON request_contexts(state, updated_at);

            CREATE TABLE request_transitions (
                request_id TEXT NOT NULL REFERENCES request_contexts(request_id) ON DELETE CASCADE,
                seq        INTEGER NOT NULL,
                from_state TEXT NOT NULL,
                to_state   TEXT NOT NULL,
                reason     TEXT NOT NULL,
                at         INTEGER NOT NULL,
                PRIMARY KEY (request_id, seq)
            );
        "#,
    },
    Migration {
        version: 2,
        description: "approvals",
        sql: r#"
            CREATE TABLE approvals (
                approval_id      TEXT PRIMARY KEY,
                request_id       TEXT NOT NULL,
                tier             TEXT NOT NULL,
                status           TEXT NOT NULL CHECK(status IN (
                    'pending','approved','rejected','edited',
                    'expired','escalated','cancelled')),
                created_at       INTEGER NOT NULL,
                expires_at       INTEGER NOT NULL,
                escalation_count INTEGER NOT NULL DEFAULT 0,
                escalated_to     TEXT,
                risk             TEXT NOT NULL,
                decision         TEXT NOT NULL,
                resolution       TEXT,
                version          INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX idx_approvals_pending ON approvals(status, expires_at);
            CREATE INDEX idx_approvals_request ON approvals(request_id);
        "#,
    },
    Migration {
        version: 3,
        description: "route utterance embeddings keyed by model",
        sql: r#"
            CREATE TABLE route_embeddings (
                model_id   TEXT NOT NULL,
                text_hash  TEXT NOT NULL,
                dims       INTEGER NOT NULL,
                vector     BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (model_id, text_hash)
            );
        "#,
    },
];

// ── public API ───────────────────────────────────────────────────────

/// Run all pending migrations against `conn`.
///
/// Synchronous; call from `spawn_blocking`.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(current_version = current, "database schema is up to date");
        return Ok(());
    }

    info!(
        current_version = current,
        pending = pending.len(),
        "running pending migrations"
    );
    for migration in pending {
        apply(conn, migration)?;
    }
    Ok(())
}

/// Latest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to read current version: {e}"),
    })
}

// ── internals ────────────────────────────────────────────────────────

fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })
}

fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    let fail = |message: String| StoreError::Migration {
        version: migration.version,
        message,
    };

    // `transaction()` needs `&mut Connection`; manage it by hand.
    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| fail(format!("failed to begin transaction: {e}")))?;

    let result = conn
        .execute_batch(migration.sql)
        .map_err(|e| fail(format!("SQL execution failed: {e}")))
        .and_then(|()| {
            conn.execute(
                "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    migration.version,
                    migration.description,
                    chrono::Utc::now().timestamp()
                ],
            )
            .map(|_| ())
            .map_err(|e| fail(format!("failed to record migration: {e}")))
        });

    match result {
        Ok(()) => conn
            .execute_batch("COMMIT;")
            .map_err(|e| fail(format!("failed to commit: {e}"))),
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
            Err(err)
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const LATEST_VERSION: u32 = 3;

    fn setup_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        conn
    }

    #[test]
    fn migrations_are_ordered() {
        for window in MIGRATIONS.windows(2) {
            assert!(window[1].version > window[0].version);
        }
        assert_eq!(MIGRATIONS.last().map(|m| m.version), Some(LATEST_VERSION));
    }

    #[test]
    fn run_all_is_idempotent() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);
    }

    #[test]
    fn state_check_constraint_rejects_unknown_states() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        let bad = conn.execute(
            "INSERT INTO request_contexts (request_id, state, payload, created_at, updated_at) \
             VALUES ('r', 'teleported', '{}', 0, 0)",
            [],
        );
        assert!(bad.is_err());
    }

    #[test]
    fn transitions_cascade_with_their_context() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO request_contexts (request_id, state, payload, created_at, updated_at) \
                 VALUES ('r1', 'routing', '{}', 0, 0);
             INSERT INTO request_transitions (request_id, seq, from_state, to_state, reason, at) \
                 VALUES ('r1', 0, 'received', 'routing', 'start', 0);
             DELETE FROM request_contexts WHERE request_id = 'r1';",
        )
        .unwrap();
        let left: i64 = conn
            .query_row("SELECT count(*) FROM request_transitions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(left, 0);
    }
}
