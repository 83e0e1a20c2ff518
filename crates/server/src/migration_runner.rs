//! Lightweight migration runner for rusqlite.
//!
//! Migrations are numbered SQL files under `migrations/`, compiled into the
//! binary. Applied versions are tracked in `schema_versions`; any pending
//! migrations run in order every time a connection is opened. The daemon and
//! each hook process may race here, so the check-and-apply step holds an
//! immediate (write) transaction.

use rusqlite::{params, Connection, TransactionBehavior};
use tracing::info;

/// (version, name, sql)
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "001_initial",
        include_str!("../../../migrations/001_initial.sql"),
    ),
    (
        2,
        "002_message_dedupe",
        include_str!("../../../migrations/002_message_dedupe.sql"),
    ),
];

/// Run all pending migrations against the given connection.
///
/// Call this before any other database operations.
pub fn run_migrations(conn: &mut Connection) -> rusqlite::Result<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
    )?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut applied = 0;
    for (version, name, sql) in MIGRATIONS {
        let done: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM schema_versions WHERE version = ?1)",
            params![version],
            |row| row.get(0),
        )?;
        if done {
            continue;
        }

        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_versions (version, name) VALUES (?1, ?2)",
            params![version, name],
        )?;

        info!(
            component = "migrations",
            event = "migration.applied",
            version = version,
            name = %name,
            "Applied migration"
        );
        applied += 1;
    }
    tx.commit()?;

    Ok(applied)
}
