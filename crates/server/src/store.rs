//! Persistent store - one SQLite database shared by the daemon and every hook
//! process.
//!
//! Each process opens its own connection (WAL + busy timeout) and every
//! mutating call commits before returning. `synchronous = FULL` syncs the WAL
//! on every commit, so a successful call also survives power loss.
//! Cross-process safety comes from single-statement conditional updates, never
//! from in-process locks.

use std::path::Path;

use claude_mattermost_protocol::Cursor;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::approvals::ApprovalTable;
use crate::error::{in_table, CoreError, CoreResult};
use crate::migration_runner;
use crate::registry::SessionRegistry;

const CURSOR_KEY: &str = "poll_cursor";

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database at `path` and bring its schema
    /// up to date.
    pub fn open(path: &Path) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = FULL;",
        )?;
        migration_runner::run_migrations(&mut conn)?;
        debug!(component = "store", path = %path.display(), "Store opened");

        Ok(Self { conn })
    }

    pub fn sessions(&self) -> SessionRegistry<'_> {
        SessionRegistry::new(&self.conn)
    }

    pub fn approvals(&self) -> ApprovalTable<'_> {
        ApprovalTable::new(&self.conn)
    }

    /// Last persisted poll cursor, if the daemon has ever run.
    pub fn load_cursor(&self) -> CoreResult<Option<Cursor>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM daemon_state WHERE key = ?1",
                params![CURSOR_KEY],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|value| {
            value
                .parse::<i64>()
                .map(Cursor)
                .map_err(|e| CoreError::Corrupt {
                    table: "daemon_state",
                    detail: format!("poll cursor '{}': {}", value, e),
                })
        })
        .transpose()
        .map_err(in_table("daemon_state"))
    }

    /// Persist the poll cursor. Never moves it backwards.
    pub fn save_cursor(&self, cursor: Cursor) -> CoreResult<()> {
        self.conn.execute(
            "INSERT INTO daemon_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value
             WHERE CAST(daemon_state.value AS INTEGER) < CAST(excluded.value AS INTEGER)",
            params![CURSOR_KEY, cursor.0.to_string()],
        )?;
        Ok(())
    }

    /// Whether the daemon already finished with `message_id`.
    pub fn is_processed(&self, message_id: &str) -> CoreResult<bool> {
        let seen: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM processed_messages WHERE message_id = ?1)",
            params![message_id],
            |row| row.get(0),
        )?;
        Ok(seen)
    }

    pub fn mark_processed(&self, message_id: &str, created_at: i64) -> CoreResult<()> {
        self.conn.execute(
            "INSERT INTO processed_messages (message_id, created_at) VALUES (?1, ?2)
             ON CONFLICT(message_id) DO NOTHING",
            params![message_id, created_at],
        )?;
        Ok(())
    }

    /// Forget processed messages older than `cursor`; polls never return
    /// them again.
    pub fn prune_processed(&self, cursor: Cursor) -> CoreResult<usize> {
        let removed = self.conn.execute(
            "DELETE FROM processed_messages WHERE created_at < ?1",
            params![cursor.0],
        )?;
        Ok(removed)
    }
}

/// Current time in Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Human-readable rendering of a stored timestamp
pub fn format_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| {
            dt.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| ms.to_string())
}
