//! Session Registry - persistent session records.
//!
//! A session's thread is created at most once: `create` on an existing id is
//! idempotent, and a forced re-init may only reactivate the record on the
//! thread it already owns (`DuplicateThread` otherwise).

use std::time::Duration;

use claude_mattermost_protocol::{Session, SessionStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use crate::error::{in_table, CoreError, CoreResult};
use crate::store::now_ms;

const SESSION_COLUMNS: &str =
    "id, project_path, thread_id, channel_id, created_at, last_active, status";

/// Fields for a new session record
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub project_path: String,
    pub thread_id: String,
    pub channel_id: String,
}

/// Optional filters for `list`
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub project_path: Option<String>,
}

impl SessionFilter {
    pub fn active() -> Self {
        Self {
            status: Some(SessionStatus::Active),
            project_path: None,
        }
    }
}

pub struct SessionRegistry<'a> {
    conn: &'a Connection,
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(6)?;
    let status = status.parse::<SessionStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Session {
        id: row.get(0)?,
        project_path: row.get(1)?,
        thread_id: row.get(2)?,
        channel_id: row.get(3)?,
        created_at: row.get(4)?,
        last_active: row.get(5)?,
        status,
    })
}

impl<'a> SessionRegistry<'a> {
    pub(crate) fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Create the session, or return the existing record unchanged.
    ///
    /// With `force`, an existing record is reactivated, but only on the thread
    /// it already owns.
    pub fn create(&self, new: NewSession, force: bool) -> CoreResult<Session> {
        if let Some(existing) = self.find(&new.id)? {
            if !force {
                return Ok(existing);
            }
            if existing.thread_id != new.thread_id {
                return Err(CoreError::DuplicateThread {
                    id: existing.id,
                    existing: existing.thread_id,
                    requested: new.thread_id,
                });
            }
            self.conn.execute(
                "UPDATE sessions SET status = 'active', last_active = ?1 WHERE id = ?2",
                params![now_ms(), new.id],
            )?;
            info!(
                component = "registry",
                event = "session.reactivated",
                session_id = %new.id,
                thread_id = %existing.thread_id,
                "Session reactivated"
            );
            return self.get(&new.id);
        }

        let now = now_ms();
        // A concurrent creator may have won since `find`; keep its row.
        self.conn.execute(
            "INSERT INTO sessions (id, project_path, thread_id, channel_id, created_at, last_active, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, 'active')
             ON CONFLICT(id) DO NOTHING",
            params![new.id, new.project_path, new.thread_id, new.channel_id, now],
        )?;
        info!(
            component = "registry",
            event = "session.created",
            session_id = %new.id,
            project_path = %new.project_path,
            thread_id = %new.thread_id,
            "Session created"
        );
        self.get(&new.id)
    }

    pub fn get(&self, id: &str) -> CoreResult<Session> {
        self.find(id)?
            .ok_or_else(|| CoreError::session_not_found(id))
    }

    pub fn find(&self, id: &str) -> CoreResult<Option<Session>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                params![id],
                session_from_row,
            )
            .optional()
            .map_err(|e| in_table("sessions")(e.into()))
    }

    /// The active session bound to `thread_id`, if any.
    pub fn find_by_thread(&self, thread_id: &str) -> CoreResult<Option<Session>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM sessions WHERE thread_id = ?1 AND status = 'active'
                     ORDER BY last_active DESC LIMIT 1",
                    SESSION_COLUMNS
                ),
                params![thread_id],
                session_from_row,
            )
            .optional()
            .map_err(|e| in_table("sessions")(e.into()))
    }

    /// Bump `last_active` to now.
    pub fn touch(&self, id: &str) -> CoreResult<()> {
        let changed = self.conn.execute(
            "UPDATE sessions SET last_active = ?1 WHERE id = ?2",
            params![now_ms(), id],
        )?;
        if changed == 0 {
            return Err(CoreError::session_not_found(id));
        }
        Ok(())
    }

    pub fn set_status(&self, id: &str, status: SessionStatus) -> CoreResult<()> {
        let changed = self.conn.execute(
            "UPDATE sessions SET status = ?1, last_active = ?2 WHERE id = ?3",
            params![status.as_str(), now_ms(), id],
        )?;
        if changed == 0 {
            return Err(CoreError::session_not_found(id));
        }
        info!(
            component = "registry",
            event = "session.status_changed",
            session_id = %id,
            status = %status,
            "Session status changed"
        );
        Ok(())
    }

    /// Sessions matching `filter`, most recently active first.
    pub fn list(&self, filter: &SessionFilter) -> CoreResult<Vec<Session>> {
        let mut clauses = Vec::new();
        let mut values: Vec<&dyn rusqlite::ToSql> = Vec::new();
        let status = filter.status.map(|s| s.as_str());

        if let Some(ref s) = status {
            clauses.push("status = ?");
            values.push(s);
        }
        if let Some(ref p) = filter.project_path {
            clauses.push("project_path = ?");
            values.push(p);
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM sessions {} ORDER BY last_active DESC",
            SESSION_COLUMNS, where_sql
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), session_from_row)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| in_table("sessions")(e.into()))
    }

    /// Move active sessions idle since before `cutoff` to `timed_out`.
    /// Returns the ids that transitioned.
    pub fn time_out_idle(&self, cutoff: i64) -> CoreResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "UPDATE sessions SET status = 'timed_out'
             WHERE status = 'active' AND last_active < ?1
             RETURNING id",
        )?;
        let ids = stmt
            .query_map(params![cutoff], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        if !ids.is_empty() {
            info!(
                component = "registry",
                event = "sessions.timed_out",
                count = ids.len(),
                "Timed out idle sessions"
            );
        }
        Ok(ids)
    }

    /// Delete sessions (and their approval rows) whose `last_active` is
    /// older than `age`.
    pub fn purge_older_than(&self, age: Duration) -> CoreResult<Vec<String>> {
        let cutoff = now_ms() - i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
        self.purge_before(cutoff)
    }

    pub(crate) fn purge_before(&self, cutoff: i64) -> CoreResult<Vec<String>> {
        let tx = self.conn.unchecked_transaction()?;
        let ids = {
            let mut stmt = tx.prepare("SELECT id FROM sessions WHERE last_active < ?1")?;
            let ids = stmt
                .query_map(params![cutoff], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };
        tx.execute(
            "DELETE FROM pending_approvals
             WHERE session_id IN (SELECT id FROM sessions WHERE last_active < ?1)",
            params![cutoff],
        )?;
        tx.execute(
            "DELETE FROM sessions WHERE last_active < ?1",
            params![cutoff],
        )?;
        tx.commit()?;

        info!(
            component = "registry",
            event = "sessions.purged",
            count = ids.len(),
            cutoff = cutoff,
            "Purged old sessions"
        );
        Ok(ids)
    }

    #[cfg(test)]
    pub(crate) fn set_last_active(&self, id: &str, last_active: i64) -> CoreResult<()> {
        self.conn.execute(
            "UPDATE sessions SET last_active = ?1 WHERE id = ?2",
            params![last_active, id],
        )?;
        Ok(())
    }
}
