//! Pending Approval Table.
//!
//! `claim` is the single arbiter of who resolves a request: a conditional
//! UPDATE that only matches while the row is still `pending`. Whoever changes
//! the row wins, everyone else gets `ConflictingResolution`.

use claude_mattermost_protocol::{ApprovalStatus, PendingApproval, Resolver};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::error::{in_table, CoreError, CoreResult};

const APPROVAL_COLUMNS: &str = "a.request_id, a.session_id, a.tool_name, a.command, \
     a.description, a.created_at, a.deadline, a.status, a.response_path, a.resolved_at";

/// Fields for a new approval request
#[derive(Debug, Clone)]
pub struct NewApproval {
    pub request_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub command: String,
    pub description: String,
    pub created_at: i64,
    pub deadline: i64,
    pub response_path: String,
}

/// Row counts by status, for `status` output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApprovalCounts {
    pub pending: u64,
    pub approved: u64,
    pub denied: u64,
    pub expired: u64,
}

pub struct ApprovalTable<'a> {
    conn: &'a Connection,
}

fn approval_from_row(row: &Row<'_>) -> rusqlite::Result<PendingApproval> {
    let status: String = row.get(7)?;
    let status = status.parse::<ApprovalStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(PendingApproval {
        request_id: row.get(0)?,
        session_id: row.get(1)?,
        tool_name: row.get(2)?,
        command: row.get(3)?,
        description: row.get(4)?,
        created_at: row.get(5)?,
        deadline: row.get(6)?,
        status,
        response_path: row.get(8)?,
        resolved_at: row.get(9)?,
    })
}

impl<'a> ApprovalTable<'a> {
    pub(crate) fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, new: &NewApproval) -> CoreResult<PendingApproval> {
        self.conn.execute(
            "INSERT INTO pending_approvals
                (request_id, session_id, tool_name, command, description,
                 created_at, deadline, status, response_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
            params![
                new.request_id,
                new.session_id,
                new.tool_name,
                new.command,
                new.description,
                new.created_at,
                new.deadline,
                new.response_path,
            ],
        )?;
        debug!(
            component = "approvals",
            event = "approval.inserted",
            request_id = %new.request_id,
            session_id = %new.session_id,
            tool_name = %new.tool_name,
            deadline = new.deadline,
            "Approval request recorded"
        );
        self.get(&new.request_id)
    }

    pub fn get(&self, request_id: &str) -> CoreResult<PendingApproval> {
        self.find(request_id)?
            .ok_or_else(|| CoreError::approval_not_found(request_id))
    }

    pub fn find(&self, request_id: &str) -> CoreResult<Option<PendingApproval>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM pending_approvals a WHERE a.request_id = ?1",
                    APPROVAL_COLUMNS
                ),
                params![request_id],
                approval_from_row,
            )
            .optional()
            .map_err(|e| in_table("pending_approvals")(e.into()))
    }

    /// Newest pending request belonging to the session that owns `thread_id`.
    pub fn latest_pending_for_thread(&self, thread_id: &str) -> CoreResult<Option<PendingApproval>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM pending_approvals a
                     JOIN sessions s ON s.id = a.session_id
                     WHERE s.thread_id = ?1 AND a.status = 'pending'
                     ORDER BY a.created_at DESC, a.rowid DESC
                     LIMIT 1",
                    APPROVAL_COLUMNS
                ),
                params![thread_id],
                approval_from_row,
            )
            .optional()
            .map_err(|e| in_table("pending_approvals")(e.into()))
    }

    /// Pending requests in `thread_id` whose id starts with `prefix`.
    pub fn pending_by_prefix(
        &self,
        thread_id: &str,
        prefix: &str,
    ) -> CoreResult<Vec<PendingApproval>> {
        let pattern = format!("{}%", prefix.replace(['%', '_'], ""));
        self.query(
            "JOIN sessions s ON s.id = a.session_id
             WHERE s.thread_id = ?1 AND a.status = 'pending' AND a.request_id LIKE ?2
             ORDER BY a.created_at DESC",
            params![thread_id, pattern],
        )
    }

    pub fn pending_for_session(&self, session_id: &str) -> CoreResult<Vec<PendingApproval>> {
        self.query(
            "WHERE a.session_id = ?1 AND a.status = 'pending' ORDER BY a.created_at",
            params![session_id],
        )
    }

    pub fn all_pending(&self) -> CoreResult<Vec<PendingApproval>> {
        self.query("WHERE a.status = 'pending' ORDER BY a.created_at", [])
    }

    /// Pending requests whose deadline is strictly before `now`.
    pub fn overdue(&self, now: i64) -> CoreResult<Vec<PendingApproval>> {
        self.query(
            "WHERE a.status = 'pending' AND a.deadline < ?1 ORDER BY a.deadline",
            params![now],
        )
    }

    /// Move `request_id` out of `pending`. Exactly one caller ever succeeds;
    /// the rest get `ConflictingResolution` carrying the winning status.
    pub fn claim(
        &self,
        request_id: &str,
        status: ApprovalStatus,
        resolver: Resolver,
        now: i64,
    ) -> CoreResult<()> {
        self.claim_with(request_id, status, resolver, None, now)
    }

    /// `claim` on behalf of a thread reply, remembering which message won
    /// so a replay of it can be recognised with [`Self::resolved_by_message`].
    pub fn claim_for_message(
        &self,
        request_id: &str,
        status: ApprovalStatus,
        message_id: &str,
        now: i64,
    ) -> CoreResult<()> {
        self.claim_with(request_id, status, Resolver::Reply, Some(message_id), now)
    }

    /// The request a reply message already resolved, if any.
    pub fn resolved_by_message(&self, message_id: &str) -> CoreResult<Option<PendingApproval>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM pending_approvals a WHERE a.resolved_message_id = ?1",
                    APPROVAL_COLUMNS
                ),
                params![message_id],
                approval_from_row,
            )
            .optional()
            .map_err(|e| in_table("pending_approvals")(e.into()))
    }

    fn claim_with(
        &self,
        request_id: &str,
        status: ApprovalStatus,
        resolver: Resolver,
        message_id: Option<&str>,
        now: i64,
    ) -> CoreResult<()> {
        if !status.is_terminal() {
            return Err(CoreError::Config(format!(
                "cannot resolve approval {} to {}",
                request_id, status
            )));
        }

        let changed = self.conn.execute(
            "UPDATE pending_approvals
             SET status = ?1, resolved_at = ?2, resolved_by = ?3, resolved_message_id = ?4
             WHERE request_id = ?5 AND status = 'pending'",
            params![status.as_str(), now, resolver.as_str(), message_id, request_id],
        )?;

        if changed == 1 {
            info!(
                component = "approvals",
                event = "approval.resolved",
                request_id = %request_id,
                status = %status,
                resolver = resolver.as_str(),
                "Approval resolved"
            );
            return Ok(());
        }

        let current = self.get(request_id)?;
        debug!(
            component = "approvals",
            event = "approval.claim_lost",
            request_id = %request_id,
            attempted = %status,
            current = %current.status,
            "Approval already resolved"
        );
        Err(CoreError::ConflictingResolution {
            request_id: request_id.to_string(),
            status: current.status,
        })
    }

    pub fn counts(&self) -> CoreResult<ApprovalCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM pending_approvals GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = ApprovalCounts::default();
        for row in rows {
            let (status, n) = row?;
            let n = n.max(0) as u64;
            match status.parse::<ApprovalStatus>() {
                Ok(ApprovalStatus::Pending) => counts.pending = n,
                Ok(ApprovalStatus::Approved) => counts.approved = n,
                Ok(ApprovalStatus::Denied) => counts.denied = n,
                Ok(ApprovalStatus::Expired) => counts.expired = n,
                Err(e) => {
                    return Err(CoreError::Corrupt {
                        table: "pending_approvals",
                        detail: e.to_string(),
                    })
                }
            }
        }
        Ok(counts)
    }

    fn query<P: rusqlite::Params>(&self, tail: &str, params: P) -> CoreResult<Vec<PendingApproval>> {
        let sql = format!(
            "SELECT {} FROM pending_approvals a {}",
            APPROVAL_COLUMNS, tail
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params, approval_from_row)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| in_table("pending_approvals")(e.into()))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::store::test_support::temp_store;
    use crate::store::Store;

    #[test]
    fn first_claim_wins_and_second_conflicts() {
        let (_dir, store) = temp_store();
        seed_session(&store, "s1", "T1");
        insert_now(&store, "req-1", "s1");

        let table = store.approvals();
        table
            .claim("req-1", ApprovalStatus::Approved, Resolver::Reply, 10)
            .unwrap();
        let err = table
            .claim("req-1", ApprovalStatus::Expired, Resolver::Sweep, 11)
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::ConflictingResolution {
                status: ApprovalStatus::Approved,
                ..
            }
        ));

        let row = table.get("req-1").unwrap();
        assert_eq!(row.status, ApprovalStatus::Approved);
        assert_eq!(row.resolved_at, Some(10));
    }

    #[test]
    fn reply_claims_remember_their_message() {
        let (_dir, store) = temp_store();
        seed_session(&store, "s1", "T1");
        insert_now(&store, "req-1", "s1");
        insert_now(&store, "req-2", "s1");

        let table = store.approvals();
        table
            .claim_for_message("req-1", ApprovalStatus::Approved, "m7", 10)
            .unwrap();
        let resolved = table.resolved_by_message("m7").unwrap().unwrap();
        assert_eq!(resolved.request_id, "req-1");
        assert!(table.resolved_by_message("m8").unwrap().is_none());

        // One message can never be recorded against a second request.
        assert!(table
            .claim_for_message("req-2", ApprovalStatus::Approved, "m7", 11)
            .is_err());
        assert_eq!(table.get("req-2").unwrap().status, ApprovalStatus::Pending);
    }

    #[test]
    fn claim_of_unknown_request_is_not_found() {
        let (_dir, store) = temp_store();
        let err = store
            .approvals()
            .claim("ghost", ApprovalStatus::Denied, Resolver::Reply, 1)
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { kind: "approval", .. }));
    }

    #[test]
    fn claim_to_pending_is_rejected() {
        let (_dir, store) = temp_store();
        seed_session(&store, "s1", "T1");
        insert_now(&store, "req-1", "s1");
        assert!(store
            .approvals()
            .claim("req-1", ApprovalStatus::Pending, Resolver::Reply, 1)
            .is_err());
        assert_eq!(
            store.approvals().get("req-1").unwrap().status,
            ApprovalStatus::Pending
        );
    }

    #[test]
    fn concurrent_claims_from_separate_connections_have_one_winner() {
        let (dir, store) = temp_store();
        seed_session(&store, "s1", "T1");
        insert_now(&store, "req-1", "s1");
        let db = dir.path().join("sessions.db");

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));
        let handles: Vec<_> = [ApprovalStatus::Approved, ApprovalStatus::Expired]
            .into_iter()
            .map(|status| {
                let db = db.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let store = Store::open(&db).unwrap();
                    barrier.wait();
                    store
                        .approvals()
                        .claim("req-1", status, Resolver::Reply, 5)
                        .is_ok()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert!(store.approvals().get("req-1").unwrap().status.is_terminal());
    }

    #[test]
    fn overdue_excludes_requests_at_their_deadline() {
        let (_dir, store) = temp_store();
        seed_session(&store, "s1", "T1");
        let table = store.approvals();
        table.insert(&new_approval("req-1", "s1", 1_000)).unwrap();
        let deadline = 1_000 + 300_000;

        assert!(table.overdue(deadline).unwrap().is_empty());
        assert_eq!(table.overdue(deadline + 1).unwrap().len(), 1);
    }

    #[test]
    fn latest_pending_prefers_newest_and_skips_resolved() {
        let (_dir, store) = temp_store();
        seed_session(&store, "s1", "T1");
        let table = store.approvals();
        table.insert(&new_approval("aaaa1111-old", "s1", 1_000)).unwrap();
        table.insert(&new_approval("bbbb2222-new", "s1", 2_000)).unwrap();

        let latest = table.latest_pending_for_thread("T1").unwrap().unwrap();
        assert_eq!(latest.request_id, "bbbb2222-new");

        table
            .claim("bbbb2222-new", ApprovalStatus::Denied, Resolver::Reply, 3_000)
            .unwrap();
        let latest = table.latest_pending_for_thread("T1").unwrap().unwrap();
        assert_eq!(latest.request_id, "aaaa1111-old");

        let by_prefix = table.pending_by_prefix("T1", "aaaa1111").unwrap();
        assert_eq!(by_prefix.len(), 1);
        assert!(table.pending_by_prefix("T2", "aaaa1111").unwrap().is_empty());
    }

    #[test]
    fn counts_group_by_status() {
        let (_dir, store) = temp_store();
        seed_session(&store, "s1", "T1");
        insert_now(&store, "r1", "s1");
        insert_now(&store, "r2", "s1");
        store
            .approvals()
            .claim("r2", ApprovalStatus::Expired, Resolver::Sweep, 1)
            .unwrap();

        let counts = store.approvals().counts().unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.expired, 1);
        assert_eq!(counts.approved, 0);
    }
}
