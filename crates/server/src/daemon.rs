//! Daemon Loop.
//!
//! One iteration: poll the relay since the cursor, dispatch each message not
//! yet processed, run whichever sweeps are due, persist the cursor. Iterations
//! never overlap. A message is marked processed only after its dispatch
//! succeeds, so a failed one is retried and a finished one is never replayed.
//! All state lives in the store, so `recover` is the whole restart story.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use claude_mattermost_protocol::{Cursor, PostTarget, RemoteMessage};
use claude_mattermost_relay::RemoteRelay;
use tracing::{debug, error, info, warn};

use crate::broker::{expire_for_session, sweep_expired, Broker, ReplyOutcome};
use crate::error::{CoreError, CoreResult};
use crate::handoff::HandoffChannel;
use crate::inbox::{Inbox, InboxMessage};
use crate::registry::SessionFilter;
use crate::store::{now_ms, Store};

#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub poll_interval: Duration,
    pub approval_sweep_interval: Duration,
    pub session_sweep_interval: Duration,
    /// Idle time after which an active session is timed out
    pub session_timeout: Duration,
    /// Sleep after a failed iteration
    pub error_backoff: Duration,
    /// Age after which an unconsumed handoff artifact is deleted
    pub stale_artifact_age: Duration,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            approval_sweep_interval: Duration::from_secs(5),
            session_sweep_interval: Duration::from_secs(3600),
            session_timeout: Duration::from_secs(24 * 3600),
            error_backoff: Duration::from_secs(5),
            stale_artifact_age: Duration::from_secs(600),
        }
    }
}

/// What `recover` found in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovery {
    pub cursor: Cursor,
    pub active_sessions: usize,
    pub pending_approvals: usize,
    /// Pending requests whose deadline passed while the daemon was down
    pub expired_on_start: usize,
}

/// Counters for one iteration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Iteration {
    pub messages: usize,
    pub resolved: usize,
    pub forwarded: usize,
    pub expired: usize,
    pub timed_out_sessions: usize,
}

pub struct Daemon<'a> {
    store: &'a Store,
    relay: &'a dyn RemoteRelay,
    handoff: &'a HandoffChannel,
    inbox: &'a Inbox,
    broker: Broker<'a>,
    settings: DaemonSettings,
    cursor: Cursor,
    last_approval_sweep: Option<Instant>,
    last_session_sweep: Option<Instant>,
}

impl<'a> Daemon<'a> {
    pub fn new(
        store: &'a Store,
        relay: &'a dyn RemoteRelay,
        handoff: &'a HandoffChannel,
        inbox: &'a Inbox,
        broker: Broker<'a>,
        settings: DaemonSettings,
    ) -> Self {
        Self {
            store,
            relay,
            handoff,
            inbox,
            broker,
            settings,
            cursor: Cursor::default(),
            last_approval_sweep: None,
            last_session_sweep: None,
        }
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Reload persisted state and settle anything that expired while the
    /// daemon was down. Unreadable records abort startup.
    pub fn recover(&mut self) -> CoreResult<Recovery> {
        self.cursor = match self.store.load_cursor()? {
            Some(cursor) => cursor,
            None => {
                // First start: do not replay the channel's history.
                let cursor = Cursor(now_ms());
                self.store.save_cursor(cursor)?;
                cursor
            }
        };

        let active_sessions = self.store.sessions().list(&SessionFilter::active())?.len();
        let pending_approvals = self.store.approvals().all_pending()?.len();
        let expired_on_start = sweep_expired(self.store, self.handoff, now_ms())?;
        self.last_approval_sweep = Some(Instant::now());

        info!(
            component = "daemon",
            event = "daemon.recovered",
            cursor = self.cursor.0,
            active_sessions = active_sessions,
            pending_approvals = pending_approvals,
            expired_on_start = expired_on_start,
            "Recovered persisted state"
        );

        Ok(Recovery {
            cursor: self.cursor,
            active_sessions,
            pending_approvals,
            expired_on_start,
        })
    }

    /// One poll-dispatch-sweep cycle. Sweeps run even when the poll fails;
    /// the poll error is returned afterwards.
    pub async fn run_once(&mut self) -> CoreResult<Iteration> {
        let mut iteration = Iteration::default();

        let polled = self.poll(&mut iteration).await;
        self.sweep(&mut iteration).await?;
        self.store.save_cursor(self.cursor)?;
        self.store.prune_processed(self.cursor)?;
        polled?;

        if iteration != Iteration::default() {
            debug!(
                component = "daemon",
                event = "daemon.iteration",
                messages = iteration.messages,
                resolved = iteration.resolved,
                forwarded = iteration.forwarded,
                expired = iteration.expired,
                timed_out_sessions = iteration.timed_out_sessions,
                cursor = self.cursor.0,
                "Iteration complete"
            );
        }
        Ok(iteration)
    }

    async fn poll(&mut self, iteration: &mut Iteration) -> CoreResult<()> {
        let (messages, next) = self.relay.poll_since(self.cursor).await?;

        for message in &messages {
            // Polls repeat the cursor millisecond.
            if self.store.is_processed(&message.message_id)? {
                continue;
            }
            iteration.messages += 1;
            if let Err(e) = self.dispatch(message, iteration).await {
                // Leave the cursor before this message so it is seen again.
                warn!(
                    component = "daemon",
                    event = "daemon.dispatch_failed",
                    message_id = %message.message_id,
                    error = %e,
                    "Dispatch failed, will retry message"
                );
                return Err(e);
            }
            self.store
                .mark_processed(&message.message_id, message.timestamp)?;
            self.cursor = self.cursor.advance(message.timestamp);
        }
        self.cursor = self.cursor.advance(next.0);
        Ok(())
    }

    async fn dispatch(&self, message: &RemoteMessage, iteration: &mut Iteration) -> CoreResult<()> {
        match self.broker.on_remote_reply(message).await? {
            ReplyOutcome::Resolved { .. } => iteration.resolved += 1,
            ReplyOutcome::Conversation { session_id }
            | ReplyOutcome::NoPendingApproval { session_id } => {
                self.inbox.deliver(
                    &session_id,
                    &InboxMessage {
                        message_id: message.message_id.clone(),
                        author: message.author.clone(),
                        text: message.text.clone(),
                        timestamp: message.timestamp,
                    },
                )?;
                iteration.forwarded += 1;
            }
            ReplyOutcome::NotOurThread
            | ReplyOutcome::Unauthorized { .. }
            | ReplyOutcome::Stale { .. }
            | ReplyOutcome::AlreadyResolved { .. } => {}
        }
        Ok(())
    }

    async fn sweep(&mut self, iteration: &mut Iteration) -> CoreResult<()> {
        if due(self.last_approval_sweep, self.settings.approval_sweep_interval) {
            iteration.expired = sweep_expired(self.store, self.handoff, now_ms())?;
            if let Err(e) = self.handoff.remove_stale(self.settings.stale_artifact_age) {
                warn!(
                    component = "daemon",
                    event = "daemon.stale_cleanup_failed",
                    error = %e,
                    "Could not clean handoff directory"
                );
            }
            self.last_approval_sweep = Some(Instant::now());
        }

        if due(self.last_session_sweep, self.settings.session_sweep_interval) {
            iteration.timed_out_sessions = self.sweep_sessions().await?;
            self.last_session_sweep = Some(Instant::now());
        }
        Ok(())
    }

    async fn sweep_sessions(&self) -> CoreResult<usize> {
        let timeout_ms = i64::try_from(self.settings.session_timeout.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms().saturating_sub(timeout_ms);
        let ids = self.store.sessions().time_out_idle(cutoff)?;

        for id in &ids {
            expire_for_session(self.store, self.handoff, id)?;
            let session = self.store.sessions().get(id)?;
            let notice = format!(
                "⏱️ **Session timed out** after {}h of inactivity",
                self.settings.session_timeout.as_secs() / 3600
            );
            let target = PostTarget::thread(&session.channel_id, &session.thread_id);
            if let Err(e) = self.relay.post_message(&target, &notice).await {
                debug!(
                    component = "daemon",
                    event = "session.timeout_notice_failed",
                    session_id = %id,
                    error = %e,
                    "Could not post timeout notice"
                );
            }
        }
        Ok(ids.len())
    }

    /// Loop until `shutdown` resolves. The cursor is persisted on the way out.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> CoreResult<()> {
        tokio::pin!(shutdown);
        info!(
            component = "daemon",
            event = "daemon.started",
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "Daemon loop started"
        );

        loop {
            let delay = match self.run_once().await {
                Ok(_) => self.settings.poll_interval,
                Err(CoreError::Corrupt { table, detail }) => {
                    error!(
                        component = "daemon",
                        event = "daemon.corrupt_state",
                        table = table,
                        detail = %detail,
                        "Unreadable state, stopping"
                    );
                    return Err(CoreError::Corrupt { table, detail });
                }
                Err(e) => {
                    warn!(
                        component = "daemon",
                        event = "daemon.poll_failed",
                        error = %e,
                        backoff_ms = self.settings.error_backoff.as_millis() as u64,
                        "Iteration failed, backing off"
                    );
                    self.settings.error_backoff
                }
            };

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.store.save_cursor(self.cursor)?;
        info!(
            component = "daemon",
            event = "daemon.stopped",
            cursor = self.cursor.0,
            "Daemon loop stopped"
        );
        Ok(())
    }
}

fn due(last: Option<Instant>, interval: Duration) -> bool {
    last.map_or(true, |at| at.elapsed() >= interval)
}

/// Single-instance guard backed by `daemon.pid`. Removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claim the PID file, refusing if another live daemon holds it.
    pub fn acquire(path: &Path) -> CoreResult<Self> {
        if let Some(pid) = read_pid(path) {
            if pid != std::process::id() && process_alive(pid) {
                return Err(CoreError::Config(format!(
                    "daemon already running (pid {})",
                    pid
                )));
            }
            warn!(
                component = "daemon",
                event = "daemon.stale_pid",
                pid = pid,
                "Replacing stale PID file"
            );
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, std::process::id().to_string())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse()
        .ok()
        .filter(|pid| *pid > 0)
}

pub fn process_alive(pid: u32) -> bool {
    // kill -0 checks if process exists without sending a signal
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::test_support::{new_approval, seed_session};
    use crate::broker::{ApprovalPolicy, ApprovalRequest};
    use crate::store::test_support::temp_store;
    use claude_mattermost_protocol::{ApprovalStatus, Decision, SessionStatus};
    use claude_mattermost_relay::{Backoff, FakeRelay};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        store: Store,
        relay: FakeRelay,
        handoff: HandoffChannel,
        inbox: Inbox,
    }

    fn fixture() -> Fixture {
        let (dir, store) = temp_store();
        let handoff = HandoffChannel::new(dir.path().join("responses"));
        let inbox = Inbox::new(dir.path().join("inbox"));
        Fixture {
            dir,
            store,
            relay: FakeRelay::default(),
            handoff,
            inbox,
        }
    }

    fn policy() -> ApprovalPolicy {
        ApprovalPolicy {
            backoff: Backoff {
                attempts: 2,
                base_delay: Duration::from_millis(1),
            },
            ..ApprovalPolicy::default()
        }
    }

    fn daemon(f: &Fixture) -> Daemon<'_> {
        let broker = Broker::new(&f.store, &f.relay, &f.handoff, policy());
        Daemon::new(
            &f.store,
            &f.relay,
            &f.handoff,
            &f.inbox,
            broker,
            DaemonSettings::default(),
        )
    }

    #[test]
    fn first_recovery_starts_cursor_at_now() {
        let f = fixture();
        let before = now_ms();
        let mut daemon = daemon(&f);
        let recovery = daemon.recover().unwrap();
        assert!(recovery.cursor.0 >= before);
        assert_eq!(f.store.load_cursor().unwrap(), Some(recovery.cursor));
    }

    #[test]
    fn recovery_expires_requests_that_lapsed_while_down() {
        let f = fixture();
        seed_session(&f.store, "s1", "T1");
        f.store
            .approvals()
            .insert(&new_approval("old", "s1", 1_000))
            .unwrap();
        crate::approvals::test_support::insert_now(&f.store, "fresh", "s1");
        f.store.save_cursor(Cursor(500)).unwrap();

        let mut daemon = daemon(&f);
        let recovery = daemon.recover().unwrap();
        assert_eq!(recovery.cursor, Cursor(500));
        assert_eq!(recovery.active_sessions, 1);
        assert_eq!(recovery.pending_approvals, 2);
        assert_eq!(recovery.expired_on_start, 1);
        assert_eq!(
            f.handoff.try_take(&f.handoff.path_for("old")).unwrap(),
            Some(Decision::Denied)
        );
    }

    #[test]
    fn corrupt_rows_abort_recovery() {
        let f = fixture();
        seed_session(&f.store, "s1", "T1");
        let conn = rusqlite::Connection::open(f.dir.path().join("sessions.db")).unwrap();
        conn.execute("UPDATE sessions SET status = 'exploded'", [])
            .unwrap();

        let mut daemon = daemon(&f);
        let err = daemon.recover().unwrap_err();
        assert!(matches!(err, CoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn replies_resolve_and_conversation_is_forwarded() {
        let f = fixture();
        seed_session(&f.store, "s1", "T1");
        let broker = Broker::new(&f.store, &f.relay, &f.handoff, policy());
        let handle = broker
            .request(
                ApprovalRequest {
                    session_id: "s1".into(),
                    tool_name: "Bash".into(),
                    command: "npm install axios".into(),
                    description: String::new(),
                },
                None,
            )
            .await
            .unwrap();

        let mut daemon = daemon(&f);
        daemon.recover().unwrap();
        let base = daemon.cursor().0;
        f.relay.push_reply("T1", "alice", "use yarn instead", base + 1);
        f.relay.push_reply("T1", "alice", "approve", base + 2);
        f.relay.push_reply("T9", "alice", "approve", base + 3);

        let iteration = daemon.run_once().await.unwrap();
        assert_eq!(iteration.messages, 3);
        assert_eq!(iteration.resolved, 1);
        assert_eq!(iteration.forwarded, 1);
        assert_eq!(daemon.cursor(), Cursor(base + 3));
        assert_eq!(f.store.load_cursor().unwrap(), Some(Cursor(base + 3)));
        assert_eq!(
            f.store.approvals().get(&handle.request_id).unwrap().status,
            ApprovalStatus::Approved
        );
        let inbox = f.inbox.drain("s1").unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].text, "use yarn instead");

        // Nothing new: the same replies are not applied twice.
        let again = daemon.run_once().await.unwrap();
        assert_eq!(again.messages, 0);
    }

    #[tokio::test]
    async fn one_reply_resolves_one_request_when_handoff_is_unwritable() {
        let f = fixture();
        seed_session(&f.store, "s1", "T1");
        f.store
            .approvals()
            .insert(&new_approval("old", "s1", now_ms() - 10))
            .unwrap();
        f.store
            .approvals()
            .insert(&new_approval("new", "s1", now_ms()))
            .unwrap();
        let responses = f.dir.path().join("responses");
        std::fs::write(&responses, "not a directory").unwrap();

        let mut daemon = daemon(&f);
        daemon.recover().unwrap();
        let base = daemon.cursor().0;
        f.relay.push_reply("T1", "alice", "approve", base + 1);

        let first = daemon.run_once().await.unwrap();
        assert_eq!(first.resolved, 1);
        std::fs::remove_file(&responses).unwrap();
        let second = daemon.run_once().await.unwrap();
        assert_eq!(second.messages, 0);

        assert_eq!(
            f.store.approvals().get("new").unwrap().status,
            ApprovalStatus::Approved
        );
        assert_eq!(
            f.store.approvals().get("old").unwrap().status,
            ApprovalStatus::Pending
        );
    }

    #[tokio::test]
    async fn same_millisecond_message_survives_failed_dispatch() {
        let f = fixture();
        seed_session(&f.store, "s1", "T1");
        crate::approvals::test_support::insert_now(&f.store, "req-1", "s1");
        let inbox_dir = f.dir.path().join("inbox");
        std::fs::write(&inbox_dir, "not a directory").unwrap();

        let mut daemon = daemon(&f);
        daemon.recover().unwrap();
        let at = daemon.cursor().0 + 1;
        f.relay.push_reply("T1", "alice", "approve", at);
        f.relay.push_reply("T1", "alice", "use yarn instead", at);

        assert!(daemon.run_once().await.is_err());
        assert_eq!(daemon.cursor(), Cursor(at));
        assert_eq!(
            f.store.approvals().get("req-1").unwrap().status,
            ApprovalStatus::Approved
        );

        std::fs::remove_file(&inbox_dir).unwrap();
        let retry = daemon.run_once().await.unwrap();
        assert_eq!(retry.messages, 1);
        assert_eq!(retry.resolved, 0);
        assert_eq!(retry.forwarded, 1);
        let texts: Vec<_> = f
            .inbox
            .drain("s1")
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["use yarn instead".to_string()]);
    }

    #[tokio::test]
    async fn late_post_in_the_cursor_millisecond_is_still_seen() {
        let f = fixture();
        seed_session(&f.store, "s1", "T1");
        let mut daemon = daemon(&f);
        daemon.recover().unwrap();
        let at = daemon.cursor().0 + 1;
        f.relay.push_reply("T1", "alice", "first", at);
        daemon.run_once().await.unwrap();

        f.relay.push_reply("T1", "alice", "second", at);
        let iteration = daemon.run_once().await.unwrap();
        assert_eq!(iteration.messages, 1);
        let texts: Vec<_> = f
            .inbox
            .drain("s1")
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn restart_resumes_from_persisted_cursor() {
        let f = fixture();
        seed_session(&f.store, "s1", "T1");
        let mut first = daemon(&f);
        first.recover().unwrap();
        let base = first.cursor().0;
        f.relay.push_reply("T1", "alice", "hello", base + 1);
        first.run_once().await.unwrap();
        drop(first);

        f.relay.push_reply("T1", "alice", "second", base + 2);
        let mut second = daemon(&f);
        second.recover().unwrap();
        let iteration = second.run_once().await.unwrap();
        assert_eq!(iteration.messages, 1);
        let texts: Vec<_> = f
            .inbox
            .drain("s1")
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["hello".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn poll_failure_still_sweeps_and_reports_error() {
        let f = fixture();
        seed_session(&f.store, "s1", "T1");
        f.store
            .approvals()
            .insert(&new_approval("old", "s1", 1_000))
            .unwrap();
        f.relay.set_unavailable(true);

        let mut daemon = daemon(&f);
        daemon.cursor = Cursor(1);
        let err = daemon.run_once().await.unwrap_err();
        assert!(matches!(err, CoreError::RelayUnavailable(_)));
        assert_eq!(
            f.store.approvals().get("old").unwrap().status,
            ApprovalStatus::Expired
        );
    }

    #[tokio::test]
    async fn idle_sessions_time_out_with_notice() {
        let f = fixture();
        seed_session(&f.store, "s1", "T1");
        crate::approvals::test_support::insert_now(&f.store, "req-1", "s1");
        f.store.sessions().set_last_active("s1", 1_000).unwrap();

        let mut daemon = daemon(&f);
        daemon.recover().unwrap();
        let iteration = daemon.run_once().await.unwrap();
        assert_eq!(iteration.timed_out_sessions, 1);
        assert_eq!(
            f.store.sessions().get("s1").unwrap().status,
            SessionStatus::TimedOut
        );
        assert_eq!(
            f.store.approvals().get("req-1").unwrap().status,
            ApprovalStatus::Expired
        );
        assert!(f
            .relay
            .posts_in("T1")
            .iter()
            .any(|p| p.contains("Session timed out")));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_and_persists_cursor() {
        let f = fixture();
        let mut daemon = daemon(&f);
        daemon.recover().unwrap();
        daemon.run(async {}).await.unwrap();
        assert_eq!(f.store.load_cursor().unwrap(), Some(daemon.cursor()));
    }

    #[test]
    fn pid_file_refuses_live_owner_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.pid");

        // pid 1 is always alive
        std::fs::write(&path, "1").unwrap();
        if process_alive(1) {
            assert!(PidFile::acquire(&path).is_err());
        }

        std::fs::write(&path, "999999999").unwrap();
        let guard = PidFile::acquire(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));
        drop(guard);
        assert!(!path.exists());
    }
}
