//! Hook Client - the short-lived side of an approval.
//!
//! Runs inside the process Claude Code spawns for each hook. It shares no
//! memory with the daemon: it records the request in the store, posts the
//! prompt, then polls the handoff artifact until a decision lands or the
//! deadline passes. Every failure path ends in a denial.

use std::time::Duration;

use claude_mattermost_protocol::{ApprovalStatus, Decision, Resolver};
use tracing::{info, warn};

use crate::broker::{retire, ApprovalRequest, Broker, HandoffHandle};
use crate::coordinator::Coordinator;
use crate::error::{CoreError, CoreResult};
use crate::handoff::HandoffChannel;
use crate::inbox::{Inbox, InboxMessage};
use crate::store::{now_ms, Store};

#[derive(Debug, Clone, Copy)]
pub struct WaitSettings {
    /// Delay between artifact checks
    pub poll_interval: Duration,
    /// How long to wait for a competing resolver's artifact after losing
    /// the timeout claim
    pub grace: Duration,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            grace: Duration::from_secs(1),
        }
    }
}

/// Ask for approval and block until decided. Timeouts come back as a denial.
pub async fn request_approval(
    broker: &Broker<'_>,
    store: &Store,
    handoff: &HandoffChannel,
    request: ApprovalRequest,
    wait: WaitSettings,
) -> CoreResult<Decision> {
    let handle = broker.request(request, None).await?;
    match wait_for_decision(store, handoff, &handle, wait).await {
        Err(CoreError::Timeout(request_id)) => {
            warn!(
                component = "hook",
                event = "approval.timed_out",
                request_id = %request_id,
                "No decision before deadline, denying"
            );
            Ok(Decision::Denied)
        }
        other => other,
    }
}

/// Poll the artifact of `handle` until it appears or the deadline passes.
///
/// On timeout the hook tries to retire the request itself. If another
/// resolver beat it, that resolver's decision is returned instead.
pub async fn wait_for_decision(
    store: &Store,
    handoff: &HandoffChannel,
    handle: &HandoffHandle,
    wait: WaitSettings,
) -> CoreResult<Decision> {
    loop {
        if let Some(decision) = handoff.try_take(&handle.path)? {
            info!(
                component = "hook",
                event = "approval.received",
                request_id = %handle.request_id,
                decision = decision.as_str(),
                "Decision received"
            );
            return Ok(decision);
        }
        let remaining = handle.deadline - now_ms();
        if remaining < 0 {
            break;
        }
        let remaining = Duration::from_millis(remaining as u64 + 1);
        tokio::time::sleep(wait.poll_interval.min(remaining)).await;
    }

    match retire(
        store,
        handoff,
        &handle.request_id,
        ApprovalStatus::Expired,
        Resolver::HookTimeout,
    ) {
        Ok(()) => {
            handoff.remove(&handle.request_id)?;
            Err(CoreError::Timeout(handle.request_id.clone()))
        }
        Err(CoreError::ConflictingResolution { status, .. }) => {
            let decision = settle_lost_claim(handoff, handle, wait).await?;
            Ok(decision.unwrap_or_else(|| status.decision()))
        }
        Err(e) => Err(e),
    }
}

/// Someone else resolved the request; give their artifact a moment to land.
async fn settle_lost_claim(
    handoff: &HandoffChannel,
    handle: &HandoffHandle,
    wait: WaitSettings,
) -> CoreResult<Option<Decision>> {
    let started = tokio::time::Instant::now();
    loop {
        if let Some(decision) = handoff.try_take(&handle.path)? {
            return Ok(Some(decision));
        }
        if started.elapsed() >= wait.grace {
            return Ok(None);
        }
        tokio::time::sleep(wait.poll_interval.min(wait.grace)).await;
    }
}

/// Fire-and-forget notification into the session's thread.
pub async fn send_notification(
    coordinator: &Coordinator<'_>,
    session_id: &str,
    message: &str,
) -> CoreResult<()> {
    coordinator.notify(session_id, message).await
}

/// Fire-and-forget assistant reply into the session's thread.
pub async fn send_response(
    coordinator: &Coordinator<'_>,
    session_id: &str,
    message: &str,
) -> CoreResult<()> {
    coordinator.respond(session_id, message).await
}

/// Messages forwarded from the thread since the last call.
pub fn pull_messages(inbox: &Inbox, session_id: &str) -> CoreResult<Vec<InboxMessage>> {
    Ok(inbox.drain(session_id)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::test_support::seed_session;
    use crate::broker::{sweep_expired, ApprovalPolicy};
    use crate::daemon::{Daemon, DaemonSettings};
    use crate::store::test_support::temp_store;
    use claude_mattermost_relay::{Backoff, FakeRelay};

    fn fast_wait() -> WaitSettings {
        WaitSettings {
            poll_interval: Duration::from_millis(5),
            grace: Duration::from_millis(30),
        }
    }

    fn policy(timeout: Duration) -> ApprovalPolicy {
        ApprovalPolicy {
            timeout,
            backoff: Backoff {
                attempts: 3,
                base_delay: Duration::from_millis(1),
            },
            allowed_users: Vec::new(),
        }
    }

    fn npm_install() -> ApprovalRequest {
        ApprovalRequest {
            session_id: "proj-A".into(),
            tool_name: "Bash".into(),
            command: "npm install axios".into(),
            description: "Install axios".into(),
        }
    }

    #[tokio::test]
    async fn approve_reply_unblocks_hook() {
        let (dir, store) = temp_store();
        let handoff = HandoffChannel::new(dir.path().join("responses"));
        let inbox = Inbox::new(dir.path().join("inbox"));
        let relay = FakeRelay::default();
        let coordinator = Coordinator::new(&store, &relay, &handoff, Backoff::default());
        let session = coordinator.start("proj-A", "/work/proj-A", false).await.unwrap();

        let hook_broker = Broker::new(&store, &relay, &handoff, policy(Duration::from_secs(5)));
        let daemon_broker = Broker::new(&store, &relay, &handoff, policy(Duration::from_secs(5)));
        let mut daemon = Daemon::new(
            &store,
            &relay,
            &handoff,
            &inbox,
            daemon_broker,
            DaemonSettings::default(),
        );
        daemon.recover().unwrap();
        let base = daemon.cursor().0;

        let hook = request_approval(&hook_broker, &store, &handoff, npm_install(), fast_wait());
        let human = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            relay.push_reply(&session.thread_id, "alice", "approve", base + 1);
            daemon.run_once().await.unwrap()
        };
        let (decision, iteration) = tokio::join!(hook, human);

        assert_eq!(decision.unwrap(), Decision::Approved);
        assert_eq!(iteration.resolved, 1);
        let prompt = relay
            .posts_in(&session.thread_id)
            .into_iter()
            .find(|p| p.contains("Tool Request"))
            .unwrap();
        assert!(prompt.contains("npm install axios"));
        let approvals = store.approvals().pending_for_session("proj-A").unwrap();
        assert!(approvals.is_empty());
        assert_eq!(std::fs::read_dir(handoff.dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn silence_times_out_as_expired_denial() {
        let (dir, store) = temp_store();
        let handoff = HandoffChannel::new(dir.path().join("responses"));
        let relay = FakeRelay::default();
        seed_session(&store, "proj-A", "T1");
        let broker = Broker::new(&store, &relay, &handoff, policy(Duration::from_millis(40)));

        let handle = broker.request(npm_install(), None).await.unwrap();
        let result = wait_for_decision(&store, &handoff, &handle, fast_wait()).await;
        assert!(matches!(result, Err(CoreError::Timeout(_))));
        let row = store.approvals().get(&handle.request_id).unwrap();
        assert_eq!(row.status, ApprovalStatus::Expired);
        assert!(!handle.path.exists());

        let decision = request_approval(&broker, &store, &handoff, npm_install(), fast_wait())
            .await
            .unwrap();
        assert_eq!(decision, Decision::Denied);
    }

    #[tokio::test]
    async fn unreachable_backend_denies_without_waiting() {
        let (dir, store) = temp_store();
        let handoff = HandoffChannel::new(dir.path().join("responses"));
        let relay = FakeRelay::default();
        seed_session(&store, "proj-A", "T1");
        relay.set_unavailable(true);
        let broker = Broker::new(&store, &relay, &handoff, policy(Duration::from_secs(300)));

        let started = std::time::Instant::now();
        let decision = request_approval(&broker, &store, &handoff, npm_install(), fast_wait())
            .await
            .unwrap();
        assert_eq!(decision, Decision::Denied);
        assert!(started.elapsed() < Duration::from_secs(5));

        let pending = store.approvals().all_pending().unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn sweep_expiry_reaches_waiting_hook() {
        let (dir, store) = temp_store();
        let handoff = HandoffChannel::new(dir.path().join("responses"));
        let relay = FakeRelay::default();
        seed_session(&store, "proj-A", "T1");
        let broker = Broker::new(&store, &relay, &handoff, policy(Duration::ZERO));

        let handle = broker.request(npm_install(), None).await.unwrap();
        assert_eq!(sweep_expired(&store, &handoff, handle.deadline + 1).unwrap(), 1);

        let decision = wait_for_decision(&store, &handoff, &handle, fast_wait())
            .await
            .unwrap();
        assert_eq!(decision, Decision::Denied);
        assert!(!handle.path.exists());
    }

    #[tokio::test]
    async fn losing_timeout_claim_uses_winner_status_when_artifact_missing() {
        let (dir, store) = temp_store();
        let handoff = HandoffChannel::new(dir.path().join("responses"));
        let relay = FakeRelay::default();
        seed_session(&store, "proj-A", "T1");
        let broker = Broker::new(&store, &relay, &handoff, policy(Duration::ZERO));

        let handle = broker.request(npm_install(), None).await.unwrap();
        store
            .approvals()
            .claim(&handle.request_id, ApprovalStatus::Approved, Resolver::Reply, now_ms())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;

        let decision = wait_for_decision(&store, &handoff, &handle, fast_wait())
            .await
            .unwrap();
        assert_eq!(decision, Decision::Approved);
        assert_eq!(
            store.approvals().get(&handle.request_id).unwrap().status,
            ApprovalStatus::Approved
        );
    }

    #[tokio::test]
    async fn notifications_need_an_active_session() {
        let (dir, store) = temp_store();
        let handoff = HandoffChannel::new(dir.path().join("responses"));
        let relay = FakeRelay::default();
        let coordinator = Coordinator::new(&store, &relay, &handoff, Backoff::default());
        let session = coordinator.start("s1", "/work/proj-A", false).await.unwrap();

        send_notification(&coordinator, "s1", "Waiting for input").await.unwrap();
        send_response(&coordinator, "s1", "All done").await.unwrap();
        assert_eq!(relay.posts_in(&session.thread_id).len(), 3);

        let err = send_notification(&coordinator, "nope", "hi").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[test]
    fn pull_messages_drains_inbox() {
        let dir = tempfile::TempDir::new().unwrap();
        let inbox = Inbox::new(dir.path());
        inbox
            .deliver(
                "s1",
                &InboxMessage {
                    message_id: "m1".into(),
                    author: "alice".into(),
                    text: "use yarn".into(),
                    timestamp: 1,
                },
            )
            .unwrap();
        assert_eq!(pull_messages(&inbox, "s1").unwrap().len(), 1);
        assert!(pull_messages(&inbox, "s1").unwrap().is_empty());
    }
}
