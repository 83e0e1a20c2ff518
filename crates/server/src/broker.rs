//! Approval Broker.
//!
//! Creates approval requests, posts the prompt to the session's thread, and
//! turns thread replies and deadlines into decisions. Every resolution goes
//! through [`retire`]: claim the row first, then publish the artifact, so a
//! request is answered exactly once no matter how many resolvers race.

use std::path::PathBuf;
use std::time::Duration;

use claude_mattermost_protocol::{
    new_id, short_id, ApprovalStatus, PendingApproval, PostTarget, RemoteMessage, Resolver,
    SessionStatus,
};
use claude_mattermost_relay::{with_backoff, Backoff, RemoteRelay};
use tracing::{debug, info, warn};

use crate::approvals::NewApproval;
use crate::error::{CoreError, CoreResult};
use crate::handoff::HandoffChannel;
use crate::reply::{classify, request_ref, ReplyIntent};
use crate::store::{now_ms, Store};

/// Approval knobs from configuration
#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    pub timeout: Duration,
    pub backoff: Backoff,
    /// Usernames allowed to decide. Empty means anyone in the channel.
    pub allowed_users: Vec<String>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            backoff: Backoff::default(),
            allowed_users: Vec::new(),
        }
    }
}

impl ApprovalPolicy {
    fn may_decide(&self, author: &str) -> bool {
        self.allowed_users.is_empty()
            || self
                .allowed_users
                .iter()
                .any(|u| u.trim_start_matches('@').eq_ignore_ascii_case(author))
    }
}

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub session_id: String,
    pub tool_name: String,
    pub command: String,
    pub description: String,
}

/// What the hook blocks on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffHandle {
    pub request_id: String,
    pub path: PathBuf,
    /// Unix milliseconds
    pub deadline: i64,
}

/// Result of feeding one thread message to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// No active session owns the thread.
    NotOurThread,
    /// A decision-like reply, but nothing is pending in the thread.
    NoPendingApproval { session_id: String },
    /// Ordinary conversation for the session.
    Conversation { session_id: String },
    /// Decision from an author outside `allowed_users`.
    Unauthorized { session_id: String },
    /// `#ref` names no pending request in this thread.
    Stale { session_id: String },
    Resolved {
        request_id: String,
        status: ApprovalStatus,
    },
    /// Another resolver got there first.
    AlreadyResolved { request_id: String },
}

/// Claim `request_id` as `status` and, if this caller won, deliver the
/// matching decision to the handoff. Losing the claim surfaces as
/// `ConflictingResolution`.
///
/// Once the claim is won the request is decided: a failed delivery is only
/// logged. The waiting hook reads the winning status when its own timeout
/// claim conflicts.
pub fn retire(
    store: &Store,
    handoff: &HandoffChannel,
    request_id: &str,
    status: ApprovalStatus,
    resolver: Resolver,
) -> CoreResult<()> {
    store
        .approvals()
        .claim(request_id, status, resolver, now_ms())?;
    publish(handoff, request_id, status);
    Ok(())
}

/// `retire` for a thread reply; the claim records `message_id`.
fn retire_for_message(
    store: &Store,
    handoff: &HandoffChannel,
    request_id: &str,
    status: ApprovalStatus,
    message_id: &str,
) -> CoreResult<()> {
    store
        .approvals()
        .claim_for_message(request_id, status, message_id, now_ms())?;
    publish(handoff, request_id, status);
    Ok(())
}

fn publish(handoff: &HandoffChannel, request_id: &str, status: ApprovalStatus) {
    if let Err(e) = handoff.deliver(request_id, status.decision()) {
        warn!(
            component = "broker",
            event = "approval.handoff_failed",
            request_id = %request_id,
            status = %status,
            error = %e,
            "Decision recorded but artifact not written"
        );
    }
}

/// Expire every pending request past its deadline. Returns how many this
/// caller expired.
pub fn sweep_expired(store: &Store, handoff: &HandoffChannel, now: i64) -> CoreResult<usize> {
    let overdue = store.approvals().overdue(now)?;
    let mut expired = 0;
    for approval in overdue {
        match retire(
            store,
            handoff,
            &approval.request_id,
            ApprovalStatus::Expired,
            Resolver::Sweep,
        ) {
            Ok(()) => {
                expired += 1;
                info!(
                    component = "broker",
                    event = "approval.expired",
                    request_id = %approval.request_id,
                    session_id = %approval.session_id,
                    deadline = approval.deadline,
                    "Approval expired"
                );
            }
            Err(e) if e.is_conflict() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(expired)
}

/// Expire the pending requests of a session that is ending.
pub fn expire_for_session(
    store: &Store,
    handoff: &HandoffChannel,
    session_id: &str,
) -> CoreResult<usize> {
    let pending = store.approvals().pending_for_session(session_id)?;
    let mut expired = 0;
    for approval in pending {
        match retire(
            store,
            handoff,
            &approval.request_id,
            ApprovalStatus::Expired,
            Resolver::SessionEnd,
        ) {
            Ok(()) => expired += 1,
            Err(e) if e.is_conflict() => {}
            Err(e) => return Err(e),
        }
    }
    if expired > 0 {
        info!(
            component = "broker",
            event = "approval.expired_with_session",
            session_id = %session_id,
            count = expired,
            "Expired approvals of ending session"
        );
    }
    Ok(expired)
}

pub struct Broker<'a> {
    store: &'a Store,
    relay: &'a dyn RemoteRelay,
    handoff: &'a HandoffChannel,
    policy: ApprovalPolicy,
}

impl<'a> Broker<'a> {
    pub fn new(
        store: &'a Store,
        relay: &'a dyn RemoteRelay,
        handoff: &'a HandoffChannel,
        policy: ApprovalPolicy,
    ) -> Self {
        Self {
            store,
            relay,
            handoff,
            policy,
        }
    }

    /// Record a request and post its prompt.
    ///
    /// When the prompt cannot be delivered the request is denied on the
    /// spot and the returned handle already has its artifact.
    pub async fn request(
        &self,
        request: ApprovalRequest,
        timeout: Option<Duration>,
    ) -> CoreResult<HandoffHandle> {
        let session = self.store.sessions().get(&request.session_id)?;
        if session.status != SessionStatus::Active {
            return Err(CoreError::SessionNotActive {
                id: session.id,
                status: session.status,
            });
        }

        let timeout = timeout.unwrap_or(self.policy.timeout);
        let request_id = new_id();
        let created_at = now_ms();
        let deadline = created_at + i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX / 2);
        let path = self.handoff.path_for(&request_id);

        let approval = self.store.approvals().insert(&NewApproval {
            request_id: request_id.clone(),
            session_id: session.id.clone(),
            tool_name: request.tool_name,
            command: request.command,
            description: request.description,
            created_at,
            deadline,
            response_path: path.to_string_lossy().into_owned(),
        })?;
        self.store.sessions().touch(&session.id)?;

        info!(
            component = "broker",
            event = "approval.requested",
            request_id = %request_id,
            session_id = %session.id,
            tool_name = %approval.tool_name,
            timeout_secs = timeout.as_secs(),
            "Approval requested"
        );

        let target = PostTarget::thread(&session.channel_id, &session.thread_id);
        let text = format_prompt(&approval, timeout);
        let (target, text) = (&target, text.as_str());
        let posted = with_backoff(self.policy.backoff, "post_approval", move || {
            self.relay.post_message(target, text)
        })
        .await;

        if let Err(e) = posted {
            warn!(
                component = "broker",
                event = "approval.prompt_failed",
                request_id = %request_id,
                session_id = %session.id,
                error = %e,
                "Could not post approval prompt, denying"
            );
            match retire(
                self.store,
                self.handoff,
                &request_id,
                ApprovalStatus::Denied,
                Resolver::RelayFailure,
            ) {
                Ok(()) => {}
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }

        Ok(HandoffHandle {
            request_id,
            path,
            deadline,
        })
    }

    /// Feed one newly observed thread message.
    pub async fn on_remote_reply(&self, message: &RemoteMessage) -> CoreResult<ReplyOutcome> {
        let Some(session) = self.store.sessions().find_by_thread(&message.thread_id)? else {
            return Ok(ReplyOutcome::NotOurThread);
        };
        self.store.sessions().touch(&session.id)?;
        let session_id = session.id.clone();

        let status = match classify(&message.text) {
            ReplyIntent::Approve => ApprovalStatus::Approved,
            ReplyIntent::Deny => ApprovalStatus::Denied,
            ReplyIntent::Conversation => return Ok(ReplyOutcome::Conversation { session_id }),
        };

        if let Some(done) = self
            .store
            .approvals()
            .resolved_by_message(&message.message_id)?
        {
            debug!(
                component = "broker",
                event = "approval.reply_replayed",
                request_id = %done.request_id,
                message_id = %message.message_id,
                "Reply already resolved a request"
            );
            return Ok(ReplyOutcome::AlreadyResolved {
                request_id: done.request_id,
            });
        }

        if !self.policy.may_decide(&message.author) {
            warn!(
                component = "broker",
                event = "approval.unauthorized_reply",
                session_id = %session_id,
                author = %message.author,
                "Ignoring decision from user outside allowed list"
            );
            return Ok(ReplyOutcome::Unauthorized { session_id });
        }

        let target = match request_ref(&message.text) {
            Some(reference) => {
                let matches = self
                    .store
                    .approvals()
                    .pending_by_prefix(&message.thread_id, &reference)?;
                match matches.into_iter().next() {
                    Some(approval) => approval,
                    None => {
                        debug!(
                            component = "broker",
                            event = "approval.stale_reply",
                            session_id = %session_id,
                            reference = %reference,
                            "Reply names no pending request"
                        );
                        return Ok(ReplyOutcome::Stale { session_id });
                    }
                }
            }
            None => match self
                .store
                .approvals()
                .latest_pending_for_thread(&message.thread_id)?
            {
                Some(approval) => approval,
                None => return Ok(ReplyOutcome::NoPendingApproval { session_id }),
            },
        };

        match retire_for_message(
            self.store,
            self.handoff,
            &target.request_id,
            status,
            &message.message_id,
        ) {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                return Ok(ReplyOutcome::AlreadyResolved {
                    request_id: target.request_id,
                })
            }
            Err(e) => return Err(e),
        }

        info!(
            component = "broker",
            event = "approval.decided",
            request_id = %target.request_id,
            session_id = %session_id,
            status = %status,
            author = %message.author,
            "Approval decided from thread reply"
        );

        let ack = match status {
            ApprovalStatus::Approved => "✅ Approved - executing...",
            _ => "❌ Denied - skipping",
        };
        let thread = PostTarget::thread(&session.channel_id, &session.thread_id);
        if let Err(e) = self.relay.post_message(&thread, ack).await {
            warn!(
                component = "broker",
                event = "approval.ack_failed",
                request_id = %target.request_id,
                error = %e,
                "Could not acknowledge decision"
            );
        }

        Ok(ReplyOutcome::Resolved {
            request_id: target.request_id,
            status,
        })
    }
}

fn format_prompt(approval: &PendingApproval, timeout: Duration) -> String {
    let mut text = format!("🔧 **Tool Request: {}**\n\n", approval.tool_name);

    if approval.command.contains('`') || approval.command.contains('\n') {
        text.push_str(&format!("**Command:**\n```\n{}\n```\n\n", approval.command));
    } else {
        text.push_str(&format!("**Command:** `{}`\n\n", approval.command));
    }
    if !approval.description.is_empty() {
        text.push_str(&format!("**Description:** {}\n\n", approval.description));
    }

    text.push_str("Reply with:\n✅ **approve** to execute\n❌ **deny** to skip\n\n");
    text.push_str(&format!(
        "_Request `#{}` · expires in {}s_",
        short_id(&approval.request_id),
        timeout.as_secs()
    ));
    text
}
