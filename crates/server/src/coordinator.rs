//! Session Coordinator - maps lifecycle events onto threads and statuses.

use claude_mattermost_protocol::{short_id, PostTarget, Session, SessionStatus};
use claude_mattermost_relay::{with_backoff, Backoff, RemoteRelay};
use tracing::{info, warn};

use crate::broker::expire_for_session;
use crate::error::{CoreError, CoreResult};
use crate::handoff::HandoffChannel;
use crate::registry::NewSession;
use crate::store::Store;

pub struct Coordinator<'a> {
    store: &'a Store,
    relay: &'a dyn RemoteRelay,
    handoff: &'a HandoffChannel,
    backoff: Backoff,
}

impl<'a> Coordinator<'a> {
    pub fn new(
        store: &'a Store,
        relay: &'a dyn RemoteRelay,
        handoff: &'a HandoffChannel,
        backoff: Backoff,
    ) -> Self {
        Self {
            store,
            relay,
            handoff,
            backoff,
        }
    }

    /// Bind `session_id` to a thread.
    ///
    /// Without `force` a known active session is returned as is. With
    /// `force` an existing record is reactivated on its prior thread.
    pub async fn start(
        &self,
        session_id: &str,
        project_path: &str,
        force: bool,
    ) -> CoreResult<Session> {
        let registry = self.store.sessions();

        if let Some(existing) = registry.find(session_id)? {
            if !force {
                if existing.status.is_terminal() {
                    return Err(CoreError::SessionNotActive {
                        id: existing.id,
                        status: existing.status,
                    });
                }
                registry.touch(session_id)?;
                return registry.get(session_id);
            }
            return self.resume(existing).await;
        }

        let channel_id = with_backoff(self.backoff, "default_channel", || {
            self.relay.default_channel()
        })
        .await?;
        let banner = start_banner(session_id, project_path);
        let (channel, seed) = (channel_id.as_str(), banner.as_str());
        let thread_id = with_backoff(self.backoff, "ensure_thread", move || {
            self.relay.ensure_thread(channel, seed, None)
        })
        .await?;

        let session = registry.create(
            NewSession {
                id: session_id.to_string(),
                project_path: project_path.to_string(),
                thread_id,
                channel_id,
            },
            false,
        )?;
        info!(
            component = "coordinator",
            event = "session.started",
            session_id = %session.id,
            thread_id = %session.thread_id,
            project = %session.project_name(),
            "Session started"
        );
        Ok(session)
    }

    /// Reactivate on the recorded thread. Nothing is posted when that
    /// thread is gone; a session keeps exactly one thread.
    async fn resume(&self, existing: Session) -> CoreResult<Session> {
        let prior = existing.thread_id.as_str();
        let alive = with_backoff(self.backoff, "thread_exists", move || {
            self.relay.thread_exists(prior)
        })
        .await?;
        if !alive {
            warn!(
                component = "coordinator",
                event = "session.thread_gone",
                session_id = %existing.id,
                thread_id = %existing.thread_id,
                "Recorded thread no longer exists, not resuming"
            );
            return Err(CoreError::ThreadGone {
                id: existing.id,
                thread_id: existing.thread_id,
            });
        }

        let session = self.store.sessions().create(
            NewSession {
                id: existing.id.clone(),
                project_path: existing.project_path.clone(),
                thread_id: existing.thread_id.clone(),
                channel_id: existing.channel_id.clone(),
            },
            true,
        )?;

        self.post_best_effort(&session, "🔄 **Session resumed**").await;
        info!(
            component = "coordinator",
            event = "session.resumed",
            session_id = %session.id,
            thread_id = %session.thread_id,
            previous_status = %existing.status,
            "Session resumed"
        );
        Ok(session)
    }

    /// Post a notification into the session's thread.
    pub async fn notify(&self, session_id: &str, text: &str) -> CoreResult<()> {
        let session = self.active(session_id)?;
        self.store.sessions().touch(session_id)?;
        self.post(&session, text).await
    }

    /// Post the assistant's reply into the session's thread.
    pub async fn respond(&self, session_id: &str, text: &str) -> CoreResult<()> {
        let session = self.active(session_id)?;
        self.store.sessions().touch(session_id)?;
        self.post(&session, &format!("💬 {}", text)).await
    }

    /// End the session: completion banner, `ended`, pending approvals expired.
    pub async fn stop(&self, session_id: &str) -> CoreResult<Session> {
        let session = self.store.sessions().get(session_id)?;
        if session.status == SessionStatus::Active {
            self.post_best_effort(&session, "✓ **Session ended**").await;
        }
        self.store
            .sessions()
            .set_status(session_id, SessionStatus::Ended)?;
        expire_for_session(self.store, self.handoff, session_id)?;

        info!(
            component = "coordinator",
            event = "session.ended",
            session_id = %session_id,
            "Session ended"
        );
        self.store.sessions().get(session_id)
    }

    fn active(&self, session_id: &str) -> CoreResult<Session> {
        let session = self.store.sessions().get(session_id)?;
        if session.status.is_terminal() {
            return Err(CoreError::SessionNotActive {
                id: session.id,
                status: session.status,
            });
        }
        Ok(session)
    }

    async fn post(&self, session: &Session, text: &str) -> CoreResult<()> {
        let target = PostTarget::thread(&session.channel_id, &session.thread_id);
        let target = &target;
        with_backoff(self.backoff, "post_message", move || {
            self.relay.post_message(target, text)
        })
        .await?;
        Ok(())
    }

    async fn post_best_effort(&self, session: &Session, text: &str) {
        if let Err(e) = self.post(session, text).await {
            warn!(
                component = "coordinator",
                event = "session.banner_failed",
                session_id = %session.id,
                error = %e,
                "Could not post session banner"
            );
        }
    }
}

fn start_banner(session_id: &str, project_path: &str) -> String {
    let project = project_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(project_path);
    format!(
        "🚀 **Claude Code session started**\n\n\
         **Project:** `{}`\n\
         **Path:** `{}`\n\
         **Session:** `{}`\n\n\
         Tool approvals and replies for this session happen in this thread.",
        project,
        project_path,
        short_id(session_id)
    )
}
