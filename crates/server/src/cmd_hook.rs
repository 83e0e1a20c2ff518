//! `claude-mattermost hook ...`: entry points Claude Code runs as hooks.
//!
//! Exit status is the contract with Claude Code: 0 lets the tool run (or the
//! session continue), 2 blocks it and Claude Code shows our stderr. Anything
//! that goes wrong while asking for an approval blocks. Notifications and
//! lifecycle events never block the session.

use std::io::Read;
use std::path::Path;

use clap::{Args, Subcommand};
use claude_mattermost_protocol::{Decision, HookEvent, HookPayload};
use claude_mattermost_relay::{Backoff, MattermostRelay, RemoteRelay};
use tracing::{info, warn};

use crate::broker::{ApprovalPolicy, ApprovalRequest, Broker};
use crate::config::Settings;
use crate::coordinator::Coordinator;
use crate::error::{CoreError, CoreResult};
use crate::handoff::HandoffChannel;
use crate::hook_client::{self, WaitSettings};
use crate::inbox::{self, Inbox};
use crate::paths;
use crate::store::Store;
use crate::transcript;

const EXIT_CONTINUE: i32 = 0;
const EXIT_BLOCK: i32 = 2;

const WAITING_FALLBACK: &str = "⏸️ Claude finished its turn and is waiting for input";

#[derive(Subcommand, Debug, Clone)]
pub enum HookCommand {
    /// Read a Claude Code hook payload from stdin and dispatch on its event
    Claude,
    /// Ask for approval of a tool call and block until decided
    RequestApproval {
        #[command(flatten)]
        session: SessionArg,
        #[arg(long, env = "CLAUDE_TOOL_NAME")]
        tool_name: String,
        #[arg(long, env = "CLAUDE_COMMAND", default_value = "")]
        command: String,
        #[arg(long, env = "CLAUDE_DESCRIPTION", default_value = "")]
        description: String,
    },
    /// Post a notification into the session thread
    Notify {
        #[command(flatten)]
        session: SessionArg,
        #[arg(long, env = "CLAUDE_MESSAGE")]
        message: String,
    },
    /// Post Claude's reply into the session thread
    Respond {
        #[command(flatten)]
        session: SessionArg,
        #[arg(long, env = "CLAUDE_MESSAGE")]
        message: String,
    },
    /// Bind the session to a thread
    SessionStart {
        #[command(flatten)]
        session: SessionArg,
        /// Project directory (defaults to the current directory)
        #[arg(long)]
        project_path: Option<String>,
        /// Reactivate an ended or timed out session on its prior thread
        #[arg(long)]
        force: bool,
    },
    /// End the session and expire its pending approvals
    SessionStop {
        #[command(flatten)]
        session: SessionArg,
    },
    /// Print messages forwarded from the thread since the last call
    PullMessages {
        #[command(flatten)]
        session: SessionArg,
    },
}

#[derive(Args, Debug, Clone)]
pub struct SessionArg {
    #[arg(long, env = "CLAUDE_SESSION_ID")]
    pub session_id: String,
}

/// A hook invocation, independent of how it was delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    RequestApproval {
        session_id: String,
        tool_name: String,
        command: String,
        description: String,
    },
    Notify { session_id: String, message: String },
    Respond { session_id: String, message: String },
    SessionStart {
        session_id: String,
        project_path: String,
        force: bool,
    },
    SessionStop { session_id: String },
    PullMessages { session_id: String },
    /// Events the bridge does not care about
    Ignore,
}

impl HookAction {
    fn is_approval(&self) -> bool {
        matches!(self, HookAction::RequestApproval { .. })
    }

    fn name(&self) -> &'static str {
        match self {
            HookAction::RequestApproval { .. } => "request_approval",
            HookAction::Notify { .. } => "notify",
            HookAction::Respond { .. } => "respond",
            HookAction::SessionStart { .. } => "session_start",
            HookAction::SessionStop { .. } => "session_stop",
            HookAction::PullMessages { .. } => "pull_messages",
            HookAction::Ignore => "ignore",
        }
    }

    pub fn from_payload(payload: HookPayload) -> Self {
        let session_id = payload.session_id.clone();
        match payload.hook_event_name {
            HookEvent::SessionStart => HookAction::SessionStart {
                session_id,
                force: payload.is_resume(),
                project_path: payload.cwd.clone().unwrap_or_else(current_dir),
            },
            HookEvent::PreToolUse => HookAction::RequestApproval {
                session_id,
                tool_name: payload.tool_name.clone().unwrap_or_default(),
                command: payload.command_text(),
                description: payload.description_text(),
            },
            HookEvent::Notification => match payload.message {
                Some(message) if !message.trim().is_empty() => {
                    HookAction::Notify { session_id, message }
                }
                _ => HookAction::Ignore,
            },
            HookEvent::Stop => HookAction::Respond {
                session_id,
                message: payload
                    .transcript_path
                    .as_deref()
                    .and_then(|p| transcript::last_assistant_text(Path::new(p)))
                    .unwrap_or_else(|| WAITING_FALLBACK.to_string()),
            },
            HookEvent::SessionEnd => HookAction::SessionStop { session_id },
            HookEvent::UserPromptSubmit => HookAction::PullMessages { session_id },
            HookEvent::Other => HookAction::Ignore,
        }
    }
}

impl HookCommand {
    fn into_action(self) -> CoreResult<HookAction> {
        Ok(match self {
            HookCommand::Claude => {
                let mut raw = String::new();
                std::io::stdin().read_to_string(&mut raw)?;
                let payload: HookPayload = serde_json::from_str(&raw)
                    .map_err(|e| CoreError::Config(format!("invalid hook payload: {}", e)))?;
                HookAction::from_payload(payload)
            }
            HookCommand::RequestApproval {
                session,
                tool_name,
                command,
                description,
            } => HookAction::RequestApproval {
                session_id: session.session_id,
                tool_name,
                command,
                description,
            },
            HookCommand::Notify { session, message } => HookAction::Notify {
                session_id: session.session_id,
                message,
            },
            HookCommand::Respond { session, message } => HookAction::Respond {
                session_id: session.session_id,
                message,
            },
            HookCommand::SessionStart {
                session,
                project_path,
                force,
            } => HookAction::SessionStart {
                session_id: session.session_id,
                project_path: project_path.unwrap_or_else(current_dir),
                force,
            },
            HookCommand::SessionStop { session } => HookAction::SessionStop {
                session_id: session.session_id,
            },
            HookCommand::PullMessages { session } => HookAction::PullMessages {
                session_id: session.session_id,
            },
        })
    }
}

/// Exit code when settings cannot be loaded at all. `claude` mode could be
/// carrying an approval, so it blocks too.
pub fn config_failure_code(command: &HookCommand) -> i32 {
    match command {
        HookCommand::Claude | HookCommand::RequestApproval { .. } => EXIT_BLOCK,
        _ => EXIT_CONTINUE,
    }
}

fn current_dir() -> String {
    std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

/// What the hook process prints and how it exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// Exit 0, optionally printing context for Claude Code on stdout
    Continue(Option<String>),
    /// Exit 2 with the reason on stderr
    Block(String),
}

impl HookOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            HookOutcome::Continue(_) => EXIT_CONTINUE,
            HookOutcome::Block(_) => EXIT_BLOCK,
        }
    }
}

/// Everything a hook needs, opened once per invocation.
pub struct HookEnv<'a> {
    pub store: &'a Store,
    pub relay: &'a dyn RemoteRelay,
    pub handoff: &'a HandoffChannel,
    pub inbox: &'a Inbox,
    pub policy: ApprovalPolicy,
    pub backoff: Backoff,
    pub wait: WaitSettings,
}

/// Run a hook command to completion and return the process exit code.
pub async fn run(command: HookCommand, settings: &Settings) -> i32 {
    let action = match command.into_action() {
        Ok(action) => action,
        // The event is unknown, so it could have been an approval.
        Err(e) => return emit(HookOutcome::Block(format!("claude-mattermost: {}", e))),
    };
    if action == HookAction::Ignore {
        return EXIT_CONTINUE;
    }

    let outcome = match open_and_dispatch(&action, settings).await {
        Ok(outcome) => outcome,
        Err(e) => failed(&action, &e),
    };
    emit(outcome)
}

async fn open_and_dispatch(action: &HookAction, settings: &Settings) -> CoreResult<HookOutcome> {
    paths::ensure_dirs()?;
    let store = Store::open(&paths::db_path())?;
    let handoff = HandoffChannel::new(paths::responses_dir());
    let inbox = Inbox::new(paths::inbox_dir());

    // Pulling the inbox is local; it must not depend on relay settings.
    if let HookAction::PullMessages { session_id } = action {
        return pull(&inbox, session_id);
    }
    let relay = MattermostRelay::new(settings.mattermost_config()?)?;

    let env = HookEnv {
        store: &store,
        relay: &relay,
        handoff: &handoff,
        inbox: &inbox,
        policy: settings.approval_policy(),
        backoff: settings.backoff(),
        wait: settings.wait_settings(),
    };
    Ok(dispatch(&env, action.clone()).await)
}

/// Dispatch one action. Errors are folded into the outcome.
pub async fn dispatch(env: &HookEnv<'_>, action: HookAction) -> HookOutcome {
    match run_action(env, &action).await {
        Ok(outcome) => outcome,
        Err(e) => failed(&action, &e),
    }
}

async fn run_action(env: &HookEnv<'_>, action: &HookAction) -> CoreResult<HookOutcome> {
    let coordinator = Coordinator::new(env.store, env.relay, env.handoff, env.backoff);

    match action {
        HookAction::RequestApproval {
            session_id,
            tool_name,
            command,
            description,
        } => {
            let broker = Broker::new(env.store, env.relay, env.handoff, env.policy.clone());
            let request = ApprovalRequest {
                session_id: session_id.clone(),
                tool_name: tool_name.clone(),
                command: command.clone(),
                description: description.clone(),
            };
            let decision =
                hook_client::request_approval(&broker, env.store, env.handoff, request, env.wait)
                    .await?;
            Ok(match decision {
                Decision::Approved => HookOutcome::Continue(None),
                Decision::Denied => {
                    HookOutcome::Block(format!("{} was denied from Mattermost", tool_name))
                }
            })
        }
        HookAction::Notify {
            session_id,
            message,
        } => {
            hook_client::send_notification(&coordinator, session_id, message).await?;
            Ok(HookOutcome::Continue(None))
        }
        HookAction::Respond {
            session_id,
            message,
        } => {
            hook_client::send_response(&coordinator, session_id, message).await?;
            Ok(HookOutcome::Continue(None))
        }
        HookAction::SessionStart {
            session_id,
            project_path,
            force,
        } => {
            let session = coordinator.start(session_id, project_path, *force).await?;
            info!(
                component = "hook",
                event = "hook.session_started",
                session_id = %session.id,
                thread_id = %session.thread_id,
                "Session bound to thread"
            );
            Ok(HookOutcome::Continue(None))
        }
        HookAction::SessionStop { session_id } => {
            coordinator.stop(session_id).await?;
            Ok(HookOutcome::Continue(None))
        }
        HookAction::PullMessages { session_id } => pull(env.inbox, session_id),
        HookAction::Ignore => Ok(HookOutcome::Continue(None)),
    }
}

fn pull(inbox: &Inbox, session_id: &str) -> CoreResult<HookOutcome> {
    let messages = hook_client::pull_messages(inbox, session_id)?;
    if messages.is_empty() {
        return Ok(HookOutcome::Continue(None));
    }
    info!(
        component = "hook",
        event = "hook.messages_pulled",
        session_id = %session_id,
        count = messages.len(),
        "Forwarding thread messages"
    );
    Ok(HookOutcome::Continue(Some(inbox::render(&messages))))
}

fn failed(action: &HookAction, err: &CoreError) -> HookOutcome {
    warn!(
        component = "hook",
        event = "hook.failed",
        action = action.name(),
        error = %err,
        "Hook failed"
    );
    if action.is_approval() {
        HookOutcome::Block(format!("claude-mattermost: approval unavailable ({})", err))
    } else {
        HookOutcome::Continue(None)
    }
}

fn emit(outcome: HookOutcome) -> i32 {
    match &outcome {
        HookOutcome::Continue(Some(text)) => println!("{}", text),
        HookOutcome::Continue(None) => {}
        HookOutcome::Block(reason) => eprintln!("{}", reason),
    }
    outcome.exit_code()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::test_support::seed_session;
    use crate::inbox::InboxMessage;
    use crate::store::test_support::temp_store;
    use claude_mattermost_protocol::SessionStatus;
    use claude_mattermost_relay::FakeRelay;
    use std::time::Duration;

    fn env<'a>(
        store: &'a Store,
        relay: &'a FakeRelay,
        handoff: &'a HandoffChannel,
        inbox: &'a Inbox,
    ) -> HookEnv<'a> {
        HookEnv {
            store,
            relay,
            handoff,
            inbox,
            policy: ApprovalPolicy {
                timeout: Duration::from_secs(5),
                backoff: Backoff {
                    attempts: 1,
                    base_delay: Duration::from_millis(1),
                },
                allowed_users: Vec::new(),
            },
            backoff: Backoff {
                attempts: 1,
                base_delay: Duration::from_millis(1),
            },
            wait: WaitSettings {
                poll_interval: Duration::from_millis(10),
                grace: Duration::from_millis(50),
            },
        }
    }

    fn payload(raw: &str) -> HookPayload {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn pre_tool_use_maps_to_approval_request() {
        let action = HookAction::from_payload(payload(
            r#"{"session_id": "s1", "hook_event_name": "PreToolUse", "tool_name": "Bash",
                "tool_input": {"command": "rm -rf build", "description": "Clean"}}"#,
        ));
        assert_eq!(
            action,
            HookAction::RequestApproval {
                session_id: "s1".into(),
                tool_name: "Bash".into(),
                command: "rm -rf build".into(),
                description: "Clean".into(),
            }
        );
        assert!(action.is_approval());
    }

    #[test]
    fn resume_start_forces_reactivation() {
        let action = HookAction::from_payload(payload(
            r#"{"session_id": "s1", "hook_event_name": "SessionStart", "cwd": "/work/a", "source": "resume"}"#,
        ));
        assert_eq!(
            action,
            HookAction::SessionStart {
                session_id: "s1".into(),
                project_path: "/work/a".into(),
                force: true,
            }
        );
    }

    #[test]
    fn stop_without_transcript_uses_fallback() {
        let action = HookAction::from_payload(payload(
            r#"{"session_id": "s1", "hook_event_name": "Stop"}"#,
        ));
        assert_eq!(
            action,
            HookAction::Respond {
                session_id: "s1".into(),
                message: WAITING_FALLBACK.into(),
            }
        );
    }

    #[test]
    fn empty_notifications_and_unknown_events_are_ignored() {
        let empty = HookAction::from_payload(payload(
            r#"{"session_id": "s1", "hook_event_name": "Notification", "message": "  "}"#,
        ));
        let other = HookAction::from_payload(payload(
            r#"{"session_id": "s1", "hook_event_name": "PreCompact"}"#,
        ));
        assert_eq!(empty, HookAction::Ignore);
        assert_eq!(other, HookAction::Ignore);
    }

    #[tokio::test]
    async fn approval_blocks_when_relay_is_down() {
        let (dir, store) = temp_store();
        let relay = FakeRelay::default();
        let handoff = HandoffChannel::new(dir.path().join("responses"));
        let inbox = Inbox::new(dir.path().join("inbox"));
        seed_session(&store, "s1", "T1");
        relay.set_unavailable(true);

        let outcome = dispatch(
            &env(&store, &relay, &handoff, &inbox),
            HookAction::RequestApproval {
                session_id: "s1".into(),
                tool_name: "Bash".into(),
                command: "ls".into(),
                description: String::new(),
            },
        )
        .await;
        assert_eq!(outcome.exit_code(), EXIT_BLOCK);
    }

    #[tokio::test]
    async fn approval_for_unknown_session_blocks() {
        let (dir, store) = temp_store();
        let relay = FakeRelay::default();
        let handoff = HandoffChannel::new(dir.path().join("responses"));
        let inbox = Inbox::new(dir.path().join("inbox"));

        let outcome = dispatch(
            &env(&store, &relay, &handoff, &inbox),
            HookAction::RequestApproval {
                session_id: "ghost".into(),
                tool_name: "Bash".into(),
                command: "ls".into(),
                description: String::new(),
            },
        )
        .await;
        assert!(matches!(outcome, HookOutcome::Block(_)));
    }

    #[tokio::test]
    async fn notify_failure_does_not_block() {
        let (dir, store) = temp_store();
        let relay = FakeRelay::default();
        let handoff = HandoffChannel::new(dir.path().join("responses"));
        let inbox = Inbox::new(dir.path().join("inbox"));

        let outcome = dispatch(
            &env(&store, &relay, &handoff, &inbox),
            HookAction::Notify {
                session_id: "ghost".into(),
                message: "hello".into(),
            },
        )
        .await;
        assert_eq!(outcome, HookOutcome::Continue(None));
    }

    #[tokio::test]
    async fn start_then_stop_round_trip() {
        let (dir, store) = temp_store();
        let relay = FakeRelay::default();
        let handoff = HandoffChannel::new(dir.path().join("responses"));
        let inbox = Inbox::new(dir.path().join("inbox"));
        let env = env(&store, &relay, &handoff, &inbox);

        let started = dispatch(
            &env,
            HookAction::SessionStart {
                session_id: "s1".into(),
                project_path: "/work/proj-A".into(),
                force: false,
            },
        )
        .await;
        assert_eq!(started, HookOutcome::Continue(None));
        assert_eq!(
            store.sessions().get("s1").unwrap().status,
            SessionStatus::Active
        );

        dispatch(&env, HookAction::SessionStop { session_id: "s1".into() }).await;
        assert_eq!(
            store.sessions().get("s1").unwrap().status,
            SessionStatus::Ended
        );
    }

    #[tokio::test]
    async fn pull_messages_prints_forwarded_replies() {
        let (dir, store) = temp_store();
        let relay = FakeRelay::default();
        let handoff = HandoffChannel::new(dir.path().join("responses"));
        let inbox = Inbox::new(dir.path().join("inbox"));
        inbox
            .deliver(
                "s1",
                &InboxMessage {
                    message_id: "m1".into(),
                    author: "alice".into(),
                    text: "use the staging db".into(),
                    timestamp: 1,
                },
            )
            .unwrap();
        let env = env(&store, &relay, &handoff, &inbox);

        let outcome = dispatch(&env, HookAction::PullMessages { session_id: "s1".into() }).await;
        match outcome {
            HookOutcome::Continue(Some(text)) => assert!(text.contains("@alice: use the staging db")),
            other => panic!("unexpected outcome {:?}", other),
        }

        let again = dispatch(&env, HookAction::PullMessages { session_id: "s1".into() }).await;
        assert_eq!(again, HookOutcome::Continue(None));
    }
}
