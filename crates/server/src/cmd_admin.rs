//! Administrative commands: `list`, `end`, `test-connection`, `cleanup`.

use std::time::Duration;

use anyhow::Context;
use claude_mattermost_protocol::{short_id, Session, SessionStatus};
use claude_mattermost_relay::RemoteRelay;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{ContentArrangement, Table};
use tracing::info;

use crate::coordinator::Coordinator;
use crate::error::CoreError;
use crate::inbox::Inbox;
use crate::registry::SessionFilter;
use crate::store::{format_ms, Store};

pub fn list(store: &Store, all: bool, status: Option<SessionStatus>) -> anyhow::Result<()> {
    let filter = SessionFilter {
        status: if all { status } else { status.or(Some(SessionStatus::Active)) },
        project_path: None,
    };
    let sessions = store.sessions().list(&filter)?;

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    let approvals = store.approvals();
    let mut rows = Vec::with_capacity(sessions.len());
    for session in &sessions {
        let pending = approvals.pending_for_session(&session.id)?.len();
        rows.push(session_row(session, pending));
    }
    println!("{}", sessions_table(rows));
    Ok(())
}

fn session_row(session: &Session, pending: usize) -> Vec<String> {
    vec![
        short_id(&session.id).to_string(),
        session.project_name().to_string(),
        session.status.to_string(),
        pending.to_string(),
        format_ms(session.last_active),
        session.thread_id.clone(),
    ]
}

fn sessions_table(rows: Vec<Vec<String>>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "Session", "Project", "Status", "Pending", "Last active", "Thread",
        ]);
    for row in rows {
        table.add_row(row);
    }
    table
}

/// Force a session to `ended`, expiring its pending approvals.
pub async fn end(coordinator: &Coordinator<'_>, store: &Store, session_id: &str) -> anyhow::Result<()> {
    let session_id = resolve_session_id(store, session_id)?;
    let session = coordinator
        .stop(&session_id)
        .await
        .with_context(|| format!("failed to end session {}", session_id))?;
    println!(
        "Ended session {} ({})",
        short_id(&session.id),
        session.project_name()
    );
    Ok(())
}

/// Accept a full id or a unique prefix, as shown by `list`.
fn resolve_session_id(store: &Store, id: &str) -> anyhow::Result<String> {
    if store.sessions().find(id)?.is_some() {
        return Ok(id.to_string());
    }
    let matches: Vec<Session> = store
        .sessions()
        .list(&SessionFilter::default())?
        .into_iter()
        .filter(|s| s.id.starts_with(id))
        .collect();
    match matches.as_slice() {
        [only] => Ok(only.id.clone()),
        [] => Err(CoreError::session_not_found(id).into()),
        _ => anyhow::bail!("session id prefix '{}' is ambiguous", id),
    }
}

/// One authenticated round trip plus channel lookup.
pub async fn test_connection(relay: &dyn RemoteRelay) -> anyhow::Result<()> {
    let bot = relay.ping().await.context("authentication failed")?;
    println!("  Authenticated as @{}", bot);
    let channel = relay
        .default_channel()
        .await
        .context("channel lookup failed")?;
    println!("  Channel resolved: {}", channel);
    println!("  Connection OK");
    Ok(())
}

/// Purge sessions idle for longer than `retention`, with their inboxes.
pub fn cleanup(store: &Store, inbox: &Inbox, retention: Duration) -> anyhow::Result<usize> {
    let purged = store.sessions().purge_older_than(retention)?;
    for id in &purged {
        inbox.remove(id)?;
    }
    info!(
        component = "admin",
        event = "cleanup.completed",
        purged = purged.len(),
        retention_days = retention.as_secs() / 86_400,
        "Cleanup completed"
    );
    println!(
        "Removed {} session(s) inactive for more than {} day(s)",
        purged.len(),
        retention.as_secs() / 86_400
    );
    Ok(purged.len())
}
