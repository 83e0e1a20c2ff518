//! Per-session inbox of thread messages that were not approval decisions.
//!
//! The daemon appends JSON lines to `<dir>/<session_id>.jsonl`; the hook's
//! `pull-messages` drains them into the foreground session.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxMessage {
    pub message_id: String,
    pub author: String,
    pub text: String,
    /// Unix milliseconds
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct Inbox {
    dir: PathBuf,
}

impl Inbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", session_id))
    }

    pub fn deliver(&self, session_id: &str, message: &InboxMessage) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(session_id))?;
        file.write_all(line.as_bytes())?;

        debug!(
            component = "inbox",
            event = "inbox.appended",
            session_id = %session_id,
            message_id = %message.message_id,
            "Forwarded thread message"
        );
        Ok(())
    }

    /// Take every queued message for `session_id`, oldest first.
    ///
    /// The file is renamed aside before reading so appends racing with the
    /// drain land in a fresh file instead of being lost.
    pub fn drain(&self, session_id: &str) -> io::Result<Vec<InboxMessage>> {
        let path = self.path_for(session_id);
        let draining = self
            .dir
            .join(format!("{}.jsonl.draining.{}", session_id, std::process::id()));

        match fs::rename(&path, &draining) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let content = fs::read_to_string(&draining)?;
        fs::remove_file(&draining)?;

        let messages = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<InboxMessage>(line) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(
                        component = "inbox",
                        event = "inbox.bad_line",
                        session_id = %session_id,
                        error = %e,
                        "Skipping unreadable inbox line"
                    );
                    None
                }
            })
            .collect();
        Ok(messages)
    }

    /// Drop the inbox of a purged session.
    pub fn remove(&self, session_id: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(session_id)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Render drained messages as context for the foreground session.
pub fn render(messages: &[InboxMessage]) -> String {
    let mut out = String::from("Messages from the Mattermost thread since your last turn:\n");
    for message in messages {
        out.push_str(&format!("- @{}: {}\n", message.author, message.text));
    }
    out
}
