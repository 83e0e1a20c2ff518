//! claude-mattermost protocol
//!
//! Record types shared by the daemon, the hook client and the relay:
//! sessions, pending approvals, remote messages and Claude Code hook payloads.

use uuid::Uuid;

pub mod hook;
pub mod remote;
pub mod types;

pub use hook::{HookEvent, HookPayload};
pub use remote::{Cursor, PostTarget, PostedMessage, RemoteMessage};
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Short, human-typeable form of a request id (first 8 chars).
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
