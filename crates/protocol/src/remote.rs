//! Remote chat types exchanged with the relay

use serde::{Deserialize, Serialize};

/// Monotonic poll position. For Mattermost this is the `create_at`
/// (Unix ms) of the newest post already observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Cursor(pub i64);

impl Cursor {
    /// Never move backwards.
    pub fn advance(self, observed: i64) -> Cursor {
        Cursor(self.0.max(observed))
    }
}

/// Where a message is posted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostTarget {
    /// A new root post in the channel (starts a thread)
    Channel { channel_id: String },
    /// A reply inside an existing thread
    Thread {
        channel_id: String,
        thread_id: String,
    },
}

impl PostTarget {
    pub fn thread(channel_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        PostTarget::Thread {
            channel_id: channel_id.into(),
            thread_id: thread_id.into(),
        }
    }

    pub fn channel_id(&self) -> &str {
        match self {
            PostTarget::Channel { channel_id } | PostTarget::Thread { channel_id, .. } => {
                channel_id
            }
        }
    }
}

/// Result of a successful post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedMessage {
    pub message_id: String,
    /// Root of the thread the post belongs to (its own id for root posts)
    pub thread_id: String,
}

/// A message observed while polling the remote channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub message_id: String,
    pub thread_id: String,
    pub text: String,
    /// Author's username (user id when it cannot be resolved)
    pub author: String,
    /// Unix milliseconds
    pub timestamp: i64,
}
