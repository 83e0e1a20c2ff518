//! claude-mattermost relay
//!
//! Outbound calls to the chat backend (post message, create thread) and
//! inbound polling. Every caller goes through the [`RemoteRelay`] trait so the
//! broker, coordinator and daemon can run against `FakeRelay` (feature
//! `test-support`) in tests.

#[cfg(any(test, feature = "test-support"))]
pub mod fake;
pub mod mattermost;
pub mod retry;

use async_trait::async_trait;
use claude_mattermost_protocol::{Cursor, PostTarget, PostedMessage, RemoteMessage};
use thiserror::Error;

#[cfg(any(test, feature = "test-support"))]
pub use fake::FakeRelay;
pub use mattermost::{MattermostConfig, MattermostRelay};
pub use retry::{with_backoff, Backoff};

/// Errors that can occur talking to the chat backend
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Relay misconfigured: {0}")]
    Config(String),
}

impl RelayError {
    /// Transport hiccups are worth another attempt; auth and lookup
    /// failures will not fix themselves.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::Transport(_))
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RelayError::InvalidResponse(err.to_string())
        } else {
            RelayError::Transport(err.to_string())
        }
    }
}

/// Contract with the remote chat backend
#[async_trait]
pub trait RemoteRelay: Send + Sync {
    /// Post `text` as a new root post or as a reply inside a thread.
    async fn post_message(&self, target: &PostTarget, text: &str)
        -> Result<PostedMessage, RelayError>;

    /// Whether the thread rooted at `thread_id` still exists.
    async fn thread_exists(&self, thread_id: &str) -> Result<bool, RelayError>;

    /// Return `existing` if that thread still exists, otherwise start a new
    /// thread in `channel_id` seeded with `seed_text`.
    async fn ensure_thread(
        &self,
        channel_id: &str,
        seed_text: &str,
        existing: Option<&str>,
    ) -> Result<String, RelayError>;

    /// Messages written by humans at or after `cursor`, oldest first, and
    /// the cursor to resume from next time. Posts sharing the cursor's
    /// millisecond are returned again; callers dedupe by `message_id`.
    async fn poll_since(&self, cursor: Cursor)
        -> Result<(Vec<RemoteMessage>, Cursor), RelayError>;

    /// Id of the configured channel new threads are started in.
    async fn default_channel(&self) -> Result<String, RelayError>;

    /// One authenticated round trip. Returns the bot's display name.
    async fn ping(&self) -> Result<String, RelayError>;
}
