//! In-memory relay for tests of every relay caller.
//!
//! Records what was posted, hands out sequential thread ids, and replays
//! messages queued with [`FakeRelay::push_reply`] through `poll_since`.
//! Outages are simulated with [`FakeRelay::set_unavailable`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use claude_mattermost_protocol::{Cursor, PostTarget, PostedMessage, RemoteMessage};

use crate::{RelayError, RemoteRelay};

/// A post recorded by the fake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPost {
    pub message_id: String,
    pub channel_id: String,
    pub thread_id: String,
    pub text: String,
}

#[derive(Debug)]
pub struct FakeRelay {
    channel_id: String,
    unavailable: AtomicBool,
    next_id: AtomicU64,
    post_attempts: AtomicU64,
    posts: Mutex<Vec<RecordedPost>>,
    inbox: Mutex<Vec<RemoteMessage>>,
}

impl Default for FakeRelay {
    fn default() -> Self {
        Self::new("chan-1")
    }
}

impl FakeRelay {
    pub fn new(channel_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            unavailable: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            post_attempts: AtomicU64::new(0),
            posts: Mutex::new(Vec::new()),
            inbox: Mutex::new(Vec::new()),
        }
    }

    /// Make every call fail with a retryable transport error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Queue a human reply in `thread_id`, visible to the next poll.
    pub fn push_reply(&self, thread_id: &str, author: &str, text: &str, timestamp: i64) {
        let message_id = self.allocate("m");
        self.inbox.lock().unwrap().push(RemoteMessage {
            message_id,
            thread_id: thread_id.to_string(),
            text: text.to_string(),
            author: author.to_string(),
            timestamp,
        });
    }

    pub fn posts(&self) -> Vec<RecordedPost> {
        self.posts.lock().unwrap().clone()
    }

    pub fn posts_in(&self, thread_id: &str) -> Vec<String> {
        self.posts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.thread_id == thread_id)
            .map(|p| p.text.clone())
            .collect()
    }

    /// Number of root posts, i.e. threads created.
    pub fn threads_created(&self) -> usize {
        self.posts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.message_id == p.thread_id)
            .count()
    }

    /// Post calls made, including failed ones.
    pub fn post_attempts(&self) -> u64 {
        self.post_attempts.load(Ordering::SeqCst)
    }

    fn allocate(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn check_available(&self) -> Result<(), RelayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RelayError::Transport("fake relay offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteRelay for FakeRelay {
    async fn post_message(
        &self,
        target: &PostTarget,
        text: &str,
    ) -> Result<PostedMessage, RelayError> {
        self.post_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let message_id = self.allocate("T");
        let thread_id = match target {
            PostTarget::Channel { .. } => message_id.clone(),
            PostTarget::Thread { thread_id, .. } => thread_id.clone(),
        };
        self.posts.lock().unwrap().push(RecordedPost {
            message_id: message_id.clone(),
            channel_id: target.channel_id().to_string(),
            thread_id: thread_id.clone(),
            text: text.to_string(),
        });
        Ok(PostedMessage {
            message_id,
            thread_id,
        })
    }

    async fn thread_exists(&self, thread_id: &str) -> Result<bool, RelayError> {
        self.check_available()?;
        Ok(self
            .posts
            .lock()
            .unwrap()
            .iter()
            .any(|p| p.message_id == thread_id))
    }

    async fn ensure_thread(
        &self,
        channel_id: &str,
        seed_text: &str,
        existing: Option<&str>,
    ) -> Result<String, RelayError> {
        if let Some(thread_id) = existing {
            if self.thread_exists(thread_id).await? {
                return Ok(thread_id.to_string());
            }
        }
        let posted = self
            .post_message(
                &PostTarget::Channel {
                    channel_id: channel_id.to_string(),
                },
                seed_text,
            )
            .await?;
        Ok(posted.thread_id)
    }

    async fn poll_since(
        &self,
        cursor: Cursor,
    ) -> Result<(Vec<RemoteMessage>, Cursor), RelayError> {
        self.check_available()?;
        let mut messages: Vec<RemoteMessage> = self
            .inbox
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.timestamp >= cursor.0)
            .cloned()
            .collect();
        // Stable sort keeps same-millisecond messages in arrival order.
        messages.sort_by_key(|m| m.timestamp);
        let next = messages
            .iter()
            .fold(cursor, |c, m| c.advance(m.timestamp));
        Ok((messages, next))
    }

    async fn default_channel(&self) -> Result<String, RelayError> {
        self.check_available()?;
        Ok(self.channel_id.clone())
    }

    async fn ping(&self) -> Result<String, RelayError> {
        self.check_available()?;
        Ok("fake-bot".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_includes_the_cursor_millisecond() {
        let relay = FakeRelay::default();
        relay.push_reply("T1", "alice", "first", 10);
        relay.push_reply("T1", "alice", "second", 20);
        relay.push_reply("T1", "alice", "third", 20);

        let (messages, cursor) = relay.poll_since(Cursor(11)).await.unwrap();
        let texts: Vec<_> = messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["second", "third"]);
        assert_eq!(cursor, Cursor(20));

        let (messages, cursor) = relay.poll_since(cursor).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(cursor, Cursor(20));
    }

    #[tokio::test]
    async fn ensure_thread_reuses_known_threads() {
        let relay = FakeRelay::default();
        let first = relay.ensure_thread("chan-1", "seed", None).await.unwrap();
        let again = relay
            .ensure_thread("chan-1", "seed", Some(&first))
            .await
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(relay.threads_created(), 1);
        assert!(relay.thread_exists(&first).await.unwrap());
        assert!(!relay.thread_exists("T404").await.unwrap());
    }
}
