//! Mattermost REST (v4) relay.
//!
//! Threads are root posts; a reply's `root_id` names its thread. Polling uses
//! `GET /channels/{id}/posts?since=<ms>` with the newest observed `create_at`
//! as the cursor. Posts at the cursor millisecond are returned on every poll.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::debug;

use claude_mattermost_protocol::{Cursor, PostTarget, PostedMessage, RemoteMessage};

use crate::{RelayError, RemoteRelay};

/// Connection settings for a Mattermost bot account
#[derive(Debug, Clone)]
pub struct MattermostConfig {
    pub url: String,
    pub token: String,
    pub team: String,
    pub channel: String,
    pub request_timeout: Duration,
}

pub struct MattermostRelay {
    client: reqwest::Client,
    base_url: String,
    token: String,
    team: String,
    channel: String,
    channel_id: OnceCell<String>,
    bot_user: OnceCell<BotUser>,
    /// user id -> username
    usernames: Mutex<HashMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct BotUser {
    id: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    username: String,
}

#[derive(Debug, Deserialize)]
struct ChannelInfo {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Post {
    id: String,
    #[serde(default)]
    root_id: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    message: String,
    create_at: i64,
    #[serde(default)]
    delete_at: i64,
    /// Empty for user posts; `system_*` for joins, header changes, ...
    #[serde(default, rename = "type")]
    post_type: String,
}

#[derive(Debug, Deserialize)]
struct PostList {
    #[serde(default)]
    order: Vec<String>,
    #[serde(default)]
    posts: HashMap<String, Post>,
}

impl MattermostRelay {
    pub fn new(config: MattermostConfig) -> Result<Self, RelayError> {
        if config.url.trim().is_empty() || config.token.trim().is_empty() {
            return Err(RelayError::Config("url and token are required".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RelayError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: normalize_base_url(&config.url),
            token: config.token,
            team: config.team,
            channel: config.channel,
            channel_id: OnceCell::new(),
            bot_user: OnceCell::new(),
            usernames: Mutex::new(HashMap::new()),
        })
    }

    async fn request<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, RelayError> {
        let url = format!("{}/api/v4{}", self.base_url, path);
        let mut req = self
            .client
            .request(method, &url)
            .bearer_auth(&self.token);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(status, path, &text));
        }
        Ok(resp.json::<T>().await?)
    }

    async fn bot_user(&self) -> Result<&BotUser, RelayError> {
        self.bot_user
            .get_or_try_init(|| async move {
                self.request::<BotUser>(Method::GET, "/users/me", None)
                    .await
            })
            .await
    }

    /// Username for `user_id`, falling back to the id when the lookup fails.
    async fn username(&self, user_id: &str) -> String {
        if let Some(name) = self.cached_username(user_id) {
            return name;
        }
        match self
            .request::<UserInfo>(Method::GET, &format!("/users/{}", user_id), None)
            .await
        {
            Ok(user) => {
                if let Ok(mut cache) = self.usernames.lock() {
                    cache.insert(user_id.to_string(), user.username.clone());
                }
                user.username
            }
            Err(e) => {
                debug!(component = "relay", user_id = %user_id, error = %e, "Username lookup failed");
                user_id.to_string()
            }
        }
    }

    fn cached_username(&self, user_id: &str) -> Option<String> {
        self.usernames.lock().ok()?.get(user_id).cloned()
    }
}

fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

fn status_error(status: StatusCode, path: &str, body: &str) -> RelayError {
    let detail = format!("{} {}: {}", status.as_u16(), path, body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RelayError::Unauthorized(detail),
        StatusCode::NOT_FOUND => RelayError::NotFound(detail),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            RelayError::Transport(detail)
        }
        _ => RelayError::InvalidResponse(detail),
    }
}

fn thread_of(post: &Post) -> String {
    if post.root_id.is_empty() {
        post.id.clone()
    } else {
        post.root_id.clone()
    }
}

/// Turn a `since` response into human messages created at or after `cursor`.
fn collect_messages(list: PostList, cursor: Cursor, bot_user_id: &str) -> (Vec<RemoteMessage>, Cursor) {
    let mut next = cursor;
    let mut messages = Vec::new();

    let mut posts: Vec<Post> = list.posts.into_values().collect();
    if !list.order.is_empty() {
        debug!(component = "relay", returned = list.order.len(), "Polled channel posts");
    }
    posts.sort_by(|a, b| a.create_at.cmp(&b.create_at).then_with(|| a.id.cmp(&b.id)));

    for post in posts {
        // `since` also returns edits and deletions of older posts
        if post.create_at < cursor.0 {
            continue;
        }
        next = next.advance(post.create_at);
        if post.delete_at > 0 || !post.post_type.is_empty() || post.user_id == bot_user_id {
            continue;
        }
        messages.push(RemoteMessage {
            thread_id: thread_of(&post),
            message_id: post.id,
            text: post.message,
            author: post.user_id,
            timestamp: post.create_at,
        });
    }

    (messages, next)
}

#[async_trait]
impl RemoteRelay for MattermostRelay {
    async fn post_message(
        &self,
        target: &PostTarget,
        text: &str,
    ) -> Result<PostedMessage, RelayError> {
        let body = match target {
            PostTarget::Channel { channel_id } => json!({
                "channel_id": channel_id,
                "message": text,
            }),
            PostTarget::Thread {
                channel_id,
                thread_id,
            } => json!({
                "channel_id": channel_id,
                "message": text,
                "root_id": thread_id,
            }),
        };
        let post: Post = self.request(Method::POST, "/posts", Some(body)).await?;
        Ok(PostedMessage {
            thread_id: thread_of(&post),
            message_id: post.id,
        })
    }

    async fn thread_exists(&self, thread_id: &str) -> Result<bool, RelayError> {
        match self
            .request::<Post>(Method::GET, &format!("/posts/{}", thread_id), None)
            .await
        {
            Ok(post) => Ok(post.delete_at == 0 && post.root_id.is_empty()),
            Err(RelayError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
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
        let channel_id = self.default_channel().await?;
        let bot_user_id = self.bot_user().await?.id.clone();
        // `since` is exclusive; ask from the millisecond before the cursor
        // so late posts sharing it are still returned.
        let since = cursor.0.saturating_sub(1);
        let list: PostList = self
            .request(
                Method::GET,
                &format!("/channels/{}/posts?since={}", channel_id, since),
                None,
            )
            .await?;
        let (mut messages, next) = collect_messages(list, cursor, &bot_user_id);
        for message in &mut messages {
            message.author = self.username(&message.author).await;
        }
        Ok((messages, next))
    }

    async fn default_channel(&self) -> Result<String, RelayError> {
        self.channel_id
            .get_or_try_init(|| async move {
                let info: ChannelInfo = self
                    .request(
                        Method::GET,
                        &format!("/teams/name/{}/channels/name/{}", self.team, self.channel),
                        None,
                    )
                    .await?;
                Ok::<_, RelayError>(info.id)
            })
            .await
            .cloned()
    }

    async fn ping(&self) -> Result<String, RelayError> {
        Ok(self.bot_user().await?.username.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn relay_for(server: &MockServer) -> MattermostRelay {
        MattermostRelay::new(MattermostConfig {
            url: server.uri(),
            token: "bot-token".into(),
            team: "eng".into(),
            channel: "claude".into(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    async fn mount_lookups(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/api/v4/users/me"))
            .and(header("authorization", "Bearer bot-token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "bot", "username": "claude-bot"})),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/teams/name/eng/channels/name/claude"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "chan-1"})))
            .mount(server)
            .await;
    }

    #[test]
    fn base_url_gets_scheme_and_loses_trailing_slash() {
        assert_eq!(normalize_base_url("chat.example.com/"), "https://chat.example.com");
        assert_eq!(normalize_base_url("http://localhost:8065"), "http://localhost:8065");
    }

    #[tokio::test]
    async fn replies_are_posted_with_root_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v4/posts"))
            .and(body_partial_json(json!({"channel_id": "chan-1", "root_id": "T1"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "p2", "root_id": "T1", "create_at": 10
            })))
            .mount(&server)
            .await;

        let relay = relay_for(&server);
        let posted = relay
            .post_message(&PostTarget::thread("chan-1", "T1"), "hello")
            .await
            .unwrap();
        assert_eq!(posted.message_id, "p2");
        assert_eq!(posted.thread_id, "T1");
    }

    #[tokio::test]
    async fn poll_skips_own_system_and_older_posts() {
        let server = MockServer::start().await;
        mount_lookups(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/v4/channels/chan-1/posts"))
            .and(query_param("since", "99"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "order": ["a", "b", "c", "d", "e", "f"],
                "posts": {
                    "f": {"id": "f", "root_id": "T1", "user_id": "human", "message": "same ms", "create_at": 100},
                    "a": {"id": "a", "root_id": "T1", "user_id": "human", "message": "approve", "create_at": 120},
                    "b": {"id": "b", "root_id": "T1", "user_id": "bot", "message": "✅ Approved", "create_at": 130},
                    "c": {"id": "c", "root_id": "", "user_id": "human", "message": "joined", "create_at": 140, "type": "system_join_channel"},
                    "d": {"id": "d", "root_id": "T1", "user_id": "human", "message": "edited old", "create_at": 90},
                    "e": {"id": "e", "root_id": "", "user_id": "human", "message": "new root", "create_at": 110}
                }
            })))
            .mount(&server)
            .await;

        let relay = relay_for(&server);
        let (messages, cursor) = relay.poll_since(Cursor(100)).await.unwrap();
        let ids: Vec<_> = messages.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["f", "e", "a"]);
        assert_eq!(messages[1].thread_id, "e");
        assert_eq!(messages[2].thread_id, "T1");
        assert_eq!(cursor, Cursor(140));
        assert_eq!(messages[2].author, "human");
    }

    #[tokio::test]
    async fn poll_resolves_authors_to_usernames() {
        let server = MockServer::start().await;
        mount_lookups(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/v4/channels/chan-1/posts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "order": ["a"],
                "posts": {
                    "a": {"id": "a", "root_id": "T1", "user_id": "u-42", "message": "yes", "create_at": 120}
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/users/u-42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "u-42", "username": "alice"})))
            .expect(1)
            .mount(&server)
            .await;

        let relay = relay_for(&server);
        let (messages, _) = relay.poll_since(Cursor(100)).await.unwrap();
        assert_eq!(messages[0].author, "alice");
        let (messages, _) = relay.poll_since(Cursor(100)).await.unwrap();
        assert_eq!(messages[0].author, "alice");
    }

    #[tokio::test]
    async fn unauthorized_is_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/users/me"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid token"))
            .mount(&server)
            .await;

        let err = relay_for(&server).ping().await.unwrap_err();
        assert!(matches!(err, RelayError::Unauthorized(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn ensure_thread_reuses_existing_root() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/posts/T1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "T1", "root_id": "", "create_at": 5
            })))
            .mount(&server)
            .await;

        let relay = relay_for(&server);
        let thread = relay.ensure_thread("chan-1", "seed", Some("T1")).await.unwrap();
        assert_eq!(thread, "T1");
    }

    #[tokio::test]
    async fn thread_exists_treats_deleted_and_missing_roots_as_gone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/posts/T1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "T1", "root_id": "", "create_at": 5
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/posts/T2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "T2", "root_id": "", "create_at": 5, "delete_at": 9
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/posts/T3"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let relay = relay_for(&server);
        assert!(relay.thread_exists("T1").await.unwrap());
        assert!(!relay.thread_exists("T2").await.unwrap());
        assert!(!relay.thread_exists("T3").await.unwrap());
    }

    #[tokio::test]
    async fn ensure_thread_recreates_deleted_root() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/posts/T1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v4/posts"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "T2", "root_id": "", "create_at": 6
            })))
            .mount(&server)
            .await;

        let relay = relay_for(&server);
        let thread = relay.ensure_thread("chan-1", "seed", Some("T1")).await.unwrap();
        assert_eq!(thread, "T2");
    }
}
