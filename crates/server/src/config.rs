//! Layered configuration.
//!
//! Priority: command-line flags > environment (clap `env`) >
//! `<data_dir>/config.toml` > built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use claude_mattermost_relay::{Backoff, MattermostConfig};
use serde::Deserialize;

use crate::broker::ApprovalPolicy;
use crate::daemon::DaemonSettings;
use crate::error::{CoreError, CoreResult};
use crate::hook_client::WaitSettings;
use crate::paths;

const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 300;
const DEFAULT_SESSION_TIMEOUT_HOURS: u64 = 24;
const DEFAULT_RETENTION_DAYS: u64 = 30;
const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
const DEFAULT_HOOK_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_APPROVAL_SWEEP_SECS: u64 = 5;
const DEFAULT_SESSION_SWEEP_SECS: u64 = 3600;
const DEFAULT_RELAY_ATTEMPTS: u32 = 3;
const RELAY_BASE_DELAY: Duration = Duration::from_millis(500);
const RELAY_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Flags shared by every subcommand
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Data directory (database, handoff artifacts, logs)
    #[arg(long, global = true, env = paths::DATA_DIR_ENV)]
    pub data_dir: Option<PathBuf>,

    /// Mattermost server URL
    #[arg(long, global = true, env = "MATTERMOST_URL")]
    pub mattermost_url: Option<String>,

    /// Bot access token
    #[arg(long, global = true, env = "MATTERMOST_BOT_TOKEN", hide_env_values = true)]
    pub mattermost_token: Option<String>,

    /// Team name the channel belongs to
    #[arg(long, global = true, env = "MATTERMOST_TEAM_NAME")]
    pub mattermost_team: Option<String>,

    /// Channel new session threads are started in
    #[arg(long, global = true, env = "MATTERMOST_CHANNEL_NAME")]
    pub mattermost_channel: Option<String>,

    /// Usernames allowed to approve or deny (comma separated; empty = anyone)
    #[arg(long, global = true, env = "MATTERMOST_ALLOWED_USERS", value_delimiter = ',')]
    pub allowed_users: Vec<String>,

    /// Seconds an approval waits for a reply
    #[arg(long, global = true, env = "APPROVAL_TIMEOUT_SECS")]
    pub approval_timeout_secs: Option<u64>,

    /// Idle hours before an active session is timed out
    #[arg(long, global = true, env = "SESSION_TIMEOUT_HOURS")]
    pub session_timeout_hours: Option<u64>,

    /// Days of history kept by `cleanup`
    #[arg(long, global = true, env = "RETENTION_DAYS")]
    pub retention_days: Option<u64>,

    /// Daemon poll interval in milliseconds
    #[arg(long, global = true, env = "POLL_INTERVAL_MS")]
    pub poll_interval_ms: Option<u64>,

    /// Hook artifact poll interval in milliseconds
    #[arg(long, global = true, env = "HOOK_POLL_INTERVAL_MS")]
    pub hook_poll_interval_ms: Option<u64>,
}

/// `config.toml`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub mattermost: FileMattermost,
    pub approval_timeout_secs: Option<u64>,
    pub session_timeout_hours: Option<u64>,
    pub retention_days: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub hook_poll_interval_ms: Option<u64>,
    pub approval_sweep_secs: Option<u64>,
    pub session_sweep_secs: Option<u64>,
    pub relay_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileMattermost {
    pub url: Option<String>,
    pub token: Option<String>,
    pub team: Option<String>,
    pub channel: Option<String>,
    pub allowed_users: Vec<String>,
}

impl FileConfig {
    /// Read `path`; a missing file is an empty config.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&raw)
            .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MattermostSettings {
    pub url: Option<String>,
    pub token: Option<String>,
    pub team: Option<String>,
    pub channel: Option<String>,
    pub allowed_users: Vec<String>,
}

/// Fully resolved configuration
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub mattermost: MattermostSettings,
    pub approval_timeout: Duration,
    pub session_timeout: Duration,
    pub retention: Duration,
    pub poll_interval: Duration,
    pub hook_poll_interval: Duration,
    pub approval_sweep_interval: Duration,
    pub session_sweep_interval: Duration,
    pub relay_attempts: u32,
}

impl Settings {
    /// Resolve the data dir, read its `config.toml`, and merge the layers.
    pub fn load(args: &ConfigArgs) -> CoreResult<Self> {
        let data_dir = paths::init_data_dir(args.data_dir.as_deref());
        let file = FileConfig::load(&paths::config_path())?;
        Ok(Self::from_layers(args, file, data_dir))
    }

    pub fn from_layers(args: &ConfigArgs, file: FileConfig, data_dir: PathBuf) -> Self {
        let secs = Duration::from_secs;
        let millis = Duration::from_millis;

        let allowed_users = if args.allowed_users.is_empty() {
            file.mattermost.allowed_users
        } else {
            args.allowed_users.clone()
        };

        Self {
            data_dir,
            mattermost: MattermostSettings {
                url: args.mattermost_url.clone().or(file.mattermost.url),
                token: args.mattermost_token.clone().or(file.mattermost.token),
                team: args.mattermost_team.clone().or(file.mattermost.team),
                channel: args.mattermost_channel.clone().or(file.mattermost.channel),
                allowed_users: allowed_users
                    .into_iter()
                    .map(|u| u.trim().to_string())
                    .filter(|u| !u.is_empty())
                    .collect(),
            },
            approval_timeout: secs(
                args.approval_timeout_secs
                    .or(file.approval_timeout_secs)
                    .unwrap_or(DEFAULT_APPROVAL_TIMEOUT_SECS),
            ),
            session_timeout: secs(
                args.session_timeout_hours
                    .or(file.session_timeout_hours)
                    .unwrap_or(DEFAULT_SESSION_TIMEOUT_HOURS)
                    * 3600,
            ),
            retention: secs(
                args.retention_days
                    .or(file.retention_days)
                    .unwrap_or(DEFAULT_RETENTION_DAYS)
                    * 24
                    * 3600,
            ),
            poll_interval: millis(
                args.poll_interval_ms
                    .or(file.poll_interval_ms)
                    .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            hook_poll_interval: millis(
                args.hook_poll_interval_ms
                    .or(file.hook_poll_interval_ms)
                    .unwrap_or(DEFAULT_HOOK_POLL_INTERVAL_MS),
            ),
            approval_sweep_interval: secs(
                file.approval_sweep_secs
                    .unwrap_or(DEFAULT_APPROVAL_SWEEP_SECS),
            ),
            session_sweep_interval: secs(
                file.session_sweep_secs
                    .unwrap_or(DEFAULT_SESSION_SWEEP_SECS),
            ),
            relay_attempts: file
                .relay_attempts
                .unwrap_or(DEFAULT_RELAY_ATTEMPTS)
                .max(1),
        }
    }

    /// Relay connection settings. Names every missing key.
    pub fn mattermost_config(&self) -> CoreResult<MattermostConfig> {
        let mm = &self.mattermost;
        let present = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);

        let url = present(&mm.url);
        let token = present(&mm.token);
        let team = present(&mm.team);
        let channel = present(&mm.channel);

        let mut missing = Vec::new();
        if url.is_none() {
            missing.push("mattermost.url (MATTERMOST_URL)");
        }
        if token.is_none() {
            missing.push("mattermost.token (MATTERMOST_BOT_TOKEN)");
        }
        if team.is_none() {
            missing.push("mattermost.team (MATTERMOST_TEAM_NAME)");
        }
        if channel.is_none() {
            missing.push("mattermost.channel (MATTERMOST_CHANNEL_NAME)");
        }

        match (url, token, team, channel) {
            (Some(url), Some(token), Some(team), Some(channel)) => Ok(MattermostConfig {
                url,
                token,
                team,
                channel,
                request_timeout: RELAY_REQUEST_TIMEOUT,
            }),
            _ => Err(CoreError::Config(format!(
                "missing Mattermost settings: {}",
                missing.join(", ")
            ))),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            attempts: self.relay_attempts,
            base_delay: RELAY_BASE_DELAY,
        }
    }

    pub fn approval_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy {
            timeout: self.approval_timeout,
            backoff: self.backoff(),
            allowed_users: self.mattermost.allowed_users.clone(),
        }
    }

    pub fn daemon_settings(&self) -> DaemonSettings {
        DaemonSettings {
            poll_interval: self.poll_interval,
            approval_sweep_interval: self.approval_sweep_interval,
            session_sweep_interval: self.session_sweep_interval,
            session_timeout: self.session_timeout,
            stale_artifact_age: self.approval_timeout + Duration::from_secs(300),
            ..DaemonSettings::default()
        }
    }

    pub fn wait_settings(&self) -> WaitSettings {
        WaitSettings {
            poll_interval: self.hook_poll_interval,
            ..WaitSettings::default()
        }
    }
}

/// Commented template written by `init`.
pub const SAMPLE_CONFIG: &str = r#"# claude-mattermost configuration
# Environment variables and command-line flags override these values.

[mattermost]
# url = "https://chat.example.com"        # MATTERMOST_URL
# token = "bot-access-token"              # MATTERMOST_BOT_TOKEN
# team = "engineering"                    # MATTERMOST_TEAM_NAME
# channel = "claude-code"                 # MATTERMOST_CHANNEL_NAME
# allowed_users = ["alice", "bob"]        # MATTERMOST_ALLOWED_USERS (empty = anyone)

# approval_timeout_secs = 300
# session_timeout_hours = 24
# retention_days = 30
# poll_interval_ms = 2000
# hook_poll_interval_ms = 500
# approval_sweep_secs = 5
# session_sweep_secs = 3600
# relay_attempts = 3
"#;
