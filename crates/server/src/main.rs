//! claude-mattermost
//!
//! Approve Claude Code tool calls and keep sessions going from a Mattermost
//! thread. One long-running daemon polls the channel; short-lived hook
//! processes share its SQLite store and data directory.

mod approvals;
mod broker;
mod cmd_admin;
mod cmd_hook;
mod cmd_init;
mod cmd_status;
mod config;
mod coordinator;
mod daemon;
mod error;
mod handoff;
mod hook_client;
mod inbox;
mod logging;
mod migration_runner;
mod paths;
mod registry;
mod reply;
mod store;
mod transcript;

use std::time::Duration;

use clap::{Parser, Subcommand};
use claude_mattermost_protocol::SessionStatus;
use claude_mattermost_relay::MattermostRelay;
use tracing::info;

use crate::broker::Broker;
use crate::cmd_hook::HookCommand;
use crate::config::{ConfigArgs, Settings};
use crate::coordinator::Coordinator;
use crate::daemon::{Daemon, PidFile};
use crate::handoff::HandoffChannel;
use crate::inbox::Inbox;
use crate::logging::{init_logging, LogTarget};
use crate::store::Store;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "claude-mattermost")]
#[command(version, about = "Approve Claude Code tool calls from Mattermost", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon that polls Mattermost and resolves approvals
    Start,

    /// Create the data directory, database and a sample config
    Init,

    /// Show daemon, database and approval status
    Status,

    /// List sessions
    List {
        /// Include ended and timed out sessions
        #[arg(long)]
        all: bool,

        /// Only sessions with this status (active, ended, timed_out)
        #[arg(long)]
        status: Option<SessionStatus>,
    },

    /// End a session and expire its pending approvals
    End {
        /// Session id or unique prefix
        session_id: String,
    },

    /// Check the Mattermost credentials and channel
    TestConnection,

    /// Delete sessions inactive for longer than the retention window
    Cleanup {
        /// Retention window in days (overrides configuration)
        #[arg(long)]
        days: Option<u64>,
    },

    /// Claude Code hook entry points
    #[command(subcommand)]
    Hook(HookCommand),
}

impl Command {
    fn log_target(&self) -> LogTarget {
        match self {
            Command::Start => LogTarget::Daemon,
            Command::Hook(_) => LogTarget::Hook,
            _ => LogTarget::Admin,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match Settings::load(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("claude-mattermost: {}", e);
            if let Command::Hook(hook) = &cli.command {
                std::process::exit(cmd_hook::config_failure_code(hook));
            }
            std::process::exit(1);
        }
    };

    let logging = init_logging(cli.command.log_target())?;
    info!(
        component = "main",
        event = "main.starting",
        run_id = %logging.run_id,
        version = VERSION,
        data_dir = %settings.data_dir.display(),
        "claude-mattermost starting"
    );

    match cli.command {
        Command::Start => run_daemon(&settings).await?,
        Command::Init => cmd_init::run(&settings.data_dir)?,
        Command::Status => cmd_status::run(&settings.data_dir)?,
        Command::List { all, status } => {
            let store = Store::open(&paths::db_path())?;
            cmd_admin::list(&store, all, status)?;
        }
        Command::End { session_id } => {
            paths::ensure_dirs()?;
            let store = Store::open(&paths::db_path())?;
            let relay = MattermostRelay::new(settings.mattermost_config()?)?;
            let handoff = HandoffChannel::new(paths::responses_dir());
            let coordinator = Coordinator::new(&store, &relay, &handoff, settings.backoff());
            cmd_admin::end(&coordinator, &store, &session_id).await?;
        }
        Command::TestConnection => {
            let config = settings.mattermost_config()?;
            println!("Testing connection to {}...", config.url);
            let relay = MattermostRelay::new(config)?;
            cmd_admin::test_connection(&relay).await?;
        }
        Command::Cleanup { days } => {
            let store = Store::open(&paths::db_path())?;
            let inbox = Inbox::new(paths::inbox_dir());
            let retention = days
                .map(|d| Duration::from_secs(d * 24 * 3600))
                .unwrap_or(settings.retention);
            cmd_admin::cleanup(&store, &inbox, retention)?;
        }
        Command::Hook(hook) => {
            let code = cmd_hook::run(hook, &settings).await;
            // process::exit skips destructors; flush the log writer first.
            drop(logging);
            std::process::exit(code);
        }
    }

    Ok(())
}

async fn run_daemon(settings: &Settings) -> anyhow::Result<()> {
    paths::ensure_dirs()?;
    let _pid = PidFile::acquire(&paths::pid_file_path())?;

    let store = Store::open(&paths::db_path())?;
    let relay = MattermostRelay::new(settings.mattermost_config()?)?;
    let handoff = HandoffChannel::new(paths::responses_dir());
    let inbox = Inbox::new(paths::inbox_dir());
    let broker = Broker::new(&store, &relay, &handoff, settings.approval_policy());

    let mut daemon = Daemon::new(
        &store,
        &relay,
        &handoff,
        &inbox,
        broker,
        settings.daemon_settings(),
    );
    let recovery = daemon.recover()?;
    println!(
        "claude-mattermost v{} watching Mattermost ({} active session(s), {} pending approval(s))",
        VERSION, recovery.active_sessions, recovery.pending_approvals
    );

    daemon.run(shutdown_signal()).await?;
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    info!(
        component = "main",
        event = "main.shutdown_signal",
        "Shutdown signal received"
    );
}
