use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::paths;

const DEFAULT_FILTER: &str = "info,reqwest=warn,hyper=warn";
const FILTER_ENV: &str = "CLAUDE_MATTERMOST_LOG_FILTER";
const FORMAT_ENV: &str = "CLAUDE_MATTERMOST_LOG_FORMAT";

pub struct LoggingHandle {
    pub run_id: String,
    pub guard: WorkerGuard,
}

/// Which process is logging; each gets its own file under `<data_dir>/logs`.
/// Hooks never log to stdout: Claude Code reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Daemon,
    Hook,
    Admin,
}

impl LogTarget {
    fn file_name(&self) -> &'static str {
        match self {
            LogTarget::Daemon => "daemon.log",
            LogTarget::Hook => "hook.log",
            LogTarget::Admin => "admin.log",
        }
    }
}

pub fn init_logging(target: LogTarget) -> anyhow::Result<LoggingHandle> {
    let log_dir = paths::log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join(target.file_name());

    let filter = std::env::var(FILTER_ENV)
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));

    let file_appender = tracing_appender::rolling::never(&log_dir, target.file_name());
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let format = std::env::var(FORMAT_ENV).unwrap_or_else(|_| "json".into());

    let registry = tracing_subscriber::registry().with(filter);
    if format.eq_ignore_ascii_case("pretty") {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_current_span(true),
            )
            .init();
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let run_id = format!("pid-{}-{}", std::process::id(), now);

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        run_id = %run_id,
        log_path = %log_path.display(),
        format = %format,
        filter = %std::env::var(FILTER_ENV)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_FILTER.to_string()),
    );

    Ok(LoggingHandle { run_id, guard })
}
