//! Central path resolution for all bridge data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `CLAUDE_MATTERMOST_DATA_DIR` env
//! > `~/.claude/claude-mattermost`. The daemon and every hook process must agree on
//! this directory: it holds the database, the handoff artifacts and the inboxes.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub const DATA_DIR_ENV: &str = "CLAUDE_MATTERMOST_DATA_DIR";

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
///
/// Priority: `explicit` arg > `CLAUDE_MATTERMOST_DATA_DIR` env > `~/.claude/claude-mattermost`.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Ok(env_val) = std::env::var(DATA_DIR_ENV) {
        PathBuf::from(env_val)
    } else {
        default_data_dir()
    };

    let mut guard = DATA_DIR.write().expect("DATA_DIR lock poisoned");
    *guard = Some(dir.clone());
    dir
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".claude")
        .join("claude-mattermost")
}

/// Return the current data directory. Panics if `init_data_dir` hasn't been called.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .expect("DATA_DIR lock poisoned")
        .clone()
        .expect("data_dir() called before init_data_dir()")
}

pub fn db_path() -> PathBuf {
    data_dir().join("sessions.db")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Handoff artifacts: `<request_id>.decision`
pub fn responses_dir() -> PathBuf {
    data_dir().join("responses")
}

/// Forwarded thread messages: `<session_id>.jsonl`
pub fn inbox_dir() -> PathBuf {
    data_dir().join("inbox")
}

pub fn pid_file_path() -> PathBuf {
    data_dir().join("daemon.pid")
}

pub fn config_path() -> PathBuf {
    data_dir().join("config.toml")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    std::fs::create_dir_all(base.join("responses"))?;
    std::fs::create_dir_all(base.join("inbox"))?;
    Ok(())
}

/// Reset data dir, for test isolation only.
#[cfg(test)]
pub fn reset_data_dir() {
    let mut guard = DATA_DIR.write().expect("DATA_DIR lock poisoned");
    *guard = None;
}
