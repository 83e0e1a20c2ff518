//! Filesystem handoff between the daemon and a blocked hook process.
//!
//! The resolver writes `<dir>/<request_id>.decision` exactly once, through a
//! temp file and a rename, so the hook never observes a partial write. The hook
//! reads the artifact and deletes it. Content `approved` approves; anything
//! else denies.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use claude_mattermost_protocol::Decision;
use tracing::{debug, warn};

const EXTENSION: &str = "decision";

#[derive(Debug, Clone)]
pub struct HandoffChannel {
    dir: PathBuf,
}

impl HandoffChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the artifact for `request_id` appears.
    pub fn path_for(&self, request_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", request_id, EXTENSION))
    }

    /// Atomically publish `decision` for `request_id`.
    pub fn deliver(&self, request_id: &str, decision: Decision) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let final_path = self.path_for(request_id);
        let temp_path = self
            .dir
            .join(format!("{}.{}.tmp.{}", request_id, EXTENSION, std::process::id()));

        let mut file = fs::File::create(&temp_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(decision.as_str().as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &final_path)?;
        debug!(
            component = "handoff",
            event = "handoff.delivered",
            request_id = %request_id,
            decision = decision.as_str(),
            "Decision delivered"
        );
        Ok(final_path)
    }

    /// Read and consume the artifact at `path`. `None` while nothing has
    /// been delivered yet.
    pub fn try_take(&self, path: &Path) -> io::Result<Option<Decision>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(
                    component = "handoff",
                    event = "handoff.remove_failed",
                    path = %path.display(),
                    error = %e,
                    "Failed to remove consumed artifact"
                );
            }
        }
        Ok(Some(Decision::from_artifact(&content)))
    }

    /// Delete the artifact for `request_id` if present.
    pub fn remove(&self, request_id: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(request_id)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Delete artifacts (and abandoned temp files) older than `max_age`.
    /// These belong to hooks that exited without consuming them.
    pub fn remove_stale(&self, max_age: Duration) -> io::Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !(name.ends_with(".decision") || name.contains(".tmp.")) {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age > max_age && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(
                component = "handoff",
                event = "handoff.stale_removed",
                count = removed,
                "Removed stale handoff artifacts"
            );
        }
        Ok(removed)
    }
}
