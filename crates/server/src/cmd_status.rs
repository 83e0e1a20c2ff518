//! `claude-mattermost status`: is the daemon running, and what is it tracking.

use std::path::Path;

use crate::daemon::{process_alive, read_pid};
use crate::paths;
use crate::registry::SessionFilter;
use crate::store::{format_ms, Store};
use crate::VERSION;

pub fn run(data_dir: &Path) -> anyhow::Result<()> {
    println!();
    println!("  claude-mattermost v{}", VERSION);
    println!("  Data dir: {}", data_dir.display());

    // Check PID file
    let pid_path = paths::pid_file_path();
    let pid_alive = match read_pid(&pid_path) {
        Some(pid) if process_alive(pid) => {
            println!("  PID: {} (running)", pid);
            true
        }
        Some(pid) => {
            println!("  PID file: {} (stale, process not found)", pid);
            false
        }
        None => {
            println!("  PID file: not found");
            false
        }
    };

    // DB size and contents
    let db_path = paths::db_path();
    if db_path.exists() {
        let size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);
        println!("  Database: {} ({} KB)", db_path.display(), size / 1024);

        let store = Store::open(&db_path)?;
        let active = store.sessions().list(&SessionFilter::active())?.len();
        let counts = store.approvals().counts()?;
        println!("  Active sessions: {}", active);
        println!(
            "  Approvals: {} pending, {} approved, {} denied, {} expired",
            counts.pending, counts.approved, counts.denied, counts.expired
        );
        match store.load_cursor()? {
            Some(cursor) => println!("  Poll cursor: {}", format_ms(cursor.0)),
            None => println!("  Poll cursor: not set (daemon never started)"),
        }
    } else {
        println!("  Database: not found (run `claude-mattermost init`)");
    }

    println!();

    if !pid_alive {
        println!("  Daemon is not running.");
        println!("  Start with: claude-mattermost start");
        println!();
    }

    Ok(())
}
