//! `claude-mattermost init`: bootstrap a fresh machine.
//!
//! Creates data dir structure, runs migrations, writes a sample config,
//! and prints the Claude Code hook settings to install.

use std::path::Path;

use crate::config::SAMPLE_CONFIG;
use crate::paths;
use crate::store::Store;

pub fn run(data_dir: &Path) -> anyhow::Result<()> {
    println!();

    // 1. Create directory structure
    paths::ensure_dirs()?;
    println!("  Created {}/", data_dir.display());

    // 2. Run database migrations
    let db_path = paths::db_path();
    Store::open(&db_path)?;
    println!("  Database initialized at {}", db_path.display());

    // 3. Sample config, never overwriting an existing one
    let config_path = paths::config_path();
    if config_path.exists() {
        println!("  Config already present at {}", config_path.display());
    } else {
        std::fs::write(&config_path, SAMPLE_CONFIG)?;
        println!("  Sample config written to {}", config_path.display());
    }

    println!();
    println!("  Next steps:");
    println!("    1. Fill in the [mattermost] section of config.toml (or export MATTERMOST_*)");
    println!("    2. Check the bot credentials:  claude-mattermost test-connection");
    println!("    3. Start the daemon:           claude-mattermost start");
    println!("    4. Add the hooks below to ~/.claude/settings.json");
    println!();
    println!("{}", hook_settings());
    println!();

    Ok(())
}

/// Claude Code `hooks` block routing every event through `hook claude`.
/// The PreToolUse timeout must outlast the approval timeout.
fn hook_settings() -> String {
    let command = "claude-mattermost hook claude";
    let entry = |timeout: u64| {
        serde_json::json!([{
            "hooks": [{ "type": "command", "command": command, "timeout": timeout }]
        }])
    };
    let settings = serde_json::json!({
        "hooks": {
            "SessionStart": entry(30),
            "PreToolUse": entry(330),
            "Notification": entry(30),
            "Stop": entry(30),
            "SessionEnd": entry(30),
            "UserPromptSubmit": entry(10),
        }
    });
    serde_json::to_string_pretty(&settings).unwrap_or_default()
}
