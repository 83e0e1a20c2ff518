//! Claude Code hook payloads (JSON on the hook's stdin)

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hook events the bridge reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookEvent {
    SessionStart,
    SessionEnd,
    PreToolUse,
    Notification,
    Stop,
    UserPromptSubmit,
    #[serde(other)]
    Other,
}

/// Payload Claude Code writes to a hook command's stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookPayload {
    pub session_id: String,
    pub hook_event_name: HookEvent,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<Value>,
    /// Notification text
    #[serde(default)]
    pub message: Option<String>,
    /// SessionStart origin: `startup`, `resume`, `clear`, `compact`
    #[serde(default)]
    pub source: Option<String>,
    /// SessionEnd reason
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
}

impl HookPayload {
    /// Command text shown in the approval prompt.
    ///
    /// Bash carries `command`, file tools carry `file_path`; anything else is
    /// shown as compact JSON.
    pub fn command_text(&self) -> String {
        let Some(input) = &self.tool_input else {
            return String::new();
        };
        for key in ["command", "file_path", "url", "pattern"] {
            if let Some(value) = input.get(key).and_then(Value::as_str) {
                return value.to_string();
            }
        }
        input.to_string()
    }

    pub fn description_text(&self) -> String {
        self.tool_input
            .as_ref()
            .and_then(|input| input.get("description"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    /// `claude --resume` re-fires SessionStart for an existing session id.
    pub fn is_resume(&self) -> bool {
        self.source.as_deref() == Some("resume")
    }
}
