//! Claude Code transcript JSONL reader
//!
//! The `Stop` hook only carries the transcript path; the reply posted to the
//! thread is the text of the last assistant entry.

use std::path::Path;

use serde_json::Value;

/// Longest reply posted to the thread, in characters.
const MAX_REPLY_CHARS: usize = 4000;

/// Text of the last assistant message in the transcript, if any.
pub fn last_assistant_text(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;

    content
        .lines()
        .rev()
        .filter(|l| !l.is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(|json| json.get("type").and_then(|t| t.as_str()) == Some("assistant"))
        .find_map(|json| {
            let text = assistant_text(&json);
            (!text.trim().is_empty()).then_some(text)
        })
        .map(|text| truncate(&text, MAX_REPLY_CHARS))
}

fn assistant_text(entry: &Value) -> String {
    let Some(content) = entry.get("message").and_then(|m| m.get("content")) else {
        return String::new();
    };

    if let Some(text) = content.as_str() {
        return text.to_string();
    }

    content
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|block| {
                    if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                        block.get("text").and_then(|t| t.as_str())
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
