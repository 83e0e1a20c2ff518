//! Reply classification for thread messages.

/// What a thread reply asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyIntent {
    Approve,
    Deny,
    /// Not a decision: forwarded to the session instead.
    Conversation,
}

const APPROVE_TOKENS: &[&str] = &[
    "approve", "approved", "yes", "y", "ok", "okay", "allow", "lgtm", "✅", "👍",
];

const DENY_TOKENS: &[&str] = &[
    "deny", "denied", "no", "n", "reject", "cancel", "stop", "❌", "👎",
];

/// Split into lowercase words and single-emoji tokens.
fn tokens(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut word = String::new();

    for c in text.chars() {
        if c.is_alphanumeric() {
            word.extend(c.to_lowercase());
            continue;
        }
        if !word.is_empty() {
            out.push(std::mem::take(&mut word));
        }
        if c.is_whitespace() || c.is_ascii_punctuation() || is_emoji_modifier(c) {
            continue;
        }
        out.push(c.to_string());
    }
    if !word.is_empty() {
        out.push(word);
    }
    out
}

/// Variation selectors, skin tones and joiners that trail an emoji.
fn is_emoji_modifier(c: char) -> bool {
    matches!(c, '\u{FE0E}' | '\u{FE0F}' | '\u{200D}' | '\u{1F3FB}'..='\u{1F3FF}')
}

pub fn classify(text: &str) -> ReplyIntent {
    let tokens = tokens(text);
    let approve = tokens.iter().any(|t| APPROVE_TOKENS.contains(&t.as_str()));
    let deny = tokens.iter().any(|t| DENY_TOKENS.contains(&t.as_str()));

    match (approve, deny) {
        (true, false) => ReplyIntent::Approve,
        (false, true) => ReplyIntent::Deny,
        _ => ReplyIntent::Conversation,
    }
}

/// Length of the `#ref` shown in approval prompts
const REF_LEN: usize = 8;

/// Short request id a reply targets with `#abcd1234`, if any. Only the
/// exact prompt shape counts, so `#1234` or `#feature-x` stay plain text.
pub fn request_ref(text: &str) -> Option<String> {
    text.split('#').skip(1).find_map(|rest| {
        let word: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        (word.len() == REF_LEN && word.chars().all(|c| c.is_ascii_hexdigit()))
            .then(|| word.to_ascii_lowercase())
    })
}
