//! Chat message model.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message author role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    #[default]
    Assistant,
    System,
}

/// Message content: either a plain string or an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

/// One part of a mixed-content message. Only `text`-typed parts carry
/// display text; other kinds (tool calls, images) are skipped here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl MessageContent {
    /// Extract display text: the string itself, or the newline-join of the
    /// ordered text-typed parts. `None` when nothing displayable remains.
    #[must_use]
    pub fn display_text(&self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s.clone()),
            Self::Parts(parts) => {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter(|p| p.kind == "text")
                    .filter_map(|p| p.text.as_deref())
                    .collect();
                if texts.is_empty() {
                    None
                } else {
                    Some(texts.join("\n"))
                }
            }
        }
    }
}

/// A single message in a conversation.
///
/// Ordering is insertion order; uniqueness is not enforced, so a local
/// optimistic append and a later server echo may both appear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ChatMessage {
    /// A user message stamped with the current time.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
            timestamp: Some(now_millis()),
        }
    }

    /// An assistant message (no timestamp; the server record carries one).
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            timestamp: None,
        }
    }

    /// A conversation-scoped system notice.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
            timestamp: Some(now_millis()),
        }
    }

    /// Display text of this message's content.
    #[must_use]
    pub fn display_text(&self) -> Option<String> {
        self.content.display_text()
    }
}

/// Extract display text from a raw message value carried by a chat event.
#[must_use]
pub fn extract_text(message: &Value) -> Option<String> {
    let content: MessageContent =
        serde_json::from_value(message.get("content")?.clone()).ok()?;
    content.display_text()
}

/// Response payload of `chat.history`.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryPayload {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
