//! Conversation keys and session summaries.

use serde::{Deserialize, Serialize};

/// String identifying a logical chat session on the gateway.
///
/// Keys for an agent are derived as `agent:<id>:main`; the gateway remains
/// authoritative and may supersede the derived key in a `chat.send` ack,
/// which [`ConversationKey::same_conversation`] accounts for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    /// Wrap a raw gateway-issued key.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Derive the default key for an agent. Deterministic: the same agent
    /// id yields the same key, stable across reconnects.
    #[must_use]
    pub fn for_agent(agent_id: &str) -> Self {
        Self(format!("agent:{agent_id}:main"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The agent id embedded in an `agent:<id>:<channel>` key, if any.
    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        let rest = self.0.strip_prefix("agent:")?;
        let (id, channel) = rest.rsplit_once(':')?;
        if id.is_empty() || channel.is_empty() {
            return None;
        }
        Some(id)
    }

    /// Whether two keys name the same logical conversation.
    ///
    /// Equal keys always match; otherwise keys that resolve to the same
    /// agent id are considered equivalent, so a server-assigned key can
    /// supersede the locally derived default for that agent.
    #[must_use]
    pub fn same_conversation(&self, other: &Self) -> bool {
        if self == other {
            return true;
        }
        match (self.agent_id(), other.agent_id()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of a `sessions.list` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub key: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub last_active_at: Option<i64>,
    #[serde(default)]
    message_count: Option<u64>,
    #[serde(default)]
    turns: Option<u64>,
}

impl SessionSummary {
    /// Display label, falling back to the raw key.
    #[must_use]
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.key)
    }

    /// Message count; older gateways report it as `turns`.
    #[must_use]
    pub const fn message_count(&self) -> Option<u64> {
        match self.message_count {
            Some(n) => Some(n),
            None => self.turns,
        }
    }
}

/// Response payload of `sessions.list`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionListPayload {
    #[serde(default)]
    pub sessions: Vec<SessionSummary>,
}
