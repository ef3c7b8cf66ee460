//! Per-agent conversation cache.
//!
//! Switching agents snapshots the outgoing conversation and restores the
//! incoming one when its cached key still matches, so switching back does
//! not need a network round trip. The cache is never cleared on reconnect.

use std::collections::HashMap;

use clawlink_core::{ChatMessage, ConversationKey};

/// One cached conversation.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: ConversationKey,
    pub messages: Vec<ChatMessage>,
}

/// Conversation histories keyed by agent id.
#[derive(Debug, Default)]
pub struct ConversationCache {
    entries: HashMap<String, CacheEntry>,
}

impl ConversationCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot a conversation, overwriting any previous entry for the
    /// agent.
    pub fn store(
        &mut self,
        agent_id: impl Into<String>,
        key: ConversationKey,
        messages: Vec<ChatMessage>,
    ) {
        self.entries
            .insert(agent_id.into(), CacheEntry { key, messages });
    }

    /// Restore a conversation if the cached key matches the expected key
    /// and the history is non-empty.
    #[must_use]
    pub fn restore(
        &self,
        agent_id: &str,
        expected_key: &ConversationKey,
    ) -> Option<Vec<ChatMessage>> {
        let entry = self.entries.get(agent_id)?;
        if entry.key == *expected_key && !entry.messages.is_empty() {
            Some(entry.messages.clone())
        } else {
            None
        }
    }

    /// Append a message to an agent's cached history. Creates the entry if
    /// needed, which happens when a stream finishes for an agent that was
    /// never on screen.
    pub fn append(
        &mut self,
        agent_id: impl Into<String>,
        key: &ConversationKey,
        message: ChatMessage,
    ) {
        self.entries
            .entry(agent_id.into())
            .or_insert_with(|| CacheEntry {
                key: key.clone(),
                messages: Vec::new(),
            })
            .messages
            .push(message);
    }

    /// Replace an agent's cached history wholesale (post-reload).
    pub fn replace(
        &mut self,
        agent_id: impl Into<String>,
        key: ConversationKey,
        messages: Vec<ChatMessage>,
    ) {
        self.store(agent_id, key, messages);
    }

    #[must_use]
    pub fn get(&self, agent_id: &str) -> Option<&CacheEntry> {
        self.entries.get(agent_id)
    }
}
