//! Chat stream reconciliation.
//!
//! At most one generation is in flight at a time. The reconciler decides,
//! per inbound chat event, whether it belongs to the active run and
//! conversation, merges deltas into a draft buffer, and turns terminal
//! events into effects the controller applies to history. It is a pure
//! state machine: no I/O, no timers of its own, and the clock is passed
//! in by the caller.

use std::time::{Duration, Instant};

use clawlink_core::frame::{ChatEventPayload, ChatStreamState, StreamFrame};
use clawlink_core::message::extract_text;
use clawlink_core::{ChatMessage, ConversationKey};

/// A `Streaming` state with no activity for this long is force-aborted.
/// The run-id filter can drop the final of a superseded run, which would
/// otherwise strand the stream open forever.
pub const STREAM_WATCHDOG: Duration = Duration::from_secs(120);

/// State changes the controller must apply to history/rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEffect {
    /// The draft text changed.
    Draft { agent_id: String, text: String },
    /// A server-assigned key superseded the derived key for this stream.
    KeyAdopted {
        agent_id: String,
        key: ConversationKey,
    },
    /// The stream ended. `message` carries the flushed draft (if any
    /// non-blank text accumulated); `reload` requests the authoritative
    /// history refetch that follows a clean `final`.
    Completed {
        agent_id: String,
        key: ConversationKey,
        message: Option<ChatMessage>,
        reload: bool,
    },
    /// The stream failed; the draft is discarded.
    Failed {
        agent_id: String,
        key: ConversationKey,
        error: String,
    },
}

#[derive(Debug)]
struct ActiveStream {
    run_id: String,
    agent_id: String,
    key: ConversationKey,
    buffer: String,
    last_activity: Instant,
}

impl ActiveStream {
    fn new(run_id: String, agent_id: String, key: ConversationKey, now: Instant) -> Self {
        Self {
            run_id,
            agent_id,
            key,
            buffer: String::new(),
            last_activity: now,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    fn into_completed(self, reload: bool) -> StreamEffect {
        let message = if self.buffer.trim().is_empty() {
            None
        } else {
            Some(ChatMessage::assistant(self.buffer))
        };
        StreamEffect::Completed {
            agent_id: self.agent_id,
            key: self.key,
            message,
            reload,
        }
    }
}

/// The delta/final/error/aborted state machine.
#[derive(Debug, Default)]
pub struct StreamReconciler {
    active: Option<ActiveStream>,
}

impl StreamReconciler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter `Streaming` for a locally issued send. The run id is the
    /// idempotency key of the `chat.send` request.
    pub fn begin(
        &mut self,
        run_id: impl Into<String>,
        agent_id: impl Into<String>,
        key: ConversationKey,
        now: Instant,
    ) {
        let next = ActiveStream::new(run_id.into(), agent_id.into(), key, now);
        if let Some(prev) = self.active.replace(next) {
            tracing::warn!(run_id = %prev.run_id, "superseding still-active stream");
        }
    }

    /// Drop the stream for a failed send without flushing. Only the named
    /// run is cancelled, so a newer send is unaffected.
    pub fn cancel_run(&mut self, run_id: &str) -> bool {
        if self.active.as_ref().is_some_and(|s| s.run_id == run_id) {
            self.active = None;
            true
        } else {
            false
        }
    }

    /// Adopt a server-assigned key from the `chat.send` ack.
    pub fn adopt_key(&mut self, key: &ConversationKey) {
        if let Some(stream) = self.active.as_mut() {
            if stream.key != *key {
                tracing::debug!(%key, "send ack superseded conversation key");
                stream.key = key.clone();
            }
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Agent the active stream is bound to, independent of what is on
    /// screen.
    #[must_use]
    pub fn active_agent(&self) -> Option<&str> {
        self.active.as_ref().map(|s| s.agent_id.as_str())
    }

    #[must_use]
    pub fn active_key(&self) -> Option<&ConversationKey> {
        self.active.as_ref().map(|s| &s.key)
    }

    /// When the watchdog should next be checked.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.active
            .as_ref()
            .map(|s| s.last_activity + STREAM_WATCHDOG)
    }

    /// Force-abort the stream if it has been silent past the watchdog.
    pub fn check_watchdog(&mut self, now: Instant) -> Option<StreamEffect> {
        let expired = self
            .active
            .as_ref()
            .is_some_and(|s| now >= s.last_activity + STREAM_WATCHDOG);
        if !expired {
            return None;
        }
        let stream = self.active.take()?;
        tracing::warn!(run_id = %stream.run_id, "stream watchdog fired, flushing as aborted");
        Some(stream.into_completed(false))
    }

    /// Apply one chat-domain event.
    pub fn advance(&mut self, payload: &ChatEventPayload, now: Instant) -> Vec<StreamEffect> {
        let Some(mut stream) = self.active.take() else {
            tracing::debug!("chat event while idle, ignoring");
            return Vec::new();
        };
        let mut effects = Vec::new();

        // Conversation filter. A key naming the same agent supersedes the
        // locally derived default; anything else is another conversation.
        if let Some(raw) = payload.session_key.as_deref() {
            let event_key = ConversationKey::new(raw);
            if event_key != stream.key {
                if event_key.same_conversation(&stream.key) {
                    stream.key = event_key.clone();
                    effects.push(StreamEffect::KeyAdopted {
                        agent_id: stream.agent_id.clone(),
                        key: event_key,
                    });
                } else {
                    self.active = Some(stream);
                    return effects;
                }
            }
        }

        // Run filter: events from other runs are ignored, stale finals
        // included (the watchdog eventually recovers the stranded state).
        if let Some(run_id) = payload.run_id.as_deref() {
            if run_id != stream.run_id {
                if payload.state == ChatStreamState::Final {
                    tracing::debug!(run_id, "dropping final for a superseded run");
                }
                self.active = Some(stream);
                return effects;
            }
        }

        match payload.state {
            ChatStreamState::Delta => {
                stream.touch(now);
                if let Some(text) = payload.message.as_ref().and_then(extract_text) {
                    // Longest-wins merge: tolerate reordered or duplicated
                    // partials, never shorten the visible text.
                    if text.len() >= stream.buffer.len() && text != stream.buffer {
                        stream.buffer = text;
                        effects.push(StreamEffect::Draft {
                            agent_id: stream.agent_id.clone(),
                            text: stream.buffer.clone(),
                        });
                    }
                }
                self.active = Some(stream);
            }
            ChatStreamState::Final => effects.push(stream.into_completed(true)),
            ChatStreamState::Error => effects.push(StreamEffect::Failed {
                agent_id: stream.agent_id,
                key: stream.key,
                error: payload
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "chat error".to_string()),
            }),
            ChatStreamState::Aborted => effects.push(stream.into_completed(false)),
        }
        effects
    }

    /// Apply one legacy raw stream frame: deltas concatenate, `done` ends
    /// the stream like `final` but without the reconciling reload.
    pub fn advance_legacy(&mut self, frame: &StreamFrame, now: Instant) -> Vec<StreamEffect> {
        let Some(mut stream) = self.active.take() else {
            tracing::debug!("stream frame while idle, ignoring");
            return Vec::new();
        };
        let mut effects = Vec::new();
        if let Some(delta) = frame.delta_text() {
            if !delta.is_empty() {
                stream.buffer.push_str(delta);
                stream.touch(now);
                effects.push(StreamEffect::Draft {
                    agent_id: stream.agent_id.clone(),
                    text: stream.buffer.clone(),
                });
            }
        }
        if frame.is_done() {
            effects.push(stream.into_completed(false));
        } else {
            self.active = Some(stream);
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta(run_id: &str, text: &str) -> ChatEventPayload {
        serde_json::from_value(json!({
            "runId": run_id,
            "state": "delta",
            "message": {"content": text}
        }))
        .unwrap()
    }

    fn terminal(run_id: &str, state: &str) -> ChatEventPayload {
        serde_json::from_value(json!({"runId": run_id, "state": state})).unwrap()
    }

    fn started() -> StreamReconciler {
        let mut reconciler = StreamReconciler::new();
        reconciler.begin("k1", "dev", ConversationKey::for_agent("dev"), Instant::now());
        reconciler
    }

    fn draft_text(effects: &[StreamEffect]) -> Option<&str> {
        effects.iter().find_map(|e| match e {
            StreamEffect::Draft { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }

    #[test]
    fn longest_wins_merge_is_monotonic() {
        let mut reconciler = started();
        let effects = reconciler.advance(&delta("k1", "Hel"), Instant::now());
        assert_eq!(draft_text(&effects), Some("Hel"));
        let effects = reconciler.advance(&delta("k1", "Hello"), Instant::now());
        assert_eq!(draft_text(&effects), Some("Hello"));

        // A shorter (reordered) delta never shrinks the buffer.
        let effects = reconciler.advance(&delta("k1", "Hel"), Instant::now());
        assert!(effects.is_empty());
        let effects = reconciler.advance(&terminal("k1", "final"), Instant::now());
        match &effects[0] {
            StreamEffect::Completed { message, reload, .. } => {
                assert!(*reload);
                assert_eq!(
                    message.as_ref().unwrap().display_text().as_deref(),
                    Some("Hello")
                );
            }
            other => panic!("expected Completed, got {other:?}"),
        }
        assert!(!reconciler.is_active());
    }

    #[test]
    fn final_with_empty_buffer_flushes_nothing() {
        let mut reconciler = started();
        let effects = reconciler.advance(&terminal("k1", "final"), Instant::now());
        match &effects[0] {
            StreamEffect::Completed { message, reload, .. } => {
                assert!(message.is_none());
                assert!(*reload);
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[test]
    fn aborted_preserves_partial_text() {
        let mut reconciler = started();
        reconciler.advance(&delta("k1", "partial answ"), Instant::now());
        let effects = reconciler.advance(&terminal("k1", "aborted"), Instant::now());
        match &effects[0] {
            StreamEffect::Completed { message, reload, .. } => {
                assert!(!*reload);
                assert_eq!(
                    message.as_ref().unwrap().display_text().as_deref(),
                    Some("partial answ")
                );
            }
            other => panic!("expected Completed, got {other:?}"),
        }

        let mut empty = started();
        let effects = empty.advance(&terminal("k1", "aborted"), Instant::now());
        match &effects[0] {
            StreamEffect::Completed { message, .. } => assert!(message.is_none()),
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[test]
    fn error_discards_draft_and_reports() {
        let mut reconciler = started();
        reconciler.advance(&delta("k1", "half an ans"), Instant::now());
        let payload: ChatEventPayload = serde_json::from_value(json!({
            "runId": "k1",
            "state": "error",
            "errorMessage": "model unavailable"
        }))
        .unwrap();
        let effects = reconciler.advance(&payload, Instant::now());
        match &effects[0] {
            StreamEffect::Failed { error, .. } => assert_eq!(error, "model unavailable"),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(!reconciler.is_active());
    }

    #[test]
    fn foreign_conversation_events_are_ignored() {
        let mut reconciler = StreamReconciler::new();
        reconciler.begin("k1", "ops", ConversationKey::new("agent:ops:main"), Instant::now());
        let payload: ChatEventPayload = serde_json::from_value(json!({
            "sessionKey": "agent:dev:main",
            "runId": "k1",
            "state": "delta",
            "message": {"content": "not for us"}
        }))
        .unwrap();
        assert!(reconciler.advance(&payload, Instant::now()).is_empty());
        assert_eq!(
            reconciler.active_key().unwrap().as_str(),
            "agent:ops:main"
        );
        assert_eq!(reconciler.active_agent(), Some("ops"));
    }

    #[test]
    fn server_key_for_same_agent_supersedes() {
        let mut reconciler = started();
        let payload: ChatEventPayload = serde_json::from_value(json!({
            "sessionKey": "agent:dev:webchat",
            "runId": "k1",
            "state": "delta",
            "message": {"content": "Hi"}
        }))
        .unwrap();
        let effects = reconciler.advance(&payload, Instant::now());
        assert!(matches!(&effects[0], StreamEffect::KeyAdopted { key, .. }
            if key.as_str() == "agent:dev:webchat"));
        assert_eq!(draft_text(&effects), Some("Hi"));
    }

    #[test]
    fn foreign_run_events_are_ignored_including_final() {
        let mut reconciler = started();
        reconciler.advance(&delta("k1", "ours"), Instant::now());
        assert!(reconciler.advance(&delta("k2", "other run"), Instant::now()).is_empty());
        assert!(reconciler.advance(&terminal("k2", "final"), Instant::now()).is_empty());
        assert!(reconciler.is_active());
    }

    #[test]
    fn idempotency_key_scenario() {
        // chat.send with idempotencyKey "k1", deltas "Hi"/"Hi there", final.
        let mut reconciler = started();
        reconciler.advance(&delta("k1", "Hi"), Instant::now());
        reconciler.advance(&delta("k1", "Hi there"), Instant::now());
        let effects = reconciler.advance(&terminal("k1", "final"), Instant::now());
        match &effects[0] {
            StreamEffect::Completed { message, .. } => {
                assert_eq!(
                    message.as_ref().unwrap().display_text().as_deref(),
                    Some("Hi there")
                );
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[test]
    fn legacy_frames_concatenate_and_done_finishes_without_reload() {
        let mut reconciler = started();
        let first: StreamFrame = serde_json::from_value(json!({"delta": "Hel"})).unwrap();
        let second: StreamFrame = serde_json::from_value(json!({"delta": "lo"})).unwrap();
        reconciler.advance_legacy(&first, Instant::now());
        let effects = reconciler.advance_legacy(&second, Instant::now());
        assert_eq!(draft_text(&effects), Some("Hello"));

        let done: StreamFrame = serde_json::from_value(json!({"done": true})).unwrap();
        let effects = reconciler.advance_legacy(&done, Instant::now());
        match &effects[0] {
            StreamEffect::Completed { message, reload, .. } => {
                assert!(!*reload);
                assert_eq!(
                    message.as_ref().unwrap().display_text().as_deref(),
                    Some("Hello")
                );
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[test]
    fn events_while_idle_are_dropped() {
        let mut reconciler = StreamReconciler::new();
        assert!(reconciler.advance(&delta("k1", "stray"), Instant::now()).is_empty());
        let frame: StreamFrame = serde_json::from_value(json!({"delta": "stray"})).unwrap();
        assert!(reconciler.advance_legacy(&frame, Instant::now()).is_empty());
    }

    #[test]
    fn watchdog_flushes_a_silent_stream() {
        let mut reconciler = started();
        reconciler.advance(&delta("k1", "stuck partial"), Instant::now());
        assert!(reconciler.check_watchdog(Instant::now()).is_none());

        let effect = reconciler
            .check_watchdog(Instant::now() + STREAM_WATCHDOG)
            .expect("watchdog should fire");
        match effect {
            StreamEffect::Completed { message, reload, .. } => {
                assert!(!reload);
                assert_eq!(message.unwrap().display_text().as_deref(), Some("stuck partial"));
            }
            other => panic!("expected Completed, got {other:?}"),
        }
        assert!(!reconciler.is_active());
        assert!(reconciler.deadline().is_none());
    }

    #[test]
    fn new_send_supersedes_active_stream() {
        let mut reconciler = started();
        reconciler.advance(&delta("k1", "first run"), Instant::now());
        reconciler.begin("k2", "dev", ConversationKey::for_agent("dev"), Instant::now());
        // Old-run traffic no longer lands.
        assert!(reconciler.advance(&delta("k1", "late"), Instant::now()).is_empty());
        let effects = reconciler.advance(&delta("k2", "second run"), Instant::now());
        assert_eq!(draft_text(&effects), Some("second run"));
    }
}
