//! Chat controller.
//!
//! Consumes the gateway event stream, drives the stream reconciler and the
//! per-agent cache, owns the visible history, and emits [`ChatUpdate`]s
//! for an external renderer. Requests to the gateway (send, history,
//! agent/session/status queries) all go through here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clawlink_core::{
    AgentIdentity, AgentListPayload, AgentRoster, ChatMessage, ClientError, ConversationKey,
    HistoryPayload, SessionListPayload, SessionSummary,
};
use clawlink_gateway::client::{ConnectionState, GatewayClient, GatewayEvent};
use clawlink_gateway::handshake::Hello;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, Notify};
use uuid::Uuid;

use crate::cache::ConversationCache;
use crate::reconciler::{StreamEffect, StreamReconciler};

/// Page size for history and session fetches.
const FETCH_LIMIT: u32 = 50;

/// Clock instants handed to the reconciler. Taken from the tokio clock so
/// the watchdog follows paused test time.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Render instructions for the external UI.
#[derive(Debug, Clone)]
pub enum ChatUpdate {
    /// Replace the whole visible thread.
    Thread(Vec<ChatMessage>),
    /// Append one message to the visible thread.
    Message(ChatMessage),
    /// The in-progress generation draft changed.
    Draft(String),
    /// The in-progress generation ended (flushed message, if any, arrives
    /// as a separate `Message`).
    DraftEnded,
    /// A history fetch is in flight; show a loading placeholder.
    HistoryLoading,
    /// The agent roster (or an identity within it) changed.
    Agents(AgentRoster),
    /// The gateway refused the login credential.
    ConnectionRejected(String),
}

/// Gateway status for display, combined from the handshake snapshot and
/// the status/health/heartbeat queries.
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    pub gateway_version: Option<String>,
    pub uptime_ms: Option<u64>,
    pub agent_count: usize,
    pub status: Option<Value>,
    pub health: Option<Value>,
    pub heartbeat: Option<Value>,
}

/// Message-bearing push events appended to the open conversation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushMessage {
    #[serde(default)]
    session_key: Option<String>,
    #[serde(default)]
    message: Option<ChatMessage>,
}

#[derive(Default)]
struct ChatState {
    roster: AgentRoster,
    selected_agent: Option<String>,
    selected_key: Option<ConversationKey>,
    history: Vec<ChatMessage>,
    cache: ConversationCache,
    reconciler: StreamReconciler,
    hello: Option<Hello>,
}

/// Conversation-level orchestration for one gateway client.
pub struct ChatController {
    client: Arc<GatewayClient>,
    inner: Mutex<ChatState>,
    updates: mpsc::UnboundedSender<ChatUpdate>,
    /// Wakes [`ChatController::run`] when a send arms the stream watchdog.
    stream_armed: Notify,
}

impl ChatController {
    /// Create a controller and the render-update stream it feeds.
    #[must_use]
    pub fn new(client: Arc<GatewayClient>) -> (Arc<Self>, mpsc::UnboundedReceiver<ChatUpdate>) {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                client,
                inner: Mutex::new(ChatState::default()),
                updates: updates_tx,
                stream_armed: Notify::new(),
            }),
            updates_rx,
        )
    }

    /// Process gateway events until the stream ends. Run this in its own
    /// task; user actions (`select_agent`, `send_message`, ...) may be
    /// called concurrently from the UI side.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<GatewayEvent>) {
        loop {
            let deadline = { self.inner.lock().await.reconciler.deadline() };
            let wake = deadline
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event).await;
                }
                // A send can arm the stream from the UI task while this
                // loop is parked; recompute the deadline when it does.
                () = self.stream_armed.notified() => {}
                () = tokio::time::sleep_until(wake), if deadline.is_some() => {
                    let mut state = self.inner.lock().await;
                    if let Some(effect) = state.reconciler.check_watchdog(now()) {
                        self.apply_effects(&mut state, vec![effect]);
                    }
                }
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: GatewayEvent) {
        match event {
            GatewayEvent::Connected(hello) => {
                self.inner.lock().await.hello = Some(hello);
                self.bootstrap().await;
            }
            // Connection state is surfaced through the client's watch
            // channel; pending requests were already rejected.
            GatewayEvent::Disconnected => {}
            GatewayEvent::HandshakeRejected(reason) => {
                let _ = self.updates.send(ChatUpdate::ConnectionRejected(reason));
            }
            GatewayEvent::Chat(payload) => {
                let mut state = self.inner.lock().await;
                let effects = state.reconciler.advance(&payload, now());
                self.apply_effects(&mut state, effects);
            }
            GatewayEvent::StreamDelta(frame) => {
                let mut state = self.inner.lock().await;
                let effects = state.reconciler.advance_legacy(&frame, now());
                self.apply_effects(&mut state, effects);
            }
            GatewayEvent::Push { event, payload } => self.handle_push(&event, payload).await,
        }
    }

    /// After every (re)connect: refetch the roster from scratch, pick the
    /// default agent on first connect, and reload the open conversation.
    /// The cache is deliberately left alone.
    async fn bootstrap(self: &Arc<Self>) {
        self.refresh_agents().await;
        let target = {
            let state = self.inner.lock().await;
            state.selected_agent.clone().zip(state.selected_key.clone())
        };
        if let Some((agent_id, key)) = target {
            self.reload_conversation(agent_id, key).await;
        }
    }

    /// Fetch the agent list, then fan out identity fetches that merge in
    /// as they resolve. Identity failures are ignored.
    pub async fn refresh_agents(self: &Arc<Self>) {
        let payload = match self.client.request("agents.list", json!({})).await {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("agents.list failed: {e}");
                return;
            }
        };
        let list: AgentListPayload = match serde_json::from_value(payload) {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!("malformed agents.list payload: {e}");
                return;
            }
        };

        let (roster, agent_ids, select_default) = {
            let mut state = self.inner.lock().await;
            state.roster.replace(list.agents, list.default_id);
            let ids: Vec<String> = state.roster.agents().iter().map(|a| a.id.clone()).collect();
            let default = if state.selected_agent.is_none() {
                state.roster.default_id().map(str::to_string)
            } else {
                None
            };
            (state.roster.clone(), ids, default)
        };
        let _ = self.updates.send(ChatUpdate::Agents(roster));

        if let Some(agent_id) = select_default {
            self.select_agent(&agent_id).await;
        }
        for agent_id in agent_ids {
            let controller = Arc::clone(self);
            tokio::spawn(async move { controller.fetch_identity(agent_id).await });
        }
    }

    async fn fetch_identity(&self, agent_id: String) {
        let params = json!({"agentId": agent_id});
        let payload = match self.client.request("agent.identity.get", params).await {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!("identity fetch for {agent_id} failed: {e}");
                return;
            }
        };
        match serde_json::from_value::<AgentIdentity>(payload) {
            Ok(identity) => {
                let roster = {
                    let mut state = self.inner.lock().await;
                    state.roster.merge_identity(agent_id.as_str(), identity);
                    state.roster.clone()
                };
                let _ = self.updates.send(ChatUpdate::Agents(roster));
            }
            Err(e) => tracing::debug!("malformed identity payload for {agent_id}: {e}"),
        }
    }

    /// Switch the open conversation to another agent.
    ///
    /// The outgoing conversation is snapshotted into the cache; the
    /// incoming one is restored from cache when its key still matches,
    /// otherwise cleared and refetched. An in-flight generation is not
    /// cancelled - it keeps updating the conversation it is bound to.
    pub async fn select_agent(self: &Arc<Self>, agent_id: &str) {
        let fetch = {
            let mut state = self.inner.lock().await;
            if let (Some(prev_agent), Some(prev_key)) =
                (state.selected_agent.clone(), state.selected_key.clone())
            {
                let history = std::mem::take(&mut state.history);
                state.cache.store(prev_agent, prev_key, history);
            }

            state.selected_agent = Some(agent_id.to_string());
            let derived = ConversationKey::for_agent(agent_id);
            state.selected_key = Some(derived.clone());

            if let Some(messages) = state.cache.restore(agent_id, &derived) {
                state.history = messages.clone();
                let _ = self.updates.send(ChatUpdate::Thread(messages));
                None
            } else {
                state.history.clear();
                let _ = self.updates.send(ChatUpdate::HistoryLoading);
                Some(derived)
            }
        };
        if let Some(key) = fetch {
            self.reload_conversation(agent_id.to_string(), key).await;
        }
    }

    /// Open an existing session from a `sessions.list` entry, adopting its
    /// key (and agent, when named) and fetching its history.
    pub async fn open_session(self: &Arc<Self>, session: &SessionSummary) {
        let (agent_id, key) = {
            let mut state = self.inner.lock().await;
            if let (Some(prev_agent), Some(prev_key)) =
                (state.selected_agent.clone(), state.selected_key.clone())
            {
                let history = std::mem::take(&mut state.history);
                state.cache.store(prev_agent, prev_key, history);
            }
            let key = ConversationKey::new(session.key.clone());
            if let Some(agent) = session.agent_id.clone() {
                state.selected_agent = Some(agent);
            }
            let agent_id = state
                .selected_agent
                .clone()
                .or_else(|| key.agent_id().map(str::to_string))
                .unwrap_or_default();
            state.selected_key = Some(key.clone());
            state.history.clear();
            let _ = self.updates.send(ChatUpdate::HistoryLoading);
            (agent_id, key)
        };
        self.reload_conversation(agent_id, key).await;
    }

    /// Send a chat message to the selected agent.
    ///
    /// The user message is echoed optimistically and the stream reconciler
    /// armed before the request goes out, so deltas that race the ack are
    /// not lost. A failed send is surfaced inline as a system message and
    /// also returned.
    ///
    /// # Errors
    /// `NotConnected` before the handshake completes; request errors from
    /// the gateway otherwise.
    pub async fn send_message(self: &Arc<Self>, text: &str) -> Result<(), ClientError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        if self.client.connection_state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }

        let run_id = format!("cl-{}", Uuid::new_v4().simple());
        let (agent_id, key) = {
            let mut state = self.inner.lock().await;
            let Some(agent_id) = state.selected_agent.clone() else {
                tracing::debug!("send with no agent selected, dropping");
                return Ok(());
            };
            let key = state
                .selected_key
                .clone()
                .unwrap_or_else(|| ConversationKey::for_agent(&agent_id));

            let user_message = ChatMessage::user(trimmed);
            state.history.push(user_message.clone());
            let _ = self.updates.send(ChatUpdate::Message(user_message));

            state
                .reconciler
                .begin(run_id.clone(), agent_id.clone(), key.clone(), now());
            (agent_id, key)
        };
        self.stream_armed.notify_one();

        let params = json!({
            "message": trimmed,
            "deliver": false,
            "idempotencyKey": run_id,
            "sessionKey": key.as_str(),
        });
        match self.client.request("chat.send", params).await {
            Ok(ack) => {
                // The ack may carry a superseding server-assigned key; the
                // actual content arrives via chat events.
                if let Some(raw) = ack.get("sessionKey").and_then(Value::as_str) {
                    let server_key = ConversationKey::new(raw);
                    let mut state = self.inner.lock().await;
                    state.reconciler.adopt_key(&server_key);
                    if state.selected_agent.as_deref() == Some(agent_id.as_str()) {
                        state.selected_key = Some(server_key);
                    }
                }
                Ok(())
            }
            Err(e) => {
                let notice = ChatMessage::system(format!("Error: {e}"));
                {
                    let mut state = self.inner.lock().await;
                    state.reconciler.cancel_run(&run_id);
                    state.history.push(notice.clone());
                }
                let _ = self.updates.send(ChatUpdate::DraftEnded);
                let _ = self.updates.send(ChatUpdate::Message(notice));
                Err(e)
            }
        }
    }

    /// List sessions known to the gateway.
    ///
    /// # Errors
    /// Propagates request failures; the caller renders them in place of
    /// the list.
    pub async fn sessions(&self) -> Result<Vec<SessionSummary>, ClientError> {
        let payload = self
            .client
            .request(
                "sessions.list",
                json!({"includeGlobal": true, "limit": FETCH_LIMIT}),
            )
            .await?;
        let list: SessionListPayload = serde_json::from_value(payload)?;
        Ok(list.sessions)
    }

    /// Combined gateway status for display. Health and heartbeat are
    /// optional extras; their failures are tolerated.
    ///
    /// # Errors
    /// Fails only when the primary `status` query fails.
    pub async fn status(&self) -> Result<StatusSnapshot, ClientError> {
        let (status, health, heartbeat) = tokio::join!(
            self.client.request("status", json!({})),
            self.client.request("health", json!({})),
            self.client.request("last-heartbeat", json!({})),
        );
        let status = status?;
        let state = self.inner.lock().await;
        let hello = state.hello.clone().unwrap_or_default();
        Ok(StatusSnapshot {
            gateway_version: hello.gateway_version().map(str::to_string),
            uptime_ms: hello.uptime_ms(),
            agent_count: state.roster.agents().len(),
            status: Some(status),
            health: health.ok(),
            heartbeat: heartbeat.ok(),
        })
    }

    /// Current visible history (mainly for tests and initial renders).
    pub async fn history(&self) -> Vec<ChatMessage> {
        self.inner.lock().await.history.clone()
    }

    /// Current roster snapshot.
    pub async fn roster(&self) -> AgentRoster {
        self.inner.lock().await.roster.clone()
    }

    /// Currently selected agent id.
    pub async fn selected_agent(&self) -> Option<String> {
        self.inner.lock().await.selected_agent.clone()
    }

    /// Named push events other than `chat`: one carrying a message for the
    /// selected conversation is appended to the visible history, everything
    /// else is discarded.
    async fn handle_push(self: &Arc<Self>, event: &str, payload: Option<Value>) {
        let Some(payload) = payload else { return };
        let push: PushMessage = match serde_json::from_value(payload) {
            Ok(push) => push,
            Err(e) => {
                tracing::debug!(event, "discarding push event: {e}");
                return;
            }
        };
        let (Some(raw_key), Some(message)) = (push.session_key, push.message) else {
            tracing::debug!(event, "discarding push event without a session message");
            return;
        };
        let mut state = self.inner.lock().await;
        if state.selected_key.as_ref().map(ConversationKey::as_str) == Some(raw_key.as_str()) {
            state.history.push(message.clone());
            let _ = self.updates.send(ChatUpdate::Message(message));
        }
    }

    /// Apply reconciler effects. Effects for the on-screen agent render
    /// directly; effects for an off-screen agent land in its cache entry.
    fn apply_effects(self: &Arc<Self>, state: &mut ChatState, effects: Vec<StreamEffect>) {
        for effect in effects {
            match effect {
                StreamEffect::Draft { agent_id, text } => {
                    if state.selected_agent.as_deref() == Some(agent_id.as_str()) {
                        let _ = self.updates.send(ChatUpdate::Draft(text));
                    }
                }
                StreamEffect::KeyAdopted { agent_id, key } => {
                    if state.selected_agent.as_deref() == Some(agent_id.as_str()) {
                        state.selected_key = Some(key);
                    }
                }
                StreamEffect::Completed {
                    agent_id,
                    key,
                    message,
                    reload,
                } => {
                    let on_screen = state.selected_agent.as_deref() == Some(agent_id.as_str());
                    if on_screen {
                        let _ = self.updates.send(ChatUpdate::DraftEnded);
                    }
                    if let Some(message) = message {
                        if on_screen {
                            state.history.push(message.clone());
                            let _ = self.updates.send(ChatUpdate::Message(message));
                        } else {
                            state.cache.append(agent_id.as_str(), &key, message);
                        }
                    }
                    if reload {
                        // The local buffer is provisional; reconcile with
                        // the authoritative server-side record.
                        let controller = Arc::clone(self);
                        tokio::spawn(async move {
                            controller.reload_conversation(agent_id, key).await;
                        });
                    }
                }
                StreamEffect::Failed {
                    agent_id,
                    key,
                    error,
                } => {
                    let notice = ChatMessage::system(format!("Error: {error}"));
                    if state.selected_agent.as_deref() == Some(agent_id.as_str()) {
                        let _ = self.updates.send(ChatUpdate::DraftEnded);
                        state.history.push(notice.clone());
                        let _ = self.updates.send(ChatUpdate::Message(notice));
                    } else {
                        state.cache.append(agent_id.as_str(), &key, notice);
                    }
                }
            }
        }
    }

    async fn reload_conversation(&self, agent_id: String, key: ConversationKey) {
        let params = json!({"sessionKey": key.as_str(), "limit": FETCH_LIMIT});
        let payload = match self.client.request("chat.history", params).await {
            Ok(payload) => payload,
            Err(e) => {
                // The session may not support history; leave what we have.
                tracing::debug!(key = %key, "chat.history failed: {e}");
                return;
            }
        };
        match serde_json::from_value::<HistoryPayload>(payload) {
            Ok(history) => {
                let mut state = self.inner.lock().await;
                if state.selected_agent.as_deref() == Some(agent_id.as_str()) {
                    state.history = history.messages.clone();
                    let _ = self.updates.send(ChatUpdate::Thread(history.messages));
                } else {
                    state.cache.replace(agent_id, key, history.messages);
                }
            }
            Err(e) => tracing::warn!("malformed chat.history payload: {e}"),
        }
    }
}
