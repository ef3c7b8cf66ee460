//! Gateway client: event routing, keepalive, reconnect supervision.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clawlink_core::{ChatEventPayload, ClientError, InboundFrame, RequestFrame, ResponseFrame, StreamFrame};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::correlator::{Correlator, REQUEST_TIMEOUT};
use crate::handshake::{ConnectParams, Hello};
use crate::transport::{Connection, Connector, Transport, TransportEvent};

/// Keepalive ping cadence once connected.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
/// Fixed delay before a reconnect attempt. No backoff, no retry cap:
/// reconnection continues indefinitely while a credential is held.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Connection lifecycle state, mutated only by the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Events the client forwards to its consumer.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Handshake succeeded; the hello payload is kept for status display.
    Connected(Hello),
    /// The connection ended; outstanding requests were already rejected.
    Disconnected,
    /// The gateway refused the handshake. The stored credential is kept
    /// for the next attempt.
    HandshakeRejected(String),
    /// Chat-domain event for the stream reconciler.
    Chat(ChatEventPayload),
    /// Any other named push event.
    Push { event: String, payload: Option<Value> },
    /// Legacy raw stream frame.
    StreamDelta(StreamFrame),
}

/// One gateway connection instance.
///
/// Owns the socket, the correlator, and every timer tied to the connection;
/// all of it is reset to a clean initial state on reconnect. Multiple
/// clients can coexist (each with its own connector), which is also what
/// makes the tests hermetic.
pub struct GatewayClient {
    config: GatewayConfig,
    connector: Arc<dyn Connector>,
    correlator: Correlator,
    instance_id: String,
    state_tx: watch::Sender<ConnectionState>,
    credential: Mutex<Option<String>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    events_tx: mpsc::UnboundedSender<GatewayEvent>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    ping_seq: AtomicU64,
}

impl GatewayClient {
    /// Create a client and the event stream its consumer reads.
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let client = Arc::new(Self {
            config,
            connector,
            correlator: Correlator::new(),
            instance_id: format!("console-{}", Uuid::new_v4().simple()),
            state_tx,
            credential: Mutex::new(None),
            transport: Mutex::new(None),
            events_tx,
            supervisor: Mutex::new(None),
            ping_seq: AtomicU64::new(0),
        });
        (client, events_rx)
    }

    /// Watch the connection state for status display.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Store (or clear) the credential used by the handshake. Clearing it
    /// stops future reconnect attempts.
    pub fn set_credential(&self, credential: Option<String>) {
        *self.credential.lock().unwrap() = credential;
    }

    fn credential(&self) -> Option<String> {
        self.credential.lock().unwrap().clone()
    }

    /// Whether a credential is currently held.
    #[must_use]
    pub fn has_credential(&self) -> bool {
        self.credential.lock().unwrap().is_some()
    }

    /// Start the connect/reconnect supervisor. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.supervisor.lock().unwrap();
        if guard.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let client = Arc::clone(self);
        *guard = Some(tokio::spawn(async move { client.run().await }));
    }

    /// Tear the connection down and stop reconnecting.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.supervisor.lock().unwrap().take() {
            handle.abort();
        }
        let transport = self.transport.lock().unwrap().take();
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.correlator.reject_all();
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Issue a correlated request.
    ///
    /// # Errors
    /// Fails with `NotConnected` unless the handshake has completed (no
    /// queueing; callers retry after reconnect), `Timeout` after 30 s
    /// without a response, `ConnectionLost` if the socket closes first, or
    /// `RequestFailed` for a server-reported error.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        if self.connection_state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let transport = self
            .transport
            .lock()
            .unwrap()
            .clone()
            .ok_or(ClientError::NotConnected)?;
        self.call(&transport, method, params).await
    }

    async fn call(
        &self,
        transport: &Arc<dyn Transport>,
        method: &str,
        params: Value,
    ) -> Result<Value, ClientError> {
        let (id, rx) = self.correlator.register();
        let text = serde_json::to_string(&RequestFrame::new(id.clone(), method, params))?;
        if let Err(e) = transport.send(text).await {
            self.correlator.forget(&id);
            return Err(e);
        }
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            // Responder dropped without settling: the correlator is gone.
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => {
                self.correlator.forget(&id);
                Err(ClientError::Timeout)
            }
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.credential().is_none() {
                break;
            }
            self.state_tx.send_replace(ConnectionState::Connecting);
            match self.connector.connect(&self.config.url).await {
                Ok(connection) => self.run_session(connection).await,
                Err(e) => tracing::warn!("gateway dial failed: {e}"),
            }

            *self.transport.lock().unwrap() = None;
            self.state_tx.send_replace(ConnectionState::Disconnected);
            self.correlator.reject_all();
            let _ = self.events_tx.send(GatewayEvent::Disconnected);

            if self.credential().is_none() {
                break;
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    /// Drive one socket from handshake to close.
    async fn run_session(&self, connection: Connection) {
        let Connection {
            transport,
            mut events,
        } = connection;
        *self.transport.lock().unwrap() = Some(Arc::clone(&transport));

        let Some(credential) = self.credential() else {
            transport.close().await;
            return;
        };

        // The handshake is the only request allowed pre-Connected; its
        // response arrives through the same router loop below.
        let params = ConnectParams::build(&self.config, &self.instance_id, &credential);
        let params = match serde_json::to_value(&params) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("failed to encode handshake: {e}");
                transport.close().await;
                return;
            }
        };
        let (handshake_id, handshake_rx) = self.correlator.register();
        let frame = RequestFrame::new(handshake_id.clone(), "connect", params);
        let Ok(text) = serde_json::to_string(&frame) else {
            self.correlator.forget(&handshake_id);
            transport.close().await;
            return;
        };
        if transport.send(text).await.is_err() {
            self.correlator.forget(&handshake_id);
            transport.close().await;
            return;
        }

        let handshake = tokio::time::timeout(REQUEST_TIMEOUT, handshake_rx);
        tokio::pin!(handshake);
        let mut connected = false;

        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + KEEPALIVE_INTERVAL,
            KEEPALIVE_INTERVAL,
        );

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(TransportEvent::Message(text)) => self.route(&text),
                    Some(TransportEvent::Error(reason)) => {
                        tracing::warn!("transport error: {reason}");
                    }
                    Some(TransportEvent::Closed { code }) => {
                        tracing::info!(?code, "gateway socket closed");
                        break;
                    }
                    None => break,
                },
                result = &mut handshake, if !connected => {
                    let outcome = match result {
                        Ok(Ok(outcome)) => outcome,
                        Ok(Err(_)) => break,
                        Err(_) => {
                            self.correlator.forget(&handshake_id);
                            Err(ClientError::Timeout)
                        }
                    };
                    match outcome {
                        Ok(payload) => {
                            let hello: Hello =
                                serde_json::from_value(payload).unwrap_or_default();
                            tracing::info!(
                                version = hello.gateway_version().unwrap_or("unknown"),
                                "gateway handshake complete"
                            );
                            connected = true;
                            self.state_tx.send_replace(ConnectionState::Connected);
                            let _ = self.events_tx.send(GatewayEvent::Connected(hello));
                        }
                        Err(e) => {
                            let rejection = e.into_handshake_rejection();
                            tracing::warn!("{rejection}");
                            if let ClientError::HandshakeRejected(reason) = rejection {
                                let _ = self
                                    .events_tx
                                    .send(GatewayEvent::HandshakeRejected(reason));
                            }
                            break;
                        }
                    }
                },
                _ = keepalive.tick(), if connected => {
                    self.send_keepalive(&transport).await;
                }
            }
        }

        // The keepalive interval dies with this scope, so it can never
        // fire against a stale socket.
        transport.close().await;
    }

    /// Fire-and-forget ping. The id is never registered with the
    /// correlator, so the pong settles as an unmatched response and is
    /// discarded.
    async fn send_keepalive(&self, transport: &Arc<dyn Transport>) {
        let id = format!("ping{}", self.ping_seq.fetch_add(1, Ordering::Relaxed) + 1);
        let frame = RequestFrame::new(id, "ping", serde_json::json!({}));
        if let Ok(text) = serde_json::to_string(&frame) {
            let _ = transport.send(text).await;
        }
    }

    /// Classify one inbound frame and dispatch it.
    fn route(&self, text: &str) {
        let Some(frame) = InboundFrame::parse(text) else {
            return;
        };
        match frame {
            InboundFrame::Res(res) => self.settle_response(&res, false),
            InboundFrame::Err(res) => self.settle_response(&res, true),
            InboundFrame::Event(event) => {
                // Handshake-internal negotiation, never surfaced.
                if event.event == "connect.challenge" {
                    return;
                }
                if event.event == "chat" {
                    let Some(body) = event.body() else {
                        return;
                    };
                    match serde_json::from_value::<ChatEventPayload>(body.clone()) {
                        Ok(payload) => {
                            let _ = self.events_tx.send(GatewayEvent::Chat(payload));
                        }
                        Err(e) => tracing::debug!("dropping malformed chat event: {e}"),
                    }
                    return;
                }
                let _ = self.events_tx.send(GatewayEvent::Push {
                    event: event.event.clone(),
                    payload: event.body().cloned(),
                });
            }
            InboundFrame::Stream(frame) => {
                let _ = self.events_tx.send(GatewayEvent::StreamDelta(frame));
            }
        }
    }

    fn settle_response(&self, res: &ResponseFrame, err_frame: bool) {
        let result = if res.is_failure(err_frame) {
            Err(ClientError::RequestFailed(res.error_message()))
        } else {
            Ok(res.payload())
        };
        if !self.correlator.settle(&res.id, result) {
            tracing::debug!(id = %res.id, "response for unknown request id");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    /// Channel-backed transport handed out by [`FakeConnector`].
    struct FakeTransport {
        outbound: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&self, text: String) -> Result<(), ClientError> {
            self.outbound
                .send(text)
                .map_err(|_| ClientError::NotConnected)
        }

        async fn close(&self) {}
    }

    /// Test-side handle to one fake connection.
    struct FakeSession {
        outbound: mpsc::UnboundedReceiver<String>,
        inject: mpsc::UnboundedSender<TransportEvent>,
    }

    impl FakeSession {
        async fn next_request(&mut self) -> (String, String, Value) {
            let text = self.outbound.recv().await.expect("outbound frame");
            let frame: Value = serde_json::from_str(&text).unwrap();
            (
                frame["id"].as_str().unwrap().to_string(),
                frame["method"].as_str().unwrap().to_string(),
                frame["params"].clone(),
            )
        }

        fn respond(&self, id: &str, payload: Value) {
            let frame = json!({"type": "res", "id": id, "payload": payload});
            self.inject
                .send(TransportEvent::Message(frame.to_string()))
                .unwrap();
        }

        fn reject(&self, id: &str, message: &str) {
            let frame = json!({"type": "err", "id": id, "error": {"message": message}});
            self.inject
                .send(TransportEvent::Message(frame.to_string()))
                .unwrap();
        }

        async fn accept_handshake(&mut self) {
            let (id, method, _) = self.next_request().await;
            assert_eq!(method, "connect");
            self.respond(&id, json!({"protocol": 3}));
        }

        fn close(&self) {
            let _ = self.inject.send(TransportEvent::Closed { code: None });
        }
    }

    struct FakeConnector {
        sessions: Mutex<mpsc::UnboundedSender<FakeSession>>,
    }

    impl FakeConnector {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeSession>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    sessions: Mutex::new(tx),
                }),
                rx,
            )
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, _url: &str) -> Result<Connection, ClientError> {
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inject_tx, inject_rx) = mpsc::unbounded_channel();
            self.sessions
                .lock()
                .unwrap()
                .send(FakeSession {
                    outbound: outbound_rx,
                    inject: inject_tx,
                })
                .map_err(|_| ClientError::Transport("test over".into()))?;
            Ok(Connection {
                transport: Arc::new(FakeTransport {
                    outbound: outbound_tx,
                }),
                events: inject_rx,
            })
        }
    }

    fn test_client() -> (
        Arc<GatewayClient>,
        mpsc::UnboundedReceiver<GatewayEvent>,
        mpsc::UnboundedReceiver<FakeSession>,
    ) {
        let (connector, sessions) = FakeConnector::new();
        let (client, events) = GatewayClient::new(GatewayConfig::new("wss://test"), connector);
        client.set_credential(Some("secret".into()));
        (client, events, sessions)
    }

    async fn connected_client() -> (
        Arc<GatewayClient>,
        mpsc::UnboundedReceiver<GatewayEvent>,
        mpsc::UnboundedReceiver<FakeSession>,
        FakeSession,
    ) {
        let (client, mut events, mut sessions) = test_client();
        client.start();
        let mut session = sessions.recv().await.unwrap();
        session.accept_handshake().await;
        match events.recv().await.unwrap() {
            GatewayEvent::Connected(_) => {}
            other => panic!("expected Connected, got {other:?}"),
        }
        (client, events, sessions, session)
    }

    #[tokio::test]
    async fn handshake_success_transitions_to_connected() {
        let (client, _events, _sessions, session) = connected_client().await;
        assert_eq!(client.connection_state(), ConnectionState::Connected);
        drop(session);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn request_before_connected_is_rejected() {
        let (client, _events, _sessions) = test_client();
        let err = client.request("status", json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn request_round_trip() {
        let (client, _events, _sessions, mut session) = connected_client().await;
        let caller = Arc::clone(&client);
        let pending =
            tokio::spawn(async move { caller.request("agents.list", json!({})).await });
        let (id, method, _) = session.next_request().await;
        assert_eq!(method, "agents.list");
        session.respond(&id, json!({"agents": []}));
        let payload = pending.await.unwrap().unwrap();
        assert_eq!(payload["agents"], json!([]));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn server_error_becomes_request_failed() {
        let (client, _events, _sessions, mut session) = connected_client().await;
        let caller = Arc::clone(&client);
        let pending = tokio::spawn(async move { caller.request("status", json!({})).await });
        let (id, _, _) = session.next_request().await;
        session.reject(&id, "denied");
        let err = pending.await.unwrap().unwrap_err();
        match err {
            ClientError::RequestFailed(msg) => assert_eq!(msg, "denied"),
            other => panic!("expected RequestFailed, got {other:?}"),
        }
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let (client, _events, _sessions, mut session) = connected_client().await;
        let caller = Arc::clone(&client);
        let pending = tokio::spawn(async move { caller.request("status", json!({})).await });
        let _ = session.next_request().await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_rejects_all_outstanding_requests() {
        let (client, _events, _sessions, mut session) = connected_client().await;
        let mut handles = Vec::new();
        for _ in 0..3 {
            let caller = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                caller.request("status", json!({})).await
            }));
        }
        for _ in 0..3 {
            let _ = session.next_request().await;
        }
        session.close();
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, ClientError::ConnectionLost));
        }
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_rejection_surfaces_and_reconnects() {
        let (client, mut events, mut sessions) = test_client();
        client.start();

        let mut session = sessions.recv().await.unwrap();
        let (id, method, params) = session.next_request().await;
        assert_eq!(method, "connect");
        assert_eq!(params["auth"]["password"], "secret");
        session.reject(&id, "bad password");

        let mut saw_rejection = false;
        while let Some(event) = events.recv().await {
            match event {
                GatewayEvent::HandshakeRejected(msg) => {
                    assert_eq!(msg, "bad password");
                    saw_rejection = true;
                }
                GatewayEvent::Disconnected if saw_rejection => break,
                _ => {}
            }
        }
        assert!(saw_rejection);
        // Credential is retained and a fresh attempt follows the fixed delay.
        assert!(client.has_credential());
        let mut retry = sessions.recv().await.unwrap();
        let (_, method, _) = retry.next_request().await;
        assert_eq!(method, "connect");
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_are_fire_and_forget() {
        let (client, _events, _sessions, mut session) = connected_client().await;
        let (id, method, _) = session.next_request().await;
        assert_eq!(method, "ping");
        assert!(id.starts_with("ping"));
        // Its pong settles as an unmatched response: a no-op.
        session.respond(&id, json!({}));
        let (_, method, _) = session.next_request().await;
        assert_eq!(method, "ping");
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_runs_a_fresh_handshake() {
        let (client, mut events, mut sessions, session) = connected_client().await;
        session.close();
        loop {
            match events.recv().await.unwrap() {
                GatewayEvent::Disconnected => break,
                _ => {}
            }
        }
        let mut second = sessions.recv().await.unwrap();
        second.accept_handshake().await;
        loop {
            match events.recv().await.unwrap() {
                GatewayEvent::Connected(_) => break,
                _ => {}
            }
        }
        assert_eq!(client.connection_state(), ConnectionState::Connected);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn events_are_routed_by_kind() {
        let (client, mut events, _sessions, session) = connected_client().await;

        // Handshake-internal event is swallowed.
        session
            .inject
            .send(TransportEvent::Message(
                json!({"type": "event", "event": "connect.challenge", "payload": {}}).to_string(),
            ))
            .unwrap();
        // Chat event reaches the consumer parsed.
        session
            .inject
            .send(TransportEvent::Message(
                json!({
                    "type": "event",
                    "event": "chat",
                    "payload": {"state": "delta", "runId": "r1", "message": {"content": "Hi"}}
                })
                .to_string(),
            ))
            .unwrap();
        match events.recv().await.unwrap() {
            GatewayEvent::Chat(payload) => {
                assert_eq!(payload.run_id.as_deref(), Some("r1"));
            }
            other => panic!("expected Chat, got {other:?}"),
        }

        // Named push event is forwarded with its body.
        session
            .inject
            .send(TransportEvent::Message(
                json!({"type": "event", "event": "session.message", "payload": {"x": 1}}).to_string(),
            ))
            .unwrap();
        match events.recv().await.unwrap() {
            GatewayEvent::Push { event, payload } => {
                assert_eq!(event, "session.message");
                assert_eq!(payload.unwrap()["x"], 1);
            }
            other => panic!("expected Push, got {other:?}"),
        }

        // Malformed frames are dropped without a crash.
        session
            .inject
            .send(TransportEvent::Message("{broken".to_string()))
            .unwrap();
        session
            .inject
            .send(TransportEvent::Message(
                json!({"type": "stream", "delta": "abc"}).to_string(),
            ))
            .unwrap();
        match events.recv().await.unwrap() {
            GatewayEvent::StreamDelta(frame) => {
                assert_eq!(frame.delta_text(), Some("abc"));
            }
            other => panic!("expected StreamDelta, got {other:?}"),
        }
        client.shutdown().await;
    }
}
