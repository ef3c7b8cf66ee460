//! Client error taxonomy.

use thiserror::Error;

/// Errors surfaced by the gateway client.
///
/// Transport-level failures (`NotConnected`, `Timeout`, `ConnectionLost`)
/// reject the individual request and are otherwise recovered by the
/// reconnect supervisor; they never tear down the process.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A send was attempted while the socket is not open.
    #[error("not connected")]
    NotConnected,
    /// No response arrived within the request timeout.
    #[error("timeout")]
    Timeout,
    /// The transport closed while the request was outstanding.
    #[error("connection lost")]
    ConnectionLost,
    /// The gateway rejected the connect handshake.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    /// The gateway reported an application-level failure for a request.
    #[error("request failed: {0}")]
    RequestFailed(String),
    /// Socket-level failure (dial, TLS, write).
    #[error("transport error: {0}")]
    Transport(String),
    /// Frame serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Reinterpret a failed `connect` request as a handshake rejection,
    /// keeping the server's message when one was carried.
    #[must_use]
    pub fn into_handshake_rejection(self) -> Self {
        match self {
            Self::RequestFailed(msg) | Self::HandshakeRejected(msg) => {
                Self::HandshakeRejected(msg)
            }
            Self::Timeout => Self::HandshakeRejected("handshake timed out".to_string()),
            other => Self::HandshakeRejected(other.to_string()),
        }
    }
}
