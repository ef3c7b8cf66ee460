//! Connection engine for the clawlink gateway client.
//!
//! One long-lived WebSocket to the gateway, wrapped in:
//! - `Transport`/`Connector` - the thin socket boundary (fake-able in tests)
//! - `Correlator` - request/response matching with per-request timeouts
//! - the `connect` handshake and keepalive
//! - `GatewayClient` - event routing plus the reconnect supervisor

pub mod client;
pub mod config;
pub mod correlator;
pub mod credentials;
pub mod handshake;
pub mod transport;

pub use client::{ConnectionState, GatewayClient, GatewayEvent, KEEPALIVE_INTERVAL, RECONNECT_DELAY};
pub use config::GatewayConfig;
pub use correlator::{Correlator, REQUEST_TIMEOUT};
pub use credentials::{CredentialError, CredentialStore};
pub use handshake::Hello;
pub use transport::{Connection, Connector, Transport, TransportEvent, WsConnector};
