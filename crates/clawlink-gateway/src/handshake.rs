//! The `connect` handshake.
//!
//! Exactly one `connect` request is issued per socket, before any other
//! traffic. It negotiates the protocol version, identifies the client, and
//! submits the stored credential. The returned hello payload is kept for
//! later status display.

use serde::{Deserialize, Serialize};

use crate::config::GatewayConfig;

/// Supported protocol range.
pub const PROTOCOL_MIN: u32 = 3;
pub const PROTOCOL_MAX: u32 = 3;

/// Parameters of the `connect` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    pub auth: AuthParams,
    pub user_agent: String,
    pub locale: String,
}

/// Client identity block.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthParams {
    pub password: String,
}

impl ConnectParams {
    /// Build handshake parameters from the client configuration.
    #[must_use]
    pub fn build(config: &GatewayConfig, instance_id: &str, credential: &str) -> Self {
        Self {
            min_protocol: PROTOCOL_MIN,
            max_protocol: PROTOCOL_MAX,
            client: ClientInfo {
                id: config.client_id.clone(),
                version: config.client_version.clone(),
                platform: config.platform.clone(),
                mode: config.mode.clone(),
                instance_id: instance_id.to_string(),
            },
            role: config.role.clone(),
            scopes: config.scopes.clone(),
            caps: config.caps.clone(),
            auth: AuthParams {
                password: credential.to_string(),
            },
            user_agent: config.user_agent.clone(),
            locale: config.locale.clone(),
        }
    }
}

/// Hello payload returned by a successful handshake.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    #[serde(default)]
    pub protocol: Option<u32>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub snapshot: Option<Snapshot>,
}

/// Presence/version/uptime snapshot carried by the hello.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub presence: Vec<PresenceEntry>,
    #[serde(default)]
    pub uptime_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl Hello {
    /// Gateway version, resolved from the gateway presence entry first and
    /// the top-level hello version second.
    #[must_use]
    pub fn gateway_version(&self) -> Option<&str> {
        self.snapshot
            .as_ref()
            .and_then(|s| {
                s.presence
                    .iter()
                    .find(|p| p.mode.as_deref() == Some("gateway"))
            })
            .and_then(|p| p.version.as_deref())
            .or(self.version.as_deref())
    }

    /// Gateway uptime in milliseconds, when reported.
    #[must_use]
    pub fn uptime_ms(&self) -> Option<u64> {
        self.snapshot.as_ref().and_then(|s| s.uptime_ms)
    }
}
