//! Client configuration.

use serde::{Deserialize, Serialize};

/// Configuration for one gateway connection.
///
/// Everything except `url` has a sensible default matching the operator
/// web-chat profile the gateway expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway endpoint, e.g. `wss://gateway.example.ts.net`.
    pub url: String,
    /// Client identifier reported in the handshake.
    pub client_id: String,
    /// Client version reported in the handshake.
    pub client_version: String,
    /// Host platform string.
    pub platform: String,
    /// Connection mode.
    pub mode: String,
    /// Requested role.
    pub role: String,
    /// Requested capability scopes.
    pub scopes: Vec<String>,
    /// Advertised capabilities.
    pub caps: Vec<String>,
    /// User agent string sent with the handshake.
    pub user_agent: String,
    /// BCP 47 locale tag.
    pub locale: String,
}

impl GatewayConfig {
    /// Configuration for the given endpoint with default identity fields.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let version = env!("CARGO_PKG_VERSION").to_string();
        Self {
            url: "wss://localhost".to_string(),
            client_id: "clawlink-console".to_string(),
            client_version: version.clone(),
            platform: std::env::consts::OS.to_string(),
            mode: "webchat".to_string(),
            role: "operator".to_string(),
            scopes: vec![
                "operator.admin".to_string(),
                "operator.approvals".to_string(),
                "operator.pairing".to_string(),
            ],
            caps: Vec::new(),
            user_agent: format!("clawlink/{version}"),
            locale: "en-US".to_string(),
        }
    }
}
