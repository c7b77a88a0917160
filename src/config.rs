//! Configuration snapshot: the immutable record describing the upstream
//! VLESS endpoint, deserialized off the inter-process control channel.


use serde::Deserialize;

/// VLESS flow mode. Determines whether a Mux Manager is eligible at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Flow {
    #[serde(rename = "")]
    Plain,
    #[serde(rename = "xtls-rprx-vision")]
    Vision,
    #[serde(rename = "xtls-rprx-vision-udp443")]
    VisionUdp443,
}

impl Flow {
    pub fn is_vision(self) -> bool {
        matches!(self, Flow::Vision | Flow::VisionUdp443)
    }
}

impl Default for Flow {
    fn default() -> Self {
        Flow::Plain
    }
}

/// Outer transport used to carry the VLESS stream. Internals (TLS/REALITY/
/// WebSocket/HTTP-Upgrade/XHTTP settings) are out of scope for this crate
/// and are kept as an opaque JSON bag on [`ConfigSnapshot::transport_settings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Tls,
    Reality,
    Ws,
    HttpUpgrade,
    Xhttp,
}

impl Default for TransportKind {
    fn default() -> Self {
        TransportKind::Tcp
    }
}

/// Immutable configuration handed to flows at creation time. A reconfigure
/// replaces the `Arc<ConfigSnapshot>` held by the coordinator; already-born
/// flows keep the snapshot they started with (invariant 5).
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(rename = "serverAddress")]
    pub server_address: String,
    #[serde(rename = "serverPort")]
    pub server_port: u16,
    pub uuid: String,
    #[serde(default)]
    pub encryption: String,
    #[serde(default)]
    pub flow: Flow,
    #[serde(default)]
    pub security: TransportKind,
    #[serde(rename = "muxEnabled", default)]
    pub mux_enabled: bool,
    #[serde(rename = "xudpEnabled", default)]
    pub xudp_enabled: bool,
    #[serde(rename = "resolvedIP", default)]
    pub resolved_ip: Option<String>,
    /// Transport-specific fields (TLS/REALITY/WebSocket/HTTP-Upgrade/XHTTP),
    /// treated as opaque and handed unmodified to the proxy client.
    #[serde(flatten)]
    pub transport_settings: serde_json::Value,
}

impl ConfigSnapshot {
    /// A Mux Manager is eligible iff the flow mode selects Vision and mux is enabled.
    pub fn wants_mux(&self) -> bool {
        self.flow.is_vision() && self.mux_enabled
    }

    pub fn parse(payload: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(payload).map_err(ConfigError::Malformed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed configuration snapshot: {0}")]
    Malformed(#[source] serde_json::Error),
}
