//! Proxy client boundary: the external collaborator that actually speaks
//! VLESS (optionally wrapped in TLS/REALITY/WebSocket/XHTTP, optionally
//! multiplexed). The wire protocol itself is out of scope for this crate;
//! only this narrow async trait seam is implemented here.

#[cfg(test)]
pub mod fake;
#[cfg(test)]
mod tests;

use crate::config::ConfigSnapshot;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("upstream dial to {host}:{port} failed: {reason}")]
    Failed { host: String, port: u16, reason: String },
    #[error("upstream dial to {host}:{port} timed out")]
    TimedOut { host: String, port: u16 },
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("upstream stream broke: {0}")]
    Broken(String),
}

/// One established upstream TCP byte-stream.
#[async_trait]
pub trait TcpStream: Send + Sync {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), StreamError>;

    /// `Ok(None)` signals clean EOF from upstream.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, StreamError>;

    async fn close(&mut self);
}

/// One established upstream UDP path, direct or mux-backed.
#[async_trait]
pub trait UdpDatagram: Send + Sync {
    async fn send(&mut self, dst_host: &str, dst_port: u16, bytes: &[u8]) -> Result<(), StreamError>;

    async fn recv(&mut self) -> Result<(String, u16, Vec<u8>), StreamError>;

    async fn close(&mut self);
}

/// The narrow interface the Flow Coordinator dials through. Implemented
/// externally to this crate (VLESS/TLS/REALITY/WebSocket/XHTTP/mux framing
/// live on the other side of this trait).
#[async_trait]
pub trait ProxyClient: Send + Sync {
    async fn tcp_dial(
        &self,
        host: &str,
        port: u16,
        snapshot: Arc<ConfigSnapshot>,
    ) -> Result<Box<dyn TcpStream>, DialError>;

    async fn udp_open(
        &self,
        snapshot: Arc<ConfigSnapshot>,
    ) -> Result<Box<dyn UdpDatagram>, DialError>;
}
