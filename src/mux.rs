//! Mux Manager: optional multiplexer for UDP Flows in Vision mode.
//!
//! No production multiplexing logic lives in this core — session
//! placement and sub-stream framing are out of scope — so this module
//! exposes a small `Send + Sync` trait with one fallible entry point
//! plus a reference forwarding implementation.

#[cfg(test)]
mod tests;

use crate::config::ConfigSnapshot;
use crate::proxy::{DialError, ProxyClient, UdpDatagram};
use async_trait::async_trait;
use std::sync::Arc;

/// Created by the Flow Coordinator iff `snapshot.wants_mux()`. Internals
/// (session placement, sub-stream framing) are out of scope; this crate
/// only needs `open_udp`/`close_all` to exist.
#[async_trait]
pub trait MuxManager: Send + Sync {
    async fn open_udp(
        &self,
        dst_host: &str,
        dst_port: u16,
    ) -> Result<Box<dyn UdpDatagram>, DialError>;

    async fn close_all(&self);
}

/// Reference implementation: forwards every `open_udp` straight to the
/// underlying proxy client's `udp_open`, with no sub-stream multiplexing.
pub struct ForwardingMuxManager {
    proxy: Arc<dyn ProxyClient>,
    snapshot: Arc<ConfigSnapshot>,
}

impl ForwardingMuxManager {
    pub fn new(proxy: Arc<dyn ProxyClient>, snapshot: Arc<ConfigSnapshot>) -> Self {
        Self { proxy, snapshot }
    }
}

#[async_trait]
impl MuxManager for ForwardingMuxManager {
    async fn open_udp(
        &self,
        _dst_host: &str,
        _dst_port: u16,
    ) -> Result<Box<dyn UdpDatagram>, DialError> {
        self.proxy.udp_open(Arc::clone(&self.snapshot)).await
    }

    async fn close_all(&self) {}
}
