//! UDP Flow: per-5-tuple state.

use super::state::FlowKey;
use crate::config::ConfigSnapshot;
use crate::mux::MuxManager;
use crate::proxy::{ProxyClient, UdpDatagram};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

/// Event raised by a flow's upstream task back into the stack context.
#[derive(Debug)]
pub enum UdpEvent {
    /// An upstream reply, ready to be wrapped and injected as an IP packet.
    Reply { key: FlowKey, payload: Vec<u8> },
    /// The upstream path could not be opened at all; the coordinator
    /// removes the flow immediately instead of waiting out the idle timer.
    OpenFailed { key: FlowKey, reason: String },
}

pub struct UdpFlow {
    pub key: FlowKey,
    pub is_ipv6: bool,
    pub snapshot: Arc<ConfigSnapshot>,
    pub last_activity: Instant,
    to_upstream: mpsc::UnboundedSender<Vec<u8>>,
}

impl UdpFlow {
    /// Spawns the upstream task immediately; the dial itself happens inside
    /// that task so this never blocks the stack context. Sends queued
    /// before the dial resolves simply wait in the channel buffer.
    pub fn open(
        key: FlowKey,
        snapshot: Arc<ConfigSnapshot>,
        proxy: Arc<dyn ProxyClient>,
        mux: Option<Arc<dyn MuxManager>>,
        events: mpsc::UnboundedSender<UdpEvent>,
    ) -> Self {
        let (to_upstream_tx, to_upstream_rx) = mpsc::unbounded_channel();
        let dst_host = super::state::format_ip(key.dst_ip);
        let dst_port = key.dst_port;
        tokio::spawn(run_upstream(
            key,
            dst_host,
            dst_port,
            Arc::clone(&snapshot),
            proxy,
            mux,
            to_upstream_rx,
            events,
        ));
        Self {
            is_ipv6: key.is_ipv6(),
            key,
            snapshot,
            last_activity: Instant::now(),
            to_upstream: to_upstream_tx,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }

    pub fn send_to_upstream(&self, payload: Vec<u8>) -> bool {
        self.to_upstream.send(payload).is_ok()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_upstream(
    key: FlowKey,
    dst_host: String,
    dst_port: u16,
    snapshot: Arc<ConfigSnapshot>,
    proxy: Arc<dyn ProxyClient>,
    mux: Option<Arc<dyn MuxManager>>,
    mut to_upstream_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<UdpEvent>,
) {
    let opened = match mux {
        Some(mux) => mux.open_udp(&dst_host, dst_port).await,
        None => proxy.udp_open(snapshot).await,
    };
    let mut datagram = match opened {
        Ok(datagram) => datagram,
        Err(err) => {
            let _ = events.send(UdpEvent::OpenFailed {
                key,
                reason: err.to_string(),
            });
            return;
        }
    };

    loop {
        tokio::select! {
            outgoing = to_upstream_rx.recv() => {
                match outgoing {
                    Some(payload) => {
                        if datagram.send(&dst_host, dst_port, &payload).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        datagram.close().await;
                        return;
                    }
                }
            }
            received = datagram.recv() => {
                match received {
                    Ok((_src_host, _src_port, payload)) => {
                        if events.send(UdpEvent::Reply { key, payload }).is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        }
    }
}
