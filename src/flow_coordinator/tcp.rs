//! TCP Connection: per-accepted-flow state machine.

use super::state::{
    buffer_payload, dial_backoff_delay, FlowKey, MAX_DIAL_ATTEMPTS,
};
use crate::config::ConfigSnapshot;
use crate::proxy::ProxyClient;
use smoltcp::iface::SocketHandle;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Dialing,
    Established,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// Event raised by a connection's upstream task back into the stack context.
/// All mutation of `TcpConnection`/the smoltcp socket happens after this
/// event is drained on the stack context — the task itself never touches
/// coordinator state.
#[derive(Debug)]
pub enum UpstreamEvent {
    Dialed(FlowKey),
    DialFailed(FlowKey, String),
    Data(FlowKey, Vec<u8>),
    Eof(FlowKey),
    Broken(FlowKey, String),
}

pub struct TcpConnection {
    pub socket: SocketHandle,
    pub dst_host: String,
    pub dst_port: u16,
    pub snapshot: Arc<ConfigSnapshot>,
    pub state: TcpState,
    /// Tunnel-side bytes buffered until `Established` (bounded, oldest-evicted).
    pub buffered: VecDeque<Vec<u8>>,
    pub buffered_bytes: usize,
    /// Bytes written into the stack's send buffer but not yet TCP-acked.
    pub pending_ack: usize,
    /// Network-side bytes waiting for `socket.can_send()` room (bounded,
    /// oldest-evicted) — distinct from `buffered`, which holds tunnel-side
    /// bytes waiting on the upstream dial.
    pub outbound_backlog: VecDeque<Vec<u8>>,
    pub outbound_backlog_bytes: usize,
    pub remote_fin_seen: bool,
    /// Channel into the connection's upstream task; dropping it signals
    /// the task to close its upstream side and exit.
    pub to_upstream: mpsc::UnboundedSender<Vec<u8>>,
}

impl TcpConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        key: FlowKey,
        socket: SocketHandle,
        dst_host: String,
        dst_port: u16,
        snapshot: Arc<ConfigSnapshot>,
        proxy: Arc<dyn ProxyClient>,
        events: mpsc::UnboundedSender<UpstreamEvent>,
    ) -> Self {
        let (to_upstream_tx, to_upstream_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_upstream(
            key,
            dst_host.clone(),
            dst_port,
            Arc::clone(&snapshot),
            proxy,
            to_upstream_rx,
            events,
        ));
        Self {
            socket,
            dst_host,
            dst_port,
            snapshot,
            state: TcpState::Dialing,
            buffered: VecDeque::new(),
            buffered_bytes: 0,
            pending_ack: 0,
            outbound_backlog: VecDeque::new(),
            outbound_backlog_bytes: 0,
            remote_fin_seen: false,
            to_upstream: to_upstream_tx,
        }
    }

    /// Buffers tunnel-side payload while dialing; flushed once `Established`.
    pub fn buffer_until_established(&mut self, payload: &[u8]) -> bool {
        buffer_payload(&mut self.buffered, &mut self.buffered_bytes, payload)
    }

    pub fn drain_buffered(&mut self) -> VecDeque<Vec<u8>> {
        self.buffered_bytes = 0;
        std::mem::take(&mut self.buffered)
    }

    /// Queues a network-side payload that didn't fit in the stack's send
    /// buffer this tick; retried on the next tick before anything new.
    pub fn queue_outbound(&mut self, payload: Vec<u8>) -> bool {
        buffer_payload(&mut self.outbound_backlog, &mut self.outbound_backlog_bytes, &payload)
    }

    pub fn send_to_upstream(&self, payload: Vec<u8>) -> bool {
        self.to_upstream.send(payload).is_ok()
    }
}

async fn run_upstream(
    key: FlowKey,
    dst_host: String,
    dst_port: u16,
    snapshot: Arc<ConfigSnapshot>,
    proxy: Arc<dyn ProxyClient>,
    mut to_upstream_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<UpstreamEvent>,
) {
    let mut attempt = 0u8;
    let mut stream = loop {
        attempt += 1;
        match proxy.tcp_dial(&dst_host, dst_port, Arc::clone(&snapshot)).await {
            Ok(stream) => break stream,
            Err(err) if attempt < MAX_DIAL_ATTEMPTS => {
                tokio::time::sleep(dial_backoff_delay(attempt)).await;
                continue;
            }
            Err(err) => {
                let _ = events.send(UpstreamEvent::DialFailed(key, err.to_string()));
                return;
            }
        }
    };
    let _ = events.send(UpstreamEvent::Dialed(key));

    loop {
        tokio::select! {
            incoming = to_upstream_rx.recv() => {
                match incoming {
                    Some(payload) => {
                        if let Err(err) = stream.send(&payload).await {
                            let _ = events.send(UpstreamEvent::Broken(key, err.to_string()));
                            return;
                        }
                    }
                    None => {
                        stream.close().await;
                        return;
                    }
                }
            }
            received = stream.recv() => {
                match received {
                    Ok(Some(bytes)) => {
                        let _ = events.send(UpstreamEvent::Data(key, bytes));
                    }
                    Ok(None) => {
                        let _ = events.send(UpstreamEvent::Eof(key));
                        return;
                    }
                    Err(err) => {
                        let _ = events.send(UpstreamEvent::Broken(key, err.to_string()));
                        return;
                    }
                }
            }
        }
    }
}
