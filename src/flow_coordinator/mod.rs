//! Flow Coordinator: the single serialization context that owns the Stack
//! Engine (smoltcp `Interface` + `SocketSet`) and every TCP Connection /
//! UDP Flow admitted onto it.
//!
//! Every method here runs on one caller — in `TunnelEngine` that caller is
//! a single-worker-thread tokio task driven by a fixed-interval ticker, so
//! two calls into a `FlowCoordinator` never race. Per-flow upstream I/O
//! happens on separately spawned tasks (`tcp::run_upstream`,
//! `udp::run_upstream`); they talk back only through the two event
//! channels drained here, so the stack context itself is never blocked on
//! network I/O (invariant 1).

mod interface;
pub mod state;
mod tcp;
mod udp;

#[cfg(test)]
mod tests;

use crate::config::ConfigSnapshot;
use crate::device::{parse_packet, ParsedPacket, TcpPacket, TunDevice, TunHandle, UdpPacket};
use crate::ffi::{FlowCounters, FlowStats};
use crate::logger::{self, BreadcrumbFlags};
use crate::mux::{ForwardingMuxManager, MuxManager};
use crate::packet_builder::build_udp_response;
use crate::proxy::ProxyClient;
use smoltcp::iface::{Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, State as TcpSocketState};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{IpAddress, IpListenEndpoint};
use state::{FlowKey, MAX_UDP_FLOWS, UDP_IDLE_TIMEOUT};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tcp::{TcpConnection, TcpState, UpstreamEvent};
use tokio::sync::mpsc;
use tokio::time::Instant as TokioInstant;
use udp::{UdpEvent, UdpFlow};

pub struct FlowCoordinator {
    running: bool,
    ipv6_enabled: bool,
    configuration: Arc<ConfigSnapshot>,
    proxy: Arc<dyn ProxyClient>,
    mux_manager: Option<Arc<dyn MuxManager>>,

    device: TunDevice,
    device_handle: TunHandle,
    interface: Interface,
    sockets: SocketSet<'static>,
    tcp_pool: Vec<SocketHandle>,
    _udp_socket_pool: Vec<SocketHandle>,

    tcp_connections: HashMap<FlowKey, TcpConnection>,
    udp_flows: HashMap<FlowKey, UdpFlow>,

    tcp_events_tx: mpsc::UnboundedSender<UpstreamEvent>,
    tcp_events_rx: mpsc::UnboundedReceiver<UpstreamEvent>,
    udp_events_tx: mpsc::UnboundedSender<UdpEvent>,
    udp_events_rx: mpsc::UnboundedReceiver<UdpEvent>,

    counters: FlowCounters,
    stats: FlowStats,
}

impl FlowCoordinator {
    /// Builds the Stack Engine over `device` and starts serving traffic
    /// under `configuration`. There is no separate "new then start": a
    /// `FlowCoordinator` is only ever constructed already running.
    pub fn start(
        device: TunDevice,
        configuration: Arc<ConfigSnapshot>,
        ipv6_enabled: bool,
        proxy: Arc<dyn ProxyClient>,
    ) -> Self {
        let device_handle = device.handle();
        let mut device_for_stack = device;
        let (interface, sockets, tcp_pool, udp_pool) =
            interface::build_interface_and_sockets(&mut device_for_stack);
        let mux_manager = mux_for(&configuration, &proxy);
        let (tcp_events_tx, tcp_events_rx) = mpsc::unbounded_channel();
        let (udp_events_tx, udp_events_rx) = mpsc::unbounded_channel();

        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            format!(
                "flow coordinator started (ipv6_enabled={}, mux={})",
                ipv6_enabled,
                mux_manager.is_some()
            ),
        );

        Self {
            running: true,
            ipv6_enabled,
            configuration,
            proxy,
            mux_manager,
            device: device_for_stack,
            device_handle,
            interface,
            sockets,
            tcp_pool,
            _udp_socket_pool: udp_pool,
            tcp_connections: HashMap::new(),
            udp_flows: HashMap::new(),
            tcp_events_tx,
            tcp_events_rx,
            udp_events_tx,
            udp_events_rx,
            counters: FlowCounters::default(),
            stats: FlowStats::default(),
        }
    }

    /// The Packet Port handle for the read/write context. Cloning is
    /// cheap; every clone shares the same ring.
    pub fn handle(&self) -> TunHandle {
        self.device_handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn counters(&self) -> FlowCounters {
        self.counters
    }

    pub fn stats(&self) -> FlowStats {
        self.stats
    }

    pub fn tcp_connection_count(&self) -> usize {
        self.tcp_connections.len()
    }

    pub fn udp_flow_count(&self) -> usize {
        self.udp_flows.len()
    }

    /// Stopping twice is a no-op (invariant — matches `TunnelEngineStop`
    /// idempotency). The mux teardown is fire-and-forget: nothing downstream
    /// of this call depends on it having finished.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.clear_tcp_connections();
        self.udp_flows.clear();
        if let Some(mux) = self.mux_manager.take() {
            tokio::spawn(async move { mux.close_all().await });
        }
        logger::breadcrumb(BreadcrumbFlags::FLOW, "flow coordinator stopped".to_string());
    }

    /// Reconfigures in place: tears down every Connection/Flow (they carry
    /// an `Arc<ConfigSnapshot>` that must never outlive the snapshot it was
    /// dialed under) and rebuilds the Mux Manager, but keeps the existing
    /// Packet Port and Stack Engine — no interface rebuild, no dropped
    /// in-flight TCP handshake bookkeeping.
    pub async fn switch_configuration(
        &mut self,
        configuration: Arc<ConfigSnapshot>,
        ipv6_enabled: Option<bool>,
    ) {
        self.clear_tcp_connections();
        self.udp_flows.clear();
        if let Some(mux) = self.mux_manager.take() {
            mux.close_all().await;
        }
        if let Some(enabled) = ipv6_enabled {
            self.ipv6_enabled = enabled;
        }
        self.mux_manager = mux_for(&configuration, &self.proxy);
        self.configuration = configuration;
        self.running = true;
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            "flow coordinator reconfigured, all flows reset".to_string(),
        );
    }

    /// Classifies an inbound frame and admits/routes it, then always also
    /// hands it to the Stack Engine so smoltcp's own handshake/ICMPv6
    /// machinery still progresses regardless of the classification path.
    pub fn handle_inbound_packet(&mut self, raw: &[u8]) {
        if !self.running {
            return;
        }
        match parse_packet(raw) {
            Some(ParsedPacket::Tcp(tcp)) => self.admit_tcp(&tcp),
            Some(ParsedPacket::Udp(udp)) => self.route_udp(&udp),
            _ => {}
        }
        self.device_handle.push_inbound(raw);
    }

    fn admit_tcp(&mut self, packet: &TcpPacket<'_>) {
        let key = FlowKey {
            src_ip: packet.src,
            src_port: packet.src_port,
            dst_ip: packet.dst,
            dst_port: packet.dst_port,
        };
        if self.tcp_connections.contains_key(&key) {
            return;
        }
        if !packet.flags.syn || packet.flags.ack {
            return;
        }
        if key.is_ipv6() && !self.ipv6_enabled {
            logger::breadcrumb(
                BreadcrumbFlags::FLOW,
                format!("tcp {} rejected: ipv6 disabled", key.to_string_key()),
            );
            return;
        }
        let Some(socket_handle) = self.tcp_pool.pop() else {
            self.counters.tcp_admission_fail += 1;
            logger::warn("tcp admission failed: pool exhausted");
            return;
        };
        {
            let socket = self.sockets.get_mut::<TcpSocket>(socket_handle);
            let endpoint = IpListenEndpoint {
                addr: Some(to_smoltcp_addr(key.dst_ip)),
                port: key.dst_port,
            };
            let _ = socket.listen(endpoint);
        }
        let dst_host = state::format_ip(key.dst_ip);
        let connection = TcpConnection::spawn(
            key,
            socket_handle,
            dst_host,
            key.dst_port,
            Arc::clone(&self.configuration),
            Arc::clone(&self.proxy),
            self.tcp_events_tx.clone(),
        );
        self.tcp_connections.insert(key, connection);
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            format!("tcp {} admitted", key.to_string_key()),
        );
    }

    fn route_udp(&mut self, packet: &UdpPacket<'_>) {
        let key = FlowKey {
            src_ip: packet.src,
            src_port: packet.src_port,
            dst_ip: packet.dst,
            dst_port: packet.dst_port,
        };
        if let Some(flow) = self.udp_flows.get_mut(&key) {
            flow.touch();
            flow.send_to_upstream(packet.payload.to_vec());
            return;
        }
        if key.is_ipv6() && !self.ipv6_enabled {
            logger::breadcrumb(
                BreadcrumbFlags::FLOW,
                format!("udp {} rejected: ipv6 disabled", key.to_string_key()),
            );
            return;
        }
        if self.udp_flows.len() >= MAX_UDP_FLOWS {
            self.counters.udp_admission_fail += 1;
            logger::warn("udp admission failed: flow table full");
            return;
        }
        let flow = UdpFlow::open(
            key,
            Arc::clone(&self.configuration),
            Arc::clone(&self.proxy),
            self.mux_manager.clone(),
            self.udp_events_tx.clone(),
        );
        flow.send_to_upstream(packet.payload.to_vec());
        self.udp_flows.insert(key, flow);
        self.stats.udp_flows_active = self.udp_flows.len() as u64;
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            format!("udp {} admitted", key.to_string_key()),
        );
    }

    /// One Stack Engine tick: progress smoltcp, drain both event channels,
    /// then pump bytes between the stack's TCP sockets and each
    /// connection's upstream channel.
    pub fn tick(&mut self, now: SmolInstant) {
        if !self.running {
            return;
        }
        self.interface.poll(now, &mut self.device, &mut self.sockets);
        self.stats.poll_iterations = self.stats.poll_iterations.saturating_add(1);

        self.drain_tcp_events();
        self.pump_tcp_sockets();
        self.drain_udp_events();

        let frames = self.device_handle.drain_outbound();
        if !frames.is_empty() {
            let bytes: u64 = frames.iter().map(|frame| frame.len() as u64).sum();
            self.stats.frames_emitted = self.stats.frames_emitted.saturating_add(frames.len() as u64);
            self.stats.bytes_emitted = self.stats.bytes_emitted.saturating_add(bytes);
            for frame in frames {
                self.device_handle.push_outbound(frame);
            }
        }
    }

    /// Removes any UDP Flow that has been silent past `UDP_IDLE_TIMEOUT`.
    /// Driven by a slower-cadence timer than `tick` in the embedding host
    /// (see `state::UDP_REAP_TICK`), but idempotent to call every tick too.
    pub fn reap_idle_udp(&mut self, now: TokioInstant) {
        let expired: Vec<FlowKey> = self
            .udp_flows
            .iter()
            .filter(|(_, flow)| flow.is_idle(now, UDP_IDLE_TIMEOUT))
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            self.udp_flows.remove(key);
            logger::breadcrumb(
                BreadcrumbFlags::FLOW,
                format!("udp {} reaped: idle", key.to_string_key()),
            );
        }
        if !expired.is_empty() {
            self.stats.udp_flows_active = self.udp_flows.len() as u64;
        }
    }

    fn drain_tcp_events(&mut self) {
        while let Ok(event) = self.tcp_events_rx.try_recv() {
            match event {
                UpstreamEvent::Dialed(key) => self.on_tcp_dialed(key),
                UpstreamEvent::DialFailed(key, reason) => self.on_tcp_terminal(key, &reason),
                UpstreamEvent::Data(key, bytes) => self.on_tcp_upstream_data(key, bytes),
                UpstreamEvent::Eof(key) => self.on_tcp_upstream_eof(key),
                UpstreamEvent::Broken(key, reason) => self.on_tcp_terminal(key, &reason),
            }
        }
    }

    fn on_tcp_dialed(&mut self, key: FlowKey) {
        let Some(connection) = self.tcp_connections.get_mut(&key) else {
            return;
        };
        connection.state = TcpState::Established;
        for payload in connection.drain_buffered() {
            connection.send_to_upstream(payload);
        }
        self.stats.tcp_flush_events = self.stats.tcp_flush_events.saturating_add(1);
    }

    fn on_tcp_terminal(&mut self, key: FlowKey, reason: &str) {
        if let Some(connection) = self.tcp_connections.remove(&key) {
            self.reclaim_tcp_socket(connection.socket);
            logger::breadcrumb(
                BreadcrumbFlags::FLOW,
                format!("tcp {} closed: {reason}", key.to_string_key()),
            );
        }
    }

    /// Aborts the PCB so the tunnel-side peer observes the close, then
    /// returns the handle to the pool so a future `admit_tcp` can reuse it.
    fn reclaim_tcp_socket(&mut self, socket: SocketHandle) {
        self.sockets.get_mut::<TcpSocket>(socket).abort();
        self.tcp_pool.push(socket);
    }

    /// Tears down every live TCP connection, reclaiming each PCB the same
    /// way `on_tcp_terminal` does — used by `stop`/`switch_configuration`
    /// so a reconfigure (or shutdown) never leaks sockets out of `tcp_pool`.
    fn clear_tcp_connections(&mut self) {
        let connections: Vec<TcpConnection> =
            self.tcp_connections.drain().map(|(_, connection)| connection).collect();
        for connection in connections {
            self.reclaim_tcp_socket(connection.socket);
        }
    }

    fn on_tcp_upstream_data(&mut self, key: FlowKey, bytes: Vec<u8>) {
        let Some(connection) = self.tcp_connections.get_mut(&key) else {
            return;
        };
        if !connection.queue_outbound(bytes) {
            self.counters.tcp_backpressure_drops += 1;
        }
    }

    fn on_tcp_upstream_eof(&mut self, key: FlowKey) {
        if let Some(connection) = self.tcp_connections.get_mut(&key) {
            connection.state = TcpState::HalfClosedLocal;
            let socket = self.sockets.get_mut::<TcpSocket>(connection.socket);
            socket.close();
        }
    }

    /// Scans every admitted TCP socket once per tick: forwards bytes the
    /// stack received toward the upstream task, and flushes any bytes the
    /// upstream task handed us that didn't fit in the send buffer yet.
    fn pump_tcp_sockets(&mut self) {
        let keys: Vec<FlowKey> = self.tcp_connections.keys().copied().collect();
        let mut to_close: Vec<(FlowKey, &'static str)> = Vec::new();

        for key in keys {
            let socket_handle = self.tcp_connections[&key].socket;
            let socket = self.sockets.get_mut::<TcpSocket>(socket_handle);

            if socket.state() == TcpSocketState::Closed {
                to_close.push((key, "tcp_closed"));
                continue;
            }

            while socket.can_recv() {
                let payload = match socket.recv(|buf| (buf.len(), buf.to_vec())) {
                    Ok(bytes) => bytes,
                    Err(_) => break,
                };
                if payload.is_empty() {
                    break;
                }
                let connection = self.tcp_connections.get_mut(&key).expect("connection present");
                match connection.state {
                    TcpState::Established | TcpState::HalfClosedRemote => {
                        connection.send_to_upstream(payload);
                    }
                    _ => {
                        connection.buffer_until_established(&payload);
                    }
                }
            }

            if !socket.may_recv() {
                let connection = self.tcp_connections.get_mut(&key).expect("connection present");
                if !connection.remote_fin_seen {
                    connection.remote_fin_seen = true;
                    if connection.state == TcpState::Established {
                        connection.state = TcpState::HalfClosedRemote;
                    }
                    logger::breadcrumb(
                        BreadcrumbFlags::FLOW,
                        format!("tcp {} remote fin", key.to_string_key()),
                    );
                }
            }

            let connection = self.tcp_connections.get_mut(&key).expect("connection present");
            while let Some(payload) = connection.outbound_backlog.pop_front() {
                if !socket.can_send() {
                    connection.outbound_backlog.push_front(payload);
                    break;
                }
                match socket.send_slice(&payload) {
                    Ok(written) if written == payload.len() => {
                        connection.pending_ack = connection.pending_ack.saturating_add(written);
                        connection.outbound_backlog_bytes =
                            connection.outbound_backlog_bytes.saturating_sub(payload.len());
                    }
                    Ok(written) => {
                        connection.pending_ack = connection.pending_ack.saturating_add(written);
                        connection.outbound_backlog_bytes =
                            connection.outbound_backlog_bytes.saturating_sub(written);
                        connection.outbound_backlog.push_front(payload[written..].to_vec());
                        break;
                    }
                    Err(_) => {
                        connection.outbound_backlog.push_front(payload);
                        break;
                    }
                }
            }

            // `send_queue()` is exactly the bytes handed to the socket that
            // the peer hasn't acked yet, so it doubles as our `pending_ack`
            // without a separate running tally.
            let send_queue_len = socket.send_queue();
            self.tcp_connections.get_mut(&key).expect("connection present").pending_ack = send_queue_len;
        }

        for (key, reason) in to_close {
            self.on_tcp_terminal(key, reason);
        }
    }

    fn drain_udp_events(&mut self) {
        while let Ok(event) = self.udp_events_rx.try_recv() {
            match event {
                UdpEvent::Reply { key, payload } => {
                    if let Some(frame) =
                        build_udp_response(key.dst_ip, key.dst_port, key.src_ip, key.src_port, &payload)
                    {
                        self.device_handle.push_outbound(frame);
                        self.stats.udp_flush_events = self.stats.udp_flush_events.saturating_add(1);
                    }
                    if let Some(flow) = self.udp_flows.get_mut(&key) {
                        flow.touch();
                    }
                }
                UdpEvent::OpenFailed { key, reason } => {
                    self.udp_flows.remove(&key);
                    self.counters.udp_admission_fail += 1;
                    logger::breadcrumb(
                        BreadcrumbFlags::FLOW,
                        format!("udp {} open failed: {reason}", key.to_string_key()),
                    );
                }
            }
        }
        self.stats.udp_flows_active = self.udp_flows.len() as u64;
    }
}

fn mux_for(
    configuration: &Arc<ConfigSnapshot>,
    proxy: &Arc<dyn ProxyClient>,
) -> Option<Arc<dyn MuxManager>> {
    if configuration.wants_mux() {
        Some(Arc::new(ForwardingMuxManager::new(
            Arc::clone(proxy),
            Arc::clone(configuration),
        )))
    } else {
        None
    }
}

fn to_smoltcp_addr(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            IpAddress::Ipv4(smoltcp::wire::Ipv4Address::new(a, b, c, d))
        }
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            let mut groups = [0u16; 8];
            for (i, group) in groups.iter_mut().enumerate() {
                *group = u16::from_be_bytes([octets[i * 2], octets[i * 2 + 1]]);
            }
            IpAddress::Ipv6(smoltcp::wire::Ipv6Address::new(
                groups[0], groups[1], groups[2], groups[3], groups[4], groups[5], groups[6],
                groups[7],
            ))
        }
    }
}
