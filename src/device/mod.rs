//! Packet Port: the bidirectional pipe over the host's tunnel facility.
//!
//! `TunDevice` is the smoltcp [`Device`] consumed only from the stack
//! context; `TunHandle` is the independent handle used by the write
//! context / FFI boundary to push inbound frames or drain outbound ones
//! without ever touching smoltcp state directly.


use parking_lot::Mutex;
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::sync::Notify;

pub const DEFAULT_MTU: usize = 1280;
pub const RING_CAPACITY: usize = 1024;
pub const MAX_EMIT_BATCH: usize = 64;

/// Reason a raw frame was rejected before it ever reached the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    EmptyPacket,
    UnsupportedIpVersion(u8),
    MalformedIpv4Header,
    MalformedIpv6Header,
    MalformedTcpSegment,
    MalformedUdpDatagram,
}

impl ParseError {
    pub fn description(&self) -> &'static str {
        match self {
            Self::EmptyPacket => "empty packet",
            Self::UnsupportedIpVersion(_) => "unsupported IP version",
            Self::MalformedIpv4Header => "malformed IPv4 header",
            Self::MalformedIpv6Header => "malformed IPv6 header",
            Self::MalformedTcpSegment => "malformed TCP segment",
            Self::MalformedUdpDatagram => "malformed UDP datagram",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ParsedPacket<'a> {
    Tcp(TcpPacket<'a>),
    Udp(UdpPacket<'a>),
    /// A well-formed IP frame that isn't TCP or UDP (e.g. a bare ICMPv6
    /// neighbor solicitation); smoltcp's interface handles these on its
    /// own during `Interface::poll`, so the coordinator has nothing to do.
    Other,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

#[derive(Debug, Clone)]
pub struct TcpPacket<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: TcpFlags,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone)]
pub struct UdpPacket<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

/// Best-effort classification used only to route `process_packet`; the
/// stack itself re-parses the frame with its own (checksum-trusting)
/// parser, so a `None` here just means the coordinator skips bookkeeping
/// for an uninteresting frame rather than rejecting it outright.
pub fn parse_packet(packet: &[u8]) -> Option<ParsedPacket<'_>> {
    parse_packet_validated(packet).ok()
}

pub fn parse_packet_validated(packet: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    if packet.is_empty() {
        return Err(ParseError::EmptyPacket);
    }
    match packet[0] >> 4 {
        4 => parse_ipv4(packet),
        6 => parse_ipv6(packet),
        other => Err(ParseError::UnsupportedIpVersion(other)),
    }
}

fn parse_ipv4(packet: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    if packet.len() < 20 {
        return Err(ParseError::MalformedIpv4Header);
    }
    let header_len = usize::from(packet[0] & 0x0F) * 4;
    if header_len < 20 || header_len > packet.len() {
        return Err(ParseError::MalformedIpv4Header);
    }
    let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if total_len < header_len || total_len > packet.len() {
        return Err(ParseError::MalformedIpv4Header);
    }
    let protocol = packet[9];
    let src = IpAddr::V4(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]));
    let dst = IpAddr::V4(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]));
    let body = &packet[header_len..total_len];
    parse_transport(protocol, src, dst, body)
}

fn parse_ipv6(packet: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    const HEADER_LEN: usize = 40;
    if packet.len() < HEADER_LEN {
        return Err(ParseError::MalformedIpv6Header);
    }
    let payload_len = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    if HEADER_LEN + payload_len > packet.len() {
        return Err(ParseError::MalformedIpv6Header);
    }
    let next_header = packet[6];
    let src = IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(&packet[8..24]).unwrap()));
    let dst = IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(&packet[24..40]).unwrap()));
    let body = &packet[HEADER_LEN..HEADER_LEN + payload_len];
    parse_transport(next_header, src, dst, body)
}

fn parse_transport(
    protocol: u8,
    src: IpAddr,
    dst: IpAddr,
    body: &[u8],
) -> Result<ParsedPacket<'_>, ParseError> {
    match protocol {
        6 => {
            if body.len() < 20 {
                return Err(ParseError::MalformedTcpSegment);
            }
            let data_offset = usize::from(body[12] >> 4) * 4;
            if data_offset < 20 || data_offset > body.len() {
                return Err(ParseError::MalformedTcpSegment);
            }
            let flags_byte = body[13];
            Ok(ParsedPacket::Tcp(TcpPacket {
                src,
                dst,
                src_port: u16::from_be_bytes([body[0], body[1]]),
                dst_port: u16::from_be_bytes([body[2], body[3]]),
                flags: TcpFlags {
                    syn: flags_byte & 0x02 != 0,
                    ack: flags_byte & 0x10 != 0,
                    fin: flags_byte & 0x01 != 0,
                    rst: flags_byte & 0x04 != 0,
                },
                payload: &body[data_offset..],
            }))
        }
        17 => {
            if body.len() < 8 {
                return Err(ParseError::MalformedUdpDatagram);
            }
            let udp_len = u16::from_be_bytes([body[4], body[5]]) as usize;
            if udp_len < 8 || udp_len > body.len() {
                return Err(ParseError::MalformedUdpDatagram);
            }
            Ok(ParsedPacket::Udp(UdpPacket {
                src,
                dst,
                src_port: u16::from_be_bytes([body[0], body[1]]),
                dst_port: u16::from_be_bytes([body[2], body[3]]),
                payload: &body[8..udp_len],
            }))
        }
        _ => Ok(ParsedPacket::Other),
    }
}

struct SharedRing {
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
    capacity: usize,
}

impl SharedRing {
    fn new(capacity: usize) -> Self {
        Self {
            inbound: VecDeque::with_capacity(capacity),
            outbound: VecDeque::with_capacity(capacity),
            capacity,
        }
    }
}

/// Device exposed to smoltcp. State lives in the shared ring so the
/// device itself stays `Clone` + lightweight; only the stack context
/// ever calls [`Device::receive`]/[`Device::transmit`] on it.
#[derive(Clone)]
pub struct TunDevice {
    inner: Arc<Mutex<SharedRing>>,
    wake: Arc<Notify>,
    mtu: usize,
}

/// Handle used by the write context / FFI boundary to push inbound
/// frames or drain outbound frames without borrowing the stack device.
#[derive(Clone)]
pub struct TunHandle {
    inner: Arc<Mutex<SharedRing>>,
    wake: Arc<Notify>,
    mtu: usize,
}

impl TunDevice {
    pub fn new(mtu: usize, wake: Arc<Notify>) -> Self {
        Self::with_capacity(mtu, wake, RING_CAPACITY)
    }

    pub fn with_capacity(mtu: usize, wake: Arc<Notify>, ring_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SharedRing::new(ring_capacity.max(16)))),
            wake,
            mtu: mtu.max(576),
        }
    }

    pub fn handle(&self) -> TunHandle {
        TunHandle {
            inner: Arc::clone(&self.inner),
            wake: Arc::clone(&self.wake),
            mtu: self.mtu,
        }
    }

    fn device_capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = self.mtu;
        caps.medium = Medium::Ip;
        caps
    }
}

impl TunHandle {
    /// Pushes a copy of `packet` into the inbound ring (read-loop
    /// delivery). Returns `false` if the packet failed basic validation;
    /// a full ring drops the oldest entry rather than the new one, since
    /// the newest frame is the one the peer is most likely to retransmit
    /// for anyway.
    pub fn push_inbound(&self, packet: &[u8]) -> bool {
        if packet.is_empty() {
            return true;
        }
        if parse_packet_validated(packet).is_err() {
            return false;
        }
        let mut guard = self.inner.lock();
        if guard.inbound.len() >= guard.capacity {
            guard.inbound.pop_front();
        }
        let capped = packet.len().min(self.mtu);
        guard.inbound.push_back(packet[..capped].to_vec());
        drop(guard);
        self.wake.notify_one();
        true
    }

    /// Drains up to [`MAX_EMIT_BATCH`] outbound frames for the write
    /// context to hand back to the tunnel.
    pub fn drain_outbound(&self) -> Vec<Vec<u8>> {
        let mut guard = self.inner.lock();
        let drain_count = MAX_EMIT_BATCH.min(guard.outbound.len());
        guard.outbound.drain(..drain_count).collect()
    }

    pub fn inbound_queue_len(&self) -> usize {
        self.inner.lock().inbound.len()
    }

    /// Injects a fully-built IP frame straight into the outbound ring,
    /// bypassing `Interface::poll`/`Device::transmit` entirely. Used for
    /// UDP replies, which are assembled by `packet_builder` rather than
    /// routed through a smoltcp socket (see `flow_coordinator::interface`).
    pub fn push_outbound(&self, frame: Vec<u8>) {
        if frame.is_empty() {
            return;
        }
        let mut guard = self.inner.lock();
        if guard.outbound.len() >= guard.capacity {
            guard.outbound.pop_front();
        }
        guard.outbound.push_back(frame);
        drop(guard);
        self.wake.notify_one();
    }
}

impl Device for TunDevice {
    type RxToken<'a> = TunRxToken where Self: 'a;
    type TxToken<'a> = TunTxToken where Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let mut guard = self.inner.lock();
        let capacity = guard.capacity;
        guard.inbound.pop_front().map(|packet| {
            let rx = TunRxToken { buffer: packet };
            let tx = TunTxToken {
                inner: Arc::clone(&self.inner),
                wake: Arc::clone(&self.wake),
                mtu: self.mtu,
                capacity,
            };
            (rx, tx)
        })
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        let capacity = self.inner.lock().capacity;
        Some(TunTxToken {
            inner: Arc::clone(&self.inner),
            wake: Arc::clone(&self.wake),
            mtu: self.mtu,
            capacity,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.device_capabilities()
    }
}

pub struct TunRxToken {
    buffer: Vec<u8>,
}

pub struct TunTxToken {
    inner: Arc<Mutex<SharedRing>>,
    wake: Arc<Notify>,
    mtu: usize,
    capacity: usize,
}

impl RxToken for TunRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = self.buffer;
        f(&mut buffer)
    }
}

impl TxToken for TunTxToken {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len.min(self.mtu)];
        let result = f(&mut frame);
        let mut guard = self.inner.lock();
        if guard.outbound.len() >= self.capacity {
            guard.outbound.pop_front();
        }
        guard.outbound.push_back(frame);
        self.wake.notify_one();
        result
    }
}
