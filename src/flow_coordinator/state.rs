use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::Duration;

pub const MAX_UDP_FLOWS: usize = 200;
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const STACK_TICK: Duration = Duration::from_millis(250);
pub const UDP_REAP_TICK: Duration = Duration::from_secs(1);

pub const TCP_MSS: usize = 1360;
pub const TCP_WND: usize = 64 * TCP_MSS;
pub const TCP_SND_BUF: usize = 64 * TCP_MSS;

pub const TCP_SOCKET_COUNT: usize = 128;
pub const UDP_SOCKET_COUNT: usize = 4;

pub const MAX_DIAL_ATTEMPTS: u8 = 3;
const DIAL_BACKOFF_BASE_MS: u64 = 50;

pub const MAX_BUFFERED_PAYLOADS: usize = 8;
pub const MAX_BUFFERED_BYTES: usize = 64 * 1024;

/// 5-tuple key, `(src_ip, src_port, dst_ip, dst_port)` — the protocol is
/// implicit per table (`tcp_connections` vs. `udp_flows` never mix keys).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn is_ipv6(&self) -> bool {
        self.src_ip.is_ipv6()
    }

    /// `"srcIP:srcPort-dstIP:dstPort"`.
    pub fn to_string_key(&self) -> String {
        format!(
            "{}:{}-{}:{}",
            format_ip(self.src_ip),
            self.src_port,
            format_ip(self.dst_ip),
            self.dst_port
        )
    }
}

/// IPv4 -> dotted-quad of the raw bytes; IPv6 -> eight colon-separated
/// lowercase hex groups of the raw bytes, uncompressed (NOT RFC 5952 —
/// `std::net::Ipv6Addr`'s `Display` compresses runs of zero groups, which
/// would make two different-zero-run addresses collide if ever truncated
/// for display, and more importantly wouldn't round-trip byte-for-byte
/// through a human reading the key). Stable for identical raw bytes
/// regardless of in-memory representation.
pub fn format_ip(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            let mut groups = [0u16; 8];
            for (i, group) in groups.iter_mut().enumerate() {
                *group = u16::from_be_bytes([octets[i * 2], octets[i * 2 + 1]]);
            }
            groups
                .iter()
                .map(|g| format!("{g:x}"))
                .collect::<Vec<_>>()
                .join(":")
        }
    }
}

pub fn dial_backoff_delay(attempt: u8) -> Duration {
    let shift = attempt.saturating_sub(1).min(4) as u32;
    let multiplier = 1u64 << shift;
    Duration::from_millis(DIAL_BACKOFF_BASE_MS * multiplier)
}

/// Pushes `payload` onto a bounded queue, evicting the oldest entries
/// first when it would overflow either the item-count or byte-size cap.
/// Returns `false` only when `payload` alone exceeds the byte cap (nothing
/// to evict that would make room).
pub fn buffer_payload(queue: &mut VecDeque<Vec<u8>>, queued_bytes: &mut usize, payload: &[u8]) -> bool {
    if payload.is_empty() {
        return true;
    }
    if payload.len() > MAX_BUFFERED_BYTES {
        return false;
    }
    while queue.len() >= MAX_BUFFERED_PAYLOADS || *queued_bytes + payload.len() > MAX_BUFFERED_BYTES {
        match queue.pop_front() {
            Some(evicted) => *queued_bytes = queued_bytes.saturating_sub(evicted.len()),
            None => break,
        }
    }
    queue.push_back(payload.to_vec());
    *queued_bytes += payload.len();
    true
}
