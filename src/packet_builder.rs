//! Raw IP/UDP packet construction for UDP Flow reply injection.
//!
//! Builds complete frames byte-by-byte rather than going through a smoltcp
//! UDP socket: every UDP Flow to the same destination would otherwise share
//! that socket's bound endpoint, so replies are injected directly as raw
//! frames with the swapped 5-tuple instead.

#[cfg(test)]
mod tests;

use crate::checksum;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Builds a UDP response packet (upstream -> tunnel client) for the given
/// flow. `from`/`from_port` is the original destination (now the response's
/// source); `to`/`to_port` is the original source (now the response's
/// destination) — i.e. the 5-tuple is swapped relative to the inbound
/// datagram that created the flow. Returns `None` if `from`/`to` mix address
/// families.
pub fn build_udp_response(
    from: IpAddr,
    from_port: u16,
    to: IpAddr,
    to_port: u16,
    payload: &[u8],
) -> Option<Vec<u8>> {
    match (from, to) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            Some(build_ipv4_udp(src, dst, from_port, to_port, payload))
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            Some(build_ipv6_udp(src, dst, from_port, to_port, payload))
        }
        _ => None,
    }
}

fn build_ipv4_udp(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    const IPV4_HEADER_LEN: usize = 20;
    const UDP_HEADER_LEN: usize = 8;

    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    let mut buffer = vec![0u8; total_len];

    buffer[0] = 0x45;
    buffer[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buffer[8] = 64; // TTL
    buffer[9] = 17; // UDP
    buffer[12..16].copy_from_slice(&src.octets());
    buffer[16..20].copy_from_slice(&dst.octets());

    let udp_offset = IPV4_HEADER_LEN;
    buffer[udp_offset..udp_offset + 2].copy_from_slice(&src_port.to_be_bytes());
    buffer[udp_offset + 2..udp_offset + 4].copy_from_slice(&dst_port.to_be_bytes());
    buffer[udp_offset + 4..udp_offset + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buffer[udp_offset + UDP_HEADER_LEN..].copy_from_slice(payload);

    let udp_checksum = checksum::udp_ipv4(src, dst, &buffer[udp_offset..]);
    buffer[udp_offset + 6..udp_offset + 8].copy_from_slice(&udp_checksum.to_be_bytes());

    let ip_checksum = checksum::ipv4_header(&buffer[..IPV4_HEADER_LEN]);
    buffer[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    buffer
}

fn build_ipv6_udp(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    const IPV6_HEADER_LEN: usize = 40;
    const UDP_HEADER_LEN: usize = 8;

    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV6_HEADER_LEN + udp_len;
    let mut buffer = vec![0u8; total_len];

    buffer[0] = 0x60;
    buffer[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buffer[6] = 17; // next header = UDP
    buffer[7] = 64; // hop limit
    buffer[8..24].copy_from_slice(&src.octets());
    buffer[24..40].copy_from_slice(&dst.octets());

    let udp_offset = IPV6_HEADER_LEN;
    buffer[udp_offset..udp_offset + 2].copy_from_slice(&src_port.to_be_bytes());
    buffer[udp_offset + 2..udp_offset + 4].copy_from_slice(&dst_port.to_be_bytes());
    buffer[udp_offset + 4..udp_offset + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buffer[udp_offset + UDP_HEADER_LEN..].copy_from_slice(payload);

    let udp_checksum = checksum::udp_ipv6(src, dst, &buffer[udp_offset..]);
    buffer[udp_offset + 6..udp_offset + 8].copy_from_slice(&udp_checksum.to_be_bytes());

    buffer
}
