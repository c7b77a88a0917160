//! Builds the smoltcp `Interface` + `SocketSet`: single interface, no
//! ARP/ND/DHCP, IPv4 + IPv6 + TCP + UDP + ICMPv6, fixed-size PCB pools.

use super::state::{TCP_SND_BUF, TCP_SOCKET_COUNT, TCP_WND, UDP_SOCKET_COUNT};
use crate::device::TunDevice;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer as TcpSocketBuffer};
use smoltcp::socket::udp::{
    PacketBuffer, PacketMetadata, Socket as UdpSocket,
};
use smoltcp::time::Instant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, Ipv4Address, Ipv6Address};

const UDP_PACKET_METADATA: usize = 16;
const UDP_BUFFER_SIZE: usize = 4 * 1024;

pub fn build_interface_and_sockets(
    device: &mut TunDevice,
) -> (Interface, SocketSet<'static>, Vec<SocketHandle>, Vec<SocketHandle>) {
    let ipv4_addr = Ipv4Address::new(10, 0, 0, 1);
    let ipv6_addr = Ipv6Address::new(0xfd00, 0, 0, 0, 0, 0, 0, 1);

    let mut config = IfaceConfig::new(HardwareAddress::Ip);
    config.random_seed = 0;
    let mut interface = Interface::new(config, device, Instant::from_millis(0));
    interface.set_any_ip(true);
    interface.update_ip_addrs(|ip_addrs| {
        ip_addrs.clear();
        let _ = ip_addrs.push(IpCidr::new(IpAddress::Ipv4(ipv4_addr), 24));
        let _ = ip_addrs.push(IpCidr::new(IpAddress::Ipv6(ipv6_addr), 64));
    });
    {
        let routes = interface.routes_mut();
        let _ = routes.add_default_ipv4_route(ipv4_addr);
        let _ = routes.add_default_ipv6_route(ipv6_addr);
    }

    let mut sockets = SocketSet::new(Vec::new());

    let mut tcp_pool = Vec::with_capacity(TCP_SOCKET_COUNT);
    for _ in 0..TCP_SOCKET_COUNT {
        // Buffers sized past 64KiB make smoltcp negotiate RFC 1323 window
        // scaling automatically; it never implements SACK or timestamps,
        // so there is nothing to disable explicitly for those.
        let socket = TcpSocket::new(
            TcpSocketBuffer::new(vec![0; TCP_WND]),
            TcpSocketBuffer::new(vec![0; TCP_SND_BUF]),
        );
        tcp_pool.push(sockets.add(socket));
    }

    // Reserved to match the source's PCB memory budget. UDP payloads never
    // cross these sockets: `FlowCoordinator` classifies and routes UDP
    // datagrams itself, and replies are raw-injected (see
    // `packet_builder::build_udp_response`) because every UDP flow to the
    // same destination would otherwise share that destination's bound
    // endpoint on a real smoltcp `udp::Socket`.
    let mut udp_pool = Vec::with_capacity(UDP_SOCKET_COUNT);
    for _ in 0..UDP_SOCKET_COUNT {
        let rx_meta = vec![PacketMetadata::EMPTY; UDP_PACKET_METADATA];
        let tx_meta = vec![PacketMetadata::EMPTY; UDP_PACKET_METADATA];
        let socket = UdpSocket::new(
            PacketBuffer::new(rx_meta, vec![0; UDP_BUFFER_SIZE]),
            PacketBuffer::new(tx_meta, vec![0; UDP_BUFFER_SIZE]),
        );
        udp_pool.push(sockets.add(socket));
    }

    (interface, sockets, tcp_pool, udp_pool)
}
