use super::*;
use crate::config::ConfigSnapshot;
use crate::device::{self, TcpFlags, TcpPacket, UdpPacket, DEFAULT_MTU};
use crate::proxy::fake::FakeProxyClient;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tokio::sync::Notify;

fn sample_snapshot(server_address: &str) -> Arc<ConfigSnapshot> {
    let payload = format!(
        r#"{{"serverAddress":"{server_address}","serverPort":443,"uuid":"11111111-1111-1111-1111-111111111111"}}"#
    );
    Arc::new(ConfigSnapshot::parse(&payload).expect("sample snapshot parses"))
}

fn make_coordinator(proxy: Arc<dyn ProxyClient>, ipv6_enabled: bool) -> FlowCoordinator {
    let wake = Arc::new(Notify::new());
    let device = TunDevice::new(DEFAULT_MTU, wake);
    FlowCoordinator::start(device, sample_snapshot("198.51.100.10"), ipv6_enabled, proxy)
}

fn admit_tcp_syn(coordinator: &mut FlowCoordinator, src: IpAddr, src_port: u16, dst: IpAddr, dst_port: u16) {
    coordinator.admit_tcp(&TcpPacket {
        src,
        dst,
        src_port,
        dst_port,
        flags: TcpFlags { syn: true, ack: false, fin: false, rst: false },
        payload: &[],
    });
}

fn admit_udp_datagram(
    coordinator: &mut FlowCoordinator,
    src: IpAddr,
    src_port: u16,
    dst: IpAddr,
    dst_port: u16,
    payload: &[u8],
) {
    coordinator.route_udp(&UdpPacket { src, dst, src_port, dst_port, payload });
}

/// Lets already-spawned per-flow tasks run up to their next await point.
async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[test]
fn ipv6_address_key_uses_eight_uncompressed_hex_groups() {
    let addr = IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1));
    assert_eq!(state::format_ip(addr), "fd00:0:0:0:0:0:0:1");
}

#[test]
fn stopping_twice_is_idempotent() {
    let proxy: Arc<dyn ProxyClient> = Arc::new(FakeProxyClient::new());
    let mut coordinator = make_coordinator(proxy, false);
    coordinator.stop();
    assert!(!coordinator.is_running());
    coordinator.stop();
    assert!(!coordinator.is_running());
}

#[tokio::test]
async fn duplicate_syn_for_an_existing_flow_does_not_reallocate_a_socket() {
    let proxy: Arc<dyn ProxyClient> = Arc::new(FakeProxyClient::new());
    let mut coordinator = make_coordinator(proxy, true);
    let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    let dst = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

    admit_tcp_syn(&mut coordinator, src, 4000, dst, 443);
    admit_tcp_syn(&mut coordinator, src, 4000, dst, 443);
    settle().await;

    assert_eq!(coordinator.tcp_connection_count(), 1);
}

#[tokio::test]
async fn tcp_admission_is_rejected_when_ipv6_is_disabled() {
    let proxy: Arc<dyn ProxyClient> = Arc::new(FakeProxyClient::new());
    let mut coordinator = make_coordinator(proxy, false);
    let src = IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2));
    let dst = IpAddr::V6(Ipv6Addr::new(0x2606, 0x4700, 0, 0, 0, 0, 0, 0x1111));

    admit_tcp_syn(&mut coordinator, src, 4000, dst, 443);
    settle().await;

    assert_eq!(coordinator.tcp_connection_count(), 0);
}

#[tokio::test]
async fn tcp_pool_exhaustion_is_counted_and_leaves_existing_flows_untouched() {
    let proxy: Arc<dyn ProxyClient> = Arc::new(FakeProxyClient::new());
    let mut coordinator = make_coordinator(proxy, true);
    let dst = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

    for i in 0..state::TCP_SOCKET_COUNT {
        let src_port = 10_000 + i as u16;
        admit_tcp_syn(&mut coordinator, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), src_port, dst, 443);
    }
    settle().await;
    assert_eq!(coordinator.tcp_connection_count(), state::TCP_SOCKET_COUNT);

    admit_tcp_syn(&mut coordinator, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 20_000, dst, 443);
    settle().await;

    assert_eq!(coordinator.tcp_connection_count(), state::TCP_SOCKET_COUNT);
    assert_eq!(coordinator.counters().tcp_admission_fail, 1);
}

#[tokio::test(start_paused = true)]
async fn tcp_dial_exhausts_retries_then_closes_the_connection() {
    let proxy = Arc::new(FakeProxyClient::new().with_dial_failure("network_down"));
    let mut coordinator = make_coordinator(Arc::clone(&proxy) as Arc<dyn ProxyClient>, true);
    let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    let dst = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

    admit_tcp_syn(&mut coordinator, src, 4000, dst, 443);
    settle().await;
    assert_eq!(coordinator.tcp_connection_count(), 1);

    for attempt in 1..state::MAX_DIAL_ATTEMPTS {
        tokio::time::advance(state::dial_backoff_delay(attempt)).await;
        settle().await;
    }
    coordinator.tick(SmolInstant::from_millis(0));

    assert_eq!(coordinator.tcp_connection_count(), 0);
    assert_eq!(proxy.tcp_dials().len(), state::MAX_DIAL_ATTEMPTS as usize);
}

#[tokio::test]
async fn udp_reply_is_wrapped_and_injected_into_the_outbound_ring() {
    let reply = vec![9u8, 8, 7, 6];
    let proxy: Arc<dyn ProxyClient> = Arc::new(FakeProxyClient::new().with_udp_reply(reply.clone()));
    let mut coordinator = make_coordinator(proxy, false);
    let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    let dst = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 10));

    admit_udp_datagram(&mut coordinator, src, 5000, dst, 53, b"query");
    settle().await;
    coordinator.tick(SmolInstant::from_millis(0));
    settle().await;
    coordinator.tick(SmolInstant::from_millis(1));

    let frames = coordinator.handle().drain_outbound();
    assert_eq!(frames.len(), 1);
    match device::parse_packet(&frames[0]).expect("a well-formed frame") {
        ParsedPacket::Udp(udp) => {
            assert_eq!(udp.src, dst);
            assert_eq!(udp.dst, src);
            assert_eq!(udp.src_port, 53);
            assert_eq!(udp.dst_port, 5000);
            assert_eq!(udp.payload, reply.as_slice());
        }
        other => panic!("expected a UDP frame, got {other:?}"),
    }
}

#[tokio::test]
async fn udp_flow_table_caps_admission_at_the_configured_maximum() {
    let proxy: Arc<dyn ProxyClient> = Arc::new(FakeProxyClient::new());
    let mut coordinator = make_coordinator(proxy, false);
    let dst = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 10));

    for i in 0..state::MAX_UDP_FLOWS {
        let src_port = 10_000 + i as u16;
        admit_udp_datagram(&mut coordinator, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), src_port, dst, 53, b"q");
    }
    assert_eq!(coordinator.udp_flow_count(), state::MAX_UDP_FLOWS);

    admit_udp_datagram(&mut coordinator, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 20_000, dst, 53, b"q");

    assert_eq!(coordinator.udp_flow_count(), state::MAX_UDP_FLOWS);
    assert_eq!(coordinator.counters().udp_admission_fail, 1);
}

#[tokio::test(start_paused = true)]
async fn udp_flow_is_reaped_after_the_idle_timeout() {
    let proxy: Arc<dyn ProxyClient> = Arc::new(FakeProxyClient::new());
    let mut coordinator = make_coordinator(proxy, false);
    let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    let dst = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 10));

    admit_udp_datagram(&mut coordinator, src, 6000, dst, 53, b"q");
    assert_eq!(coordinator.udp_flow_count(), 1);

    tokio::time::advance(state::UDP_IDLE_TIMEOUT + Duration::from_secs(1)).await;
    coordinator.reap_idle_udp(tokio::time::Instant::now());

    assert_eq!(coordinator.udp_flow_count(), 0);
}

#[tokio::test]
async fn switch_configuration_clears_every_existing_flow_and_connection() {
    let proxy: Arc<dyn ProxyClient> = Arc::new(FakeProxyClient::new());
    let mut coordinator = make_coordinator(Arc::clone(&proxy), true);
    let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    admit_tcp_syn(&mut coordinator, src, 4000, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)), 443);
    admit_udp_datagram(&mut coordinator, src, 5000, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 10)), 53, b"q");
    settle().await;
    assert_eq!(coordinator.tcp_connection_count(), 1);
    assert_eq!(coordinator.udp_flow_count(), 1);

    coordinator
        .switch_configuration(sample_snapshot("198.51.100.20"), Some(false))
        .await;

    assert_eq!(coordinator.tcp_connection_count(), 0);
    assert_eq!(coordinator.udp_flow_count(), 0);
    assert!(coordinator.is_running());
    assert_eq!(coordinator.tcp_pool.len(), state::TCP_SOCKET_COUNT);
}
