use super::*;

#[test]
fn tunnel_config_default_is_mobile_sized() {
    let config = TunnelConfig::default();
    assert_eq!(config.mtu, 1280);
    assert!(config.socket_memory_budget >= config.tcp_rx_buffer_size as u32);
}

#[test]
fn flow_counters_default_to_zero() {
    let counters = FlowCounters::default();
    assert_eq!(counters.tcp_admission_fail, 0);
    assert_eq!(counters.invalid_ip_packets, 0);
}
