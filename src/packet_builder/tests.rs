use super::*;

#[test]
fn builds_ipv4_udp_response_with_swapped_tuple() {
    let server = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
    let client = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    let payload = b"hello dns";
    let packet = build_udp_response(server, 53, client, 55555, payload).unwrap();

    assert_eq!(packet[0] >> 4, 4);
    assert_eq!(&packet[12..16], &[1, 1, 1, 1]);
    assert_eq!(&packet[16..20], &[10, 0, 0, 2]);
    let udp_offset = 20;
    assert_eq!(
        u16::from_be_bytes([packet[udp_offset], packet[udp_offset + 1]]),
        53
    );
    assert_eq!(
        u16::from_be_bytes([packet[udp_offset + 2], packet[udp_offset + 3]]),
        55555
    );
    assert_eq!(&packet[udp_offset + 8..], payload);
}

#[test]
fn builds_ipv6_udp_response() {
    let server = IpAddr::V6(Ipv6Addr::new(0x2606, 0x4700, 0, 0, 0, 0, 0, 0x1111));
    let client = IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2));
    let packet = build_udp_response(server, 443, client, 60000, b"data").unwrap();
    assert_eq!(packet[0] >> 4, 6);
    assert_eq!(packet.len(), 40 + 8 + 4);
}

#[test]
fn mixed_address_families_are_rejected() {
    let v4 = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
    let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
    assert!(build_udp_response(v4, 53, v6, 1234, b"x").is_none());
}
