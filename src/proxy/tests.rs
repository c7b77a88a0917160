use super::fake::FakeProxyClient;
use super::*;
use crate::config::ConfigSnapshot;
use std::sync::Arc;

fn snapshot() -> Arc<ConfigSnapshot> {
    let payload = r#"{"serverAddress":"vless.example.com","serverPort":443,"uuid":"u"}"#;
    Arc::new(ConfigSnapshot::parse(payload).unwrap())
}

#[tokio::test]
async fn fake_tcp_dial_records_host_and_port() {
    let client = FakeProxyClient::new().with_tcp_reply(b"HTTP/1.1 200 OK\r\n\r\n".to_vec());
    let mut stream = client
        .tcp_dial("93.184.216.34", 80, snapshot())
        .await
        .unwrap();
    let dials = client.tcp_dials();
    assert_eq!(dials.len(), 1);
    assert_eq!(dials[0].host, "93.184.216.34");
    assert_eq!(dials[0].port, 80);

    let reply = stream.recv().await.unwrap();
    assert_eq!(reply.as_deref(), Some(&b"HTTP/1.1 200 OK\r\n\r\n"[..]));
    let eof = stream.recv().await.unwrap();
    assert!(eof.is_none());
}

#[tokio::test]
async fn fake_dial_failure_is_reported() {
    let client = FakeProxyClient::new().with_dial_failure("connection refused");
    let result = client.tcp_dial("10.0.0.1", 1, snapshot()).await;
    assert!(matches!(result, Err(DialError::Failed { .. })));
}

#[tokio::test]
async fn fake_udp_open_tracks_count() {
    let client = FakeProxyClient::new().with_udp_reply(b"answer".to_vec());
    let _ = client.udp_open(snapshot()).await.unwrap();
    let _ = client.udp_open(snapshot()).await.unwrap();
    assert_eq!(client.udp_open_count(), 2);
}
