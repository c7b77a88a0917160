use super::*;
use crate::proxy::fake::FakeProxyClient;

fn snapshot() -> Arc<ConfigSnapshot> {
    let payload = r#"{"serverAddress":"h","serverPort":1,"uuid":"u","flow":"xtls-rprx-vision","muxEnabled":true}"#;
    Arc::new(ConfigSnapshot::parse(payload).unwrap())
}

#[tokio::test]
async fn forwarding_mux_manager_delegates_to_proxy_client() {
    let fake = Arc::new(FakeProxyClient::new().with_udp_reply(b"pong".to_vec()));
    let mux = ForwardingMuxManager::new(fake.clone(), snapshot());
    let _ = mux.open_udp("1.1.1.1", 53).await.unwrap();
    assert_eq!(fake.udp_open_count(), 1);
    mux.close_all().await;
}
