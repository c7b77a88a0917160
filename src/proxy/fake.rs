//! In-crate fake `ProxyClient` used by the Flow Coordinator's own test
//! suite: a shared recorder collecting dial calls, driven through trait
//! objects rather than a raw callback shim.

use super::*;
use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct DialRecord {
    pub host: String,
    pub port: u16,
}

#[derive(Default)]
struct Recorder {
    tcp_dials: Vec<DialRecord>,
    udp_opens: u32,
}

/// Scripted canned-response proxy: every TCP dial succeeds and immediately
/// yields the bytes in `tcp_reply` once, then EOFs; every UDP open succeeds
/// and yields `udp_reply` addressed back to the datagram's own destination
/// once `send` has been called at least once.
pub struct FakeProxyClient {
    recorder: Mutex<Recorder>,
    tcp_reply: Option<Vec<u8>>,
    tcp_dial_error: Option<String>,
    udp_reply: Option<Vec<u8>>,
}

impl FakeProxyClient {
    pub fn new() -> Self {
        Self {
            recorder: Mutex::new(Recorder::default()),
            tcp_reply: None,
            tcp_dial_error: None,
            udp_reply: None,
        }
    }

    pub fn with_tcp_reply(mut self, reply: impl Into<Vec<u8>>) -> Self {
        self.tcp_reply = Some(reply.into());
        self
    }

    pub fn with_dial_failure(mut self, reason: impl Into<String>) -> Self {
        self.tcp_dial_error = Some(reason.into());
        self
    }

    pub fn with_udp_reply(mut self, reply: impl Into<Vec<u8>>) -> Self {
        self.udp_reply = Some(reply.into());
        self
    }

    pub fn tcp_dials(&self) -> Vec<DialRecord> {
        self.recorder.lock().tcp_dials.clone()
    }

    pub fn udp_open_count(&self) -> u32 {
        self.recorder.lock().udp_opens
    }
}

impl Default for FakeProxyClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyClient for FakeProxyClient {
    async fn tcp_dial(
        &self,
        host: &str,
        port: u16,
        _snapshot: Arc<ConfigSnapshot>,
    ) -> Result<Box<dyn TcpStream>, DialError> {
        self.recorder.lock().tcp_dials.push(DialRecord {
            host: host.to_string(),
            port,
        });
        if let Some(reason) = &self.tcp_dial_error {
            return Err(DialError::Failed {
                host: host.to_string(),
                port,
                reason: reason.clone(),
            });
        }
        Ok(Box::new(FakeTcpStream {
            pending_reply: self.tcp_reply.clone(),
            closed: false,
        }))
    }

    async fn udp_open(
        &self,
        _snapshot: Arc<ConfigSnapshot>,
    ) -> Result<Box<dyn UdpDatagram>, DialError> {
        self.recorder.lock().udp_opens += 1;
        Ok(Box::new(FakeUdpDatagram {
            pending_reply: self.udp_reply.clone().map(|b| VecDeque::from(vec![b])).unwrap_or_default(),
            last_send_target: None,
        }))
    }
}

struct FakeTcpStream {
    pending_reply: Option<Vec<u8>>,
    closed: bool,
}

#[async_trait]
impl TcpStream for FakeTcpStream {
    async fn send(&mut self, _bytes: &[u8]) -> Result<(), StreamError> {
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        if self.closed {
            return Ok(None);
        }
        match self.pending_reply.take() {
            Some(reply) => Ok(Some(reply)),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

struct FakeUdpDatagram {
    pending_reply: VecDeque<Vec<u8>>,
    last_send_target: Option<(String, u16)>,
}

#[async_trait]
impl UdpDatagram for FakeUdpDatagram {
    async fn send(&mut self, dst_host: &str, dst_port: u16, _bytes: &[u8]) -> Result<(), StreamError> {
        self.last_send_target = Some((dst_host.to_string(), dst_port));
        Ok(())
    }

    async fn recv(&mut self) -> Result<(String, u16, Vec<u8>), StreamError> {
        let (host, port) = self
            .last_send_target
            .clone()
            .unwrap_or_else(|| ("0.0.0.0".to_string(), 0));
        match self.pending_reply.pop_front() {
            Some(bytes) => Ok((host, port, bytes)),
            None => std::future::pending::<Result<(String, u16, Vec<u8>), StreamError>>().await,
        }
    }

    async fn close(&mut self) {}
}
