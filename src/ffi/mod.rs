//! C ABI surface: packet-port I/O and the engine lifecycle/control channel.
//!
//! The proxy-client boundary (dial/send/close) is a plain async Rust trait
//! ([`crate::proxy::ProxyClient`]) rather than a second FFI surface — nothing
//! in this crate's composition requires that collaborator to cross a process
//! boundary, only tunnel packet I/O and the host's control channel do.

use std::ffi::c_void;
use std::os::raw::c_char;

#[cfg(test)]
mod tests;

/// Host-supplied callback invoked with a batch of outbound IP packets.
pub type EmitPacketsFn = unsafe extern "C" fn(
    packets: *const *const u8,
    sizes: *const usize,
    protocols: *const u32,
    count: usize,
    context: *mut c_void,
);

/// Engine tuning knobs, mirrored in the generated C header.
/// Defaults sized for a mobile network-extension host.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct TunnelConfig {
    pub mtu: u32,
    pub poll_min_interval_ms: u32,
    pub poll_max_interval_ms: u32,
    /// Memory budget for socket buffers in bytes.
    pub socket_memory_budget: u32,
    pub tcp_rx_buffer_size: u32,
    pub tcp_tx_buffer_size: u32,
    pub udp_buffer_size: u32,
    /// Ring buffer capacity for inbound/outbound packet queues.
    pub ring_capacity: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            mtu: 1280,
            poll_min_interval_ms: 10,
            poll_max_interval_ms: 250,
            socket_memory_budget: 16 * 1_048_576,
            tcp_rx_buffer_size: 16 * 1024,
            tcp_tx_buffer_size: 16 * 1024,
            udp_buffer_size: 16 * 1024,
            ring_capacity: 512,
        }
    }
}

/// Callbacks installed by the embedding host so the engine can write packets
/// back to the tunnel. The dial/send/close side of a flow never crosses this
/// boundary; see the module doc comment.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TunnelCallbacks {
    pub emit_packets: EmitPacketsFn,
    pub context: *mut c_void,
}

unsafe impl Send for TunnelCallbacks {}
unsafe impl Sync for TunnelCallbacks {}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct FlowCounters {
    pub tcp_admission_fail: u64,
    pub udp_admission_fail: u64,
    pub tcp_backpressure_drops: u64,
    pub udp_backpressure_drops: u64,
    /// Count of invalid IP packets (malformed headers, bad version, etc).
    pub invalid_ip_packets: u64,
    /// Count of invalid TCP segments (truncated, bad offsets, etc).
    pub invalid_tcp_packets: u64,
    /// Count of invalid UDP datagrams (truncated, bad length, etc).
    pub invalid_udp_packets: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct FlowStats {
    pub poll_iterations: u64,
    pub frames_emitted: u64,
    pub bytes_emitted: u64,
    pub tcp_flush_events: u64,
    pub udp_flush_events: u64,
    pub udp_flows_active: u64,
}

#[repr(C)]
pub struct TunnelLogSink {
    pub log: Option<
        unsafe extern "C" fn(
            level: *const c_char,
            message: *const c_char,
            breadcrumbs: u32,
            context: *mut c_void,
        ),
    >,
    pub context: *mut c_void,
    pub enabled_breadcrumbs: u32,
}
