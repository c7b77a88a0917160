#![deny(unsafe_op_in_unsafe_fn)]

mod checksum;
pub mod config;
mod device;
pub mod ffi;
mod flow_coordinator;
mod logger;
mod mux;
mod packet_builder;
pub mod proxy;

use crate::config::ConfigSnapshot;
use crate::device::{TunDevice, TunHandle, DEFAULT_MTU, RING_CAPACITY};
use crate::ffi::{FlowCounters, FlowStats, TunnelCallbacks, TunnelConfig, TunnelLogSink};
use crate::flow_coordinator::FlowCoordinator;
use crate::logger::BreadcrumbFlags;
use crate::proxy::ProxyClient;
use once_cell::sync::OnceCell;
use smallvec::SmallVec;
use smoltcp::time::Instant as SmolInstant;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::ptr::NonNull;
use std::slice;
use std::sync::{Arc, Mutex};
use std::time::Instant as StdInstant;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration as TokioDuration};

const MIN_MTU: usize = 576;
const MAX_MTU: usize = 9000;

/// Opaque engine handle shared across the FFI boundary.
///
/// Construction is two-step: `TunnelEngine::new` builds the tokio
/// runtime and the Packet Port, but the Flow Coordinator (and the
/// `ProxyClient` it dials through) is only wired up once `install_proxy`
/// has run. An embedder that links a concrete `ProxyClient` in-process
/// calls `install_proxy` directly; `tunnel_engine_start` refuses to start
/// an engine that never got one.
pub struct TunnelEngine {
    proxy: OnceCell<Arc<dyn ProxyClient>>,
    callbacks: OnceCell<TunnelCallbacks>,
    runtime: Runtime,
    state: Arc<Mutex<EngineState>>,
    config: TunnelConfig,
    tun_handle: TunHandle,
    coordinator: Arc<Mutex<Option<FlowCoordinator>>>,
    tun_device: Mutex<Option<TunDevice>>,
    ipv6_enabled: Mutex<bool>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    wake: Arc<Notify>,
}

struct EngineState {
    running: bool,
}

impl TunnelEngine {
    pub fn new(config: TunnelConfig) -> anyhow::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .enable_time()
            .build()?;

        let wake = Arc::new(Notify::new());
        let mtu = normalize_mtu(config.mtu);
        let device = TunDevice::new(mtu, Arc::clone(&wake));
        let tun_handle = device.handle();

        let engine = Self {
            proxy: OnceCell::new(),
            callbacks: OnceCell::new(),
            runtime,
            state: Arc::new(Mutex::new(EngineState { running: false })),
            config,
            tun_handle,
            coordinator: Arc::new(Mutex::new(None)),
            tun_device: Mutex::new(Some(device)),
            ipv6_enabled: Mutex::new(true),
            poll_task: Mutex::new(None),
            wake,
        };

        logger::breadcrumb(
            BreadcrumbFlags::DEVICE,
            format!("TunnelEngine initialized (mtu={}, ring_cap={})", mtu, RING_CAPACITY),
        );

        Ok(engine)
    }

    /// Installs the `ProxyClient` an embedder dials through. Must be called
    /// exactly once, before `start`. Not exposed over FFI: the collaborator
    /// is an in-process Rust trait object (see `ffi` module doc comment).
    pub fn install_proxy(&self, proxy: Arc<dyn ProxyClient>) -> anyhow::Result<()> {
        self.proxy
            .set(proxy)
            .map_err(|_| anyhow::anyhow!("proxy client already installed"))
    }

    /// Installs the host's `emit_packets` callback. Only meaningful for an
    /// FFI host; a pure-Rust embedder can drain outbound frames directly
    /// via `drain_outbound_frames` instead and never call this.
    pub fn install_callbacks(&self, callbacks: TunnelCallbacks) -> anyhow::Result<()> {
        self.callbacks
            .set(callbacks)
            .map_err(|_| anyhow::anyhow!("callbacks already installed"))
    }

    /// Pulls frames the stack has queued for the tunnel to write out.
    pub fn drain_outbound_frames(&self) -> Vec<Vec<u8>> {
        self.tun_handle.drain_outbound()
    }

    pub fn start(&self, snapshot: ConfigSnapshot) -> anyhow::Result<()> {
        let proxy = self
            .proxy
            .get()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("start requested before a proxy client was installed"))?;

        logger::breadcrumb(BreadcrumbFlags::DEVICE, "TunnelEngine start requested".to_string());

        let device = self
            .tun_device
            .lock()
            .expect("device lock poisoned")
            .take()
            .ok_or_else(|| anyhow::anyhow!("engine already started"))?;
        let ipv6_enabled = *self.ipv6_enabled.lock().expect("ipv6 lock poisoned");
        let coordinator = FlowCoordinator::start(device, Arc::new(snapshot), ipv6_enabled, proxy);
        *self.coordinator.lock().expect("coordinator lock poisoned") = Some(coordinator);

        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.running = true;
        }

        self.start_poll_loop();

        logger::breadcrumb(BreadcrumbFlags::DEVICE, "TunnelEngine poll loop running".to_string());

        Ok(())
    }

    pub fn stop(&self) {
        logger::breadcrumb(BreadcrumbFlags::DEVICE, "TunnelEngine stop requested".to_string());
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.running = false;
        }
        self.wake.notify_waiters();
        if let Ok(mut task) = self.poll_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
        if let Ok(mut slot) = self.coordinator.lock() {
            if let Some(coordinator) = slot.as_mut() {
                coordinator.stop();
            }
        }

        logger::breadcrumb(BreadcrumbFlags::DEVICE, "TunnelEngine stopped".to_string());
    }

    pub async fn switch_configuration(&self, snapshot: ConfigSnapshot, ipv6_enabled: Option<bool>) {
        if let Some(enabled) = ipv6_enabled {
            *self.ipv6_enabled.lock().expect("ipv6 lock poisoned") = enabled;
        }
        // Take the coordinator out of the std Mutex before awaiting so the
        // guard never crosses an await point — the poll loop locks this
        // same mutex every tick and would deadlock against a held guard.
        // A tick landing in the gap just sees `None` and no-ops for that
        // iteration.
        let mut coordinator = self
            .coordinator
            .lock()
            .expect("coordinator lock poisoned")
            .take();
        if let Some(coordinator) = coordinator.as_mut() {
            coordinator.switch_configuration(Arc::new(snapshot), ipv6_enabled).await;
        }
        *self.coordinator.lock().expect("coordinator lock poisoned") = coordinator;
    }

    pub fn handle_packet(&self, packet: &[u8]) -> bool {
        let Ok(mut slot) = self.coordinator.lock() else {
            return false;
        };
        let Some(coordinator) = slot.as_mut() else {
            return false;
        };
        coordinator.handle_inbound_packet(packet);
        true
    }

    fn copy_counters(&self) -> FlowCounters {
        self.coordinator
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|c| c.counters()))
            .unwrap_or_default()
    }

    fn copy_stats(&self) -> FlowStats {
        self.coordinator
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|c| c.stats()))
            .unwrap_or_default()
    }

    fn start_poll_loop(&self) {
        let coordinator = Arc::clone(&self.coordinator);
        let state = Arc::clone(&self.state);
        let wake = Arc::clone(&self.wake);
        let tun_handle = self.tun_handle.clone();
        let callbacks = self.callbacks.get().copied();
        let min_interval = TokioDuration::from_millis(u64::from(self.config.poll_min_interval_ms.max(1)));
        let handle = self.runtime.spawn(async move {
            let epoch = StdInstant::now();
            let mut ticker = time::interval(min_interval);
            let mut reap_ticker = time::interval(flow_coordinator::state::UDP_REAP_TICK);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = reap_ticker.tick() => {}
                    _ = wake.notified() => {}
                }
                let running = {
                    let guard = state.lock().expect("state lock poisoned");
                    guard.running
                };
                if !running {
                    break;
                }
                let now = epoch.elapsed();
                let millis = now.as_millis().min(i64::MAX as u128) as i64;
                if let Ok(mut slot) = coordinator.lock() {
                    if let Some(coordinator) = slot.as_mut() {
                        coordinator.tick(SmolInstant::from_millis(millis));
                        coordinator.reap_idle_udp(tokio::time::Instant::now());
                    }
                }
                if let Some(callbacks) = callbacks {
                    emit_frames(callbacks, tun_handle.drain_outbound());
                }
            }
        });
        let mut slot = self.poll_task.lock().expect("poll task lock poisoned");
        *slot = Some(handle);
    }
}

/// Host-facing half of the Packet Port write path: wraps every queued
/// outbound frame's pointer/size/protocol into the three parallel arrays
/// `emit_packets` expects and invokes it once per poll tick.
fn emit_frames(callbacks: TunnelCallbacks, frames: Vec<Vec<u8>>) {
    if frames.is_empty() {
        return;
    }
    let mut packet_ptrs: SmallVec<[*const u8; 16]> = SmallVec::with_capacity(frames.len());
    let mut sizes: SmallVec<[usize; 16]> = SmallVec::with_capacity(frames.len());
    let mut protocols: SmallVec<[u32; 16]> = SmallVec::with_capacity(frames.len());
    for frame in &frames {
        packet_ptrs.push(frame.as_ptr());
        sizes.push(frame.len());
        protocols.push(protocol_number(frame));
    }

    unsafe {
        (callbacks.emit_packets)(
            packet_ptrs.as_ptr(),
            sizes.as_ptr(),
            protocols.as_ptr(),
            packet_ptrs.len(),
            callbacks.context,
        );
    }
}

fn protocol_number(frame: &[u8]) -> u32 {
    if frame.first().map(|byte| (byte >> 4) == 6).unwrap_or(false) {
        libc::AF_INET6 as u32
    } else {
        libc::AF_INET as u32
    }
}

fn normalize_mtu(value: u32) -> usize {
    let clamped = value.max(MIN_MTU as u32).min(MAX_MTU as u32);
    usize::try_from(clamped).unwrap_or(DEFAULT_MTU)
}

fn parse_snapshot(payload: *const c_char) -> Option<ConfigSnapshot> {
    if payload.is_null() {
        return None;
    }
    let payload = unsafe { CStr::from_ptr(payload) }.to_str().ok()?;
    ConfigSnapshot::parse(payload).ok()
}

#[no_mangle]
pub unsafe extern "C" fn tunnel_engine_new(config: *const TunnelConfig) -> *mut TunnelEngine {
    let config = if let Some(cfg) = NonNull::new(config as *mut TunnelConfig) {
        unsafe { *cfg.as_ptr() }
    } else {
        TunnelConfig::default()
    };

    match TunnelEngine::new(config) {
        Ok(engine) => Box::into_raw(Box::new(engine)),
        Err(error) => {
            crate::logger::error(format!("tunnel_engine_new failed: {error:?}"));
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn tunnel_engine_free(engine: *mut TunnelEngine) {
    if let Some(engine) = NonNull::new(engine) {
        unsafe {
            drop(Box::from_raw(engine.as_ptr()));
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn tunnel_engine_start(
    engine: *mut TunnelEngine,
    snapshot_json: *const c_char,
    callbacks: *const TunnelCallbacks,
) -> i32 {
    let Some(engine) = NonNull::new(engine) else {
        return -1;
    };
    let Some(snapshot) = parse_snapshot(snapshot_json) else {
        return -2;
    };
    let engine_ref = unsafe { engine.as_ref() };
    if let Some(callbacks) = NonNull::new(callbacks as *mut TunnelCallbacks) {
        if engine_ref.install_callbacks(unsafe { *callbacks.as_ptr() }).is_err() {
            return -3;
        }
    }

    match engine_ref.start(snapshot) {
        Ok(_) => 0,
        Err(error) => {
            crate::logger::error(format!("tunnel_engine_start error: {error:?}"));
            -4
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn tunnel_engine_stop(engine: *mut TunnelEngine) {
    if let Some(engine) = NonNull::new(engine) {
        unsafe { engine.as_ref() }.stop();
    }
}

#[no_mangle]
pub unsafe extern "C" fn tunnel_engine_switch_configuration(
    engine: *mut TunnelEngine,
    snapshot_json: *const c_char,
) -> i32 {
    let Some(engine) = NonNull::new(engine) else {
        return -1;
    };
    let Some(snapshot) = parse_snapshot(snapshot_json) else {
        return -2;
    };
    let engine_ref = unsafe { engine.as_ref() };
    engine_ref
        .runtime
        .block_on(engine_ref.switch_configuration(snapshot, None));
    0
}

#[no_mangle]
pub unsafe extern "C" fn tunnel_engine_set_log_sink(
    sink: *const TunnelLogSink,
    level: *const c_char,
) -> bool {
    let sink_ref = unsafe { sink.as_ref() };
    let level_str = if level.is_null() {
        None
    } else {
        match unsafe { CStr::from_ptr(level) }.to_str() {
            Ok(value) => Some(value),
            Err(_) => None,
        }
    };
    crate::logger::install_sink(sink_ref, level_str).is_ok()
}

#[no_mangle]
pub extern "C" fn tunnel_engine_set_breadcrumb_mask(mask: u32) {
    crate::logger::set_breadcrumb_mask(mask);
}

#[no_mangle]
pub unsafe extern "C" fn tunnel_engine_handle_packet(
    engine: *mut TunnelEngine,
    packet: *const u8,
    length: usize,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    if packet.is_null() || length == 0 {
        return false;
    }
    // Safety: caller guarantees `packet` points to `length` bytes of readable memory.
    let slice = unsafe { slice::from_raw_parts(packet, length) };
    unsafe { engine.as_ref() }.handle_packet(slice)
}

#[no_mangle]
pub unsafe extern "C" fn tunnel_engine_get_counters(
    engine: *mut TunnelEngine,
    out: *mut FlowCounters,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    let Some(out) = (unsafe { out.as_mut() }) else {
        return false;
    };
    *out = unsafe { engine.as_ref() }.copy_counters();
    true
}

#[no_mangle]
pub unsafe extern "C" fn tunnel_engine_get_stats(engine: *mut TunnelEngine, out: *mut FlowStats) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    let Some(out) = (unsafe { out.as_mut() }) else {
        return false;
    };
    *out = unsafe { engine.as_ref() }.copy_stats();
    true
}

#[no_mangle]
pub extern "C" fn tunnel_engine_ensure_linked() -> bool {
    true
}
