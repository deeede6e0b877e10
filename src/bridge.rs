//! Handle bridge: the host-facing API.
//!
//! The host runtime drives connections through opaque `i64` handles and
//! receives events through registered callbacks. One process-wide
//! registry, created on first use, owns the tokio runtime the engine
//! runs on; it is the only global in the crate. Every function here may
//! be called from any host thread, but not from inside a callback (they
//! block on the engine runtime).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connection::{self, Connection};
use crate::error::ErrorCode;
use crate::types::{ConnState, ConnectParams, EngineEvent};

// =============================================================================
// HOST CALLBACKS
// =============================================================================

/// Callbacks delivered to the host. Invoked from engine-owned threads;
/// the host side must be safe under that (the JNI adapter attaches the
/// thread to the VM before every call).
pub trait HostCallbacks: Send + Sync {
    /// Handshake finished; addresses as dotted-quad strings.
    fn on_connection_established(&self, client_ip: &str, subnet_mask: &str, primary_dns: &str);
    fn on_disconnected(&self, reason: i32);
    fn on_error(&self, code: i32, message: &str);
    fn on_bytes_transferred(&self, sent: u64, received: u64);
}

// =============================================================================
// CODE MAPPINGS (public contract)
// =============================================================================

/// Engine error code to host numeric constant.
pub fn host_error_code(code: ErrorCode) -> i32 {
    match code {
        ErrorCode::Success => 0,
        ErrorCode::ConnectFailed => 1,
        ErrorCode::AuthFailed => 2,
        ErrorCode::SslHandshakeFailed => 3,
        ErrorCode::DhcpFailed => 4,
        ErrorCode::TunFailed => 5,
        // Everything else collapses onto the generic connect failure.
        _ => 1,
    }
}

/// Engine state to host numeric constant.
pub fn host_state_code(state: ConnState) -> i32 {
    match state {
        ConnState::Disconnected => 0,
        ConnState::Connecting => 1,
        ConnState::Connected => 2,
        ConnState::Disconnecting => 3,
        ConnState::Error => 4,
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

type SharedCallbacks = Arc<RwLock<Option<Arc<dyn HostCallbacks>>>>;

struct HandleEntry {
    conn: Arc<Connection>,
    callbacks: SharedCallbacks,
    pump: JoinHandle<()>,
}

struct Bridge {
    runtime: tokio::runtime::Runtime,
    handles: Mutex<HashMap<i64, HandleEntry>>,
    next_handle: AtomicI64,
}

fn bridge() -> &'static Bridge {
    static BRIDGE: OnceLock<Bridge> = OnceLock::new();
    BRIDGE.get_or_init(|| {
        // Idempotent: a host test harness may have installed one.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("stvp-engine")
            .enable_all()
            .build()
            .expect("engine runtime");

        info!("engine bridge initialized");
        Bridge {
            runtime,
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicI64::new(1),
        }
    })
}

fn with_conn<T>(handle: i64, f: impl FnOnce(&Arc<Connection>) -> T) -> Option<T> {
    let handles = bridge().handles.lock().unwrap();
    handles.get(&handle).map(|entry| f(&entry.conn))
}

/// Route one engine event to the registered callbacks.
fn dispatch(callbacks: &SharedCallbacks, event: EngineEvent) {
    // Clone out of the lock so a callback may re-register safely.
    let cb = callbacks.read().unwrap().clone();
    let Some(cb) = cb else { return };
    match event {
        EngineEvent::Connected(config) => cb.on_connection_established(
            &config.client_ip.to_string(),
            &config.subnet_mask.to_string(),
            &config.dns1.to_string(),
        ),
        EngineEvent::Disconnected { reason } => cb.on_disconnected(reason),
        EngineEvent::Error { code, message } => cb.on_error(host_error_code(code), &message),
        EngineEvent::BytesTransferred { sent, received } => {
            cb.on_bytes_transferred(sent, received)
        }
    }
}

// =============================================================================
// PUBLIC HANDLE API
// =============================================================================

/// Create a connection and return its handle.
pub fn init() -> i64 {
    let bridge = bridge();
    let (conn, rx) = Connection::new();
    let handle = bridge.next_handle.fetch_add(1, Ordering::Relaxed);

    let callbacks: SharedCallbacks = Arc::new(RwLock::new(None));
    let pump = bridge.runtime.spawn(pump_events(rx, callbacks.clone()));

    bridge
        .handles
        .lock()
        .unwrap()
        .insert(handle, HandleEntry { conn, callbacks, pump });

    debug!("handle {handle} created");
    handle
}

async fn pump_events(mut rx: mpsc::Receiver<EngineEvent>, callbacks: SharedCallbacks) {
    while let Some(event) = rx.recv().await {
        dispatch(&callbacks, event);
    }
}

/// Register (or replace) the callback sink for a handle.
pub fn set_callbacks(handle: i64, cb: Arc<dyn HostCallbacks>) -> bool {
    let handles = bridge().handles.lock().unwrap();
    match handles.get(&handle) {
        Some(entry) => {
            *entry.callbacks.write().unwrap() = Some(cb);
            true
        }
        None => false,
    }
}

/// Disconnect, detach callbacks and destroy the handle.
pub fn cleanup(handle: i64) {
    let entry = bridge().handles.lock().unwrap().remove(&handle);
    if let Some(entry) = entry {
        bridge().runtime.block_on(entry.conn.disconnect());
        *entry.callbacks.write().unwrap() = None;
        entry.pump.abort();
        debug!("handle {handle} destroyed");
    }
}

/// Full connect. Returns `true` on success; on failure the error is
/// queryable via `get_last_error` / `get_error_string`.
#[allow(clippy::too_many_arguments)]
pub fn connect(
    handle: i64,
    server_host: &str,
    server_port: u16,
    hub: &str,
    username: &str,
    password: &str,
    use_encrypt: bool,
    use_compress: bool,
    verify_cert: bool,
    tunnel_fd: i32,
) -> bool {
    let Some(conn) = with_conn(handle, Arc::clone) else {
        return false;
    };

    let mut params = ConnectParams::new(server_host, server_port, hub, username, password);
    params.use_encrypt = use_encrypt;
    params.use_compress = use_compress;
    params.verify_server_cert = verify_cert;

    conn.set_tunnel_fd(tunnel_fd);
    bridge().runtime.block_on(conn.connect(params)).is_ok()
}

pub fn disconnect(handle: i64) {
    if let Some(conn) = with_conn(handle, Arc::clone) {
        bridge().runtime.block_on(conn.disconnect());
    }
}

/// Host state code for the handle; unknown handles read as disconnected.
pub fn get_status(handle: i64) -> i32 {
    with_conn(handle, |conn| host_state_code(conn.state())).unwrap_or(0)
}

/// Cumulative (bytes_sent, bytes_received).
pub fn get_statistics(handle: i64) -> (u64, u64) {
    with_conn(handle, |conn| {
        let stats = conn.statistics();
        (stats.bytes_sent, stats.bytes_received)
    })
    .unwrap_or((0, 0))
}

pub fn get_last_error(handle: i64) -> i32 {
    with_conn(handle, |conn| host_error_code(conn.last_error())).unwrap_or(0)
}

pub fn get_error_string(handle: i64) -> &'static str {
    with_conn(handle, |conn| conn.last_error().message()).unwrap_or(ErrorCode::Success.message())
}

/// Connectivity probe: transport + handshake + polite goodbye, no
/// session and no tunnel. Skips the certificate chain check, since the
/// servers this diagnoses overwhelmingly run self-signed certificates.
pub fn test_connect(
    server_host: &str,
    server_port: u16,
    hub: &str,
    username: &str,
    password: &str,
) -> i32 {
    let mut params = ConnectParams::new(server_host, server_port, hub, username, password);
    params.verify_server_cert = false;

    match bridge().runtime.block_on(connection::probe(&params)) {
        Ok(_) => host_error_code(ErrorCode::Success),
        Err(e) => host_error_code(e.code()),
    }
}

/// Marshaling smoke test: returns the input unchanged.
pub fn test_echo(text: &str) -> String {
    text.to_owned()
}
