//! Session runtime: ingress, egress and keepalive tasks.
//!
//! Once the handshake completes, the TLS stream is split and three
//! cooperating tasks run until the halt signal is raised: ingress moves
//! server DATA frames to the tunnel descriptor, egress frames outgoing
//! tunnel packets (and facade-queued packets) onto the wire, keepalive
//! heartbeats every few seconds. A fatal fault in any task parks the
//! connection in the error state; the ingress task is the one that
//! observes a dead link.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ErrorCode;
use crate::queue::PacketQueue;
use crate::transport::{recv_frame, send_frame};
use crate::tun::TunDevice;
use crate::types::{
    now_ms, ConnState, EngineEvent, NetworkConfig, TransferStats, EGRESS_IDLE_SLEEP,
    HALT_POLL_INTERVAL, MAX_PAYLOAD_SIZE,
};
use crate::wire::{FrameKind, Packet, ServerVersion};

// =============================================================================
// SHARED CONNECTION STATE
// =============================================================================

/// State guarded by the connection mutex.
#[derive(Debug)]
pub(crate) struct StateCell {
    pub state: ConnState,
    pub last_error: ErrorCode,
    pub network: Option<NetworkConfig>,
    pub server_version: Option<ServerVersion>,
}

/// Traffic counters. Atomics so the pump tasks never contend with
/// facade readers; observers see monotone values.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub errors: AtomicU64,
    pub session_start_ms: AtomicU64,
}

/// State shared between the facade and the three session tasks.
pub(crate) struct Shared {
    pub state: Mutex<StateCell>,
    /// Cancellation flag, read without the lock on every loop iteration.
    halt: AtomicBool,
    /// Wakes tasks parked in I/O or sleeps so halt is observed promptly.
    pub halt_notify: Notify,
    pub send_queue: PacketQueue,
    pub recv_queue: PacketQueue,
    pub counters: Counters,
    events: mpsc::Sender<EngineEvent>,
}

impl Shared {
    pub fn new(events: mpsc::Sender<EngineEvent>) -> Self {
        let shared = Self {
            state: Mutex::new(StateCell {
                state: ConnState::Disconnected,
                last_error: ErrorCode::Success,
                network: None,
                server_version: None,
            }),
            halt: AtomicBool::new(false),
            halt_notify: Notify::new(),
            send_queue: PacketQueue::new(),
            recv_queue: PacketQueue::new(),
            counters: Counters::default(),
            events,
        };
        shared.counters.session_start_ms.store(now_ms(), Ordering::Relaxed);
        shared
    }

    pub fn halted(&self) -> bool {
        self.halt.load(Ordering::Acquire)
    }

    pub fn raise_halt(&self) {
        self.halt.store(true, Ordering::Release);
        self.halt_notify.notify_waiters();
    }

    pub fn reset_halt(&self) {
        self.halt.store(false, Ordering::Release);
    }

    pub fn state(&self) -> ConnState {
        self.state.lock().unwrap().state
    }

    pub fn set_state(&self, state: ConnState) {
        let mut cell = self.state.lock().unwrap();
        debug!("state {} -> {}", cell.state.as_str(), state.as_str());
        cell.state = state;
    }

    pub fn last_error(&self) -> ErrorCode {
        self.state.lock().unwrap().last_error
    }

    /// Record a fatal fault: error state, sticky code, host notification.
    /// The first fault wins; later ones only bump the error counter.
    pub fn fail(&self, code: ErrorCode, message: &str) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        {
            let mut cell = self.state.lock().unwrap();
            if cell.state == ConnState::Error {
                return;
            }
            cell.state = ConnState::Error;
            cell.last_error = code;
        }
        warn!("connection fault: {} ({})", message, code.message());
        self.publish(EngineEvent::Error { code, message: message.to_string() });
        self.raise_halt();
    }

    /// Best-effort event delivery; a slow host loses events rather than
    /// stalling the pump.
    pub fn publish(&self, event: EngineEvent) {
        if self.events.try_send(event).is_err() {
            debug!("event channel full, dropping event");
        }
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            session_start_ms: self.counters.session_start_ms.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.counters.bytes_sent.store(0, Ordering::Relaxed);
        self.counters.bytes_received.store(0, Ordering::Relaxed);
        self.counters.packets_sent.store(0, Ordering::Relaxed);
        self.counters.packets_received.store(0, Ordering::Relaxed);
        self.counters.errors.store(0, Ordering::Relaxed);
        self.counters.session_start_ms.store(now_ms(), Ordering::Relaxed);
    }
}

// =============================================================================
// TASK SPAWN
// =============================================================================

pub(crate) type SharedWriter<S> = Arc<tokio::sync::Mutex<WriteHalf<S>>>;

/// Handles to a running session.
pub(crate) struct SessionTasks<S> {
    pub tasks: Vec<JoinHandle<()>>,
    pub writer: SharedWriter<S>,
}

/// Split the stream and start the three session tasks.
pub(crate) fn spawn<S>(
    stream: S,
    shared: Arc<Shared>,
    tun: Option<TunDevice>,
    mtu: u16,
    keepalive_interval: Duration,
) -> SessionTasks<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let writer: SharedWriter<S> = Arc::new(tokio::sync::Mutex::new(writer));
    let tun = tun.map(Arc::new);

    let tasks = vec![
        tokio::spawn(ingress(reader, shared.clone(), tun.clone())),
        tokio::spawn(egress(writer.clone(), shared.clone(), tun, mtu)),
        tokio::spawn(keepalive(writer.clone(), shared, keepalive_interval)),
    ];

    SessionTasks { tasks, writer }
}

// =============================================================================
// INGRESS
// =============================================================================

/// Read frames from the wire and dispatch by kind.
async fn ingress<S>(mut reader: ReadHalf<S>, shared: Arc<Shared>, tun: Option<Arc<TunDevice>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        if shared.halted() {
            break;
        }

        let result = tokio::select! {
            r = recv_frame(&mut reader) => r,
            _ = shared.halt_notify.notified() => break,
        };

        let (header, payload) = match result {
            Ok(frame) => frame,
            Err(e) => {
                if !shared.halted() {
                    shared.fail(ErrorCode::NetworkError, &format!("read failed: {e}"));
                }
                break;
            }
        };

        match header.kind {
            FrameKind::Data => {
                shared.counters.bytes_received.fetch_add(payload.len() as u64, Ordering::Relaxed);
                shared.counters.packets_received.fetch_add(1, Ordering::Relaxed);
                deliver(&shared, tun.as_deref(), payload);
            }
            // Server heartbeat, nothing to do.
            FrameKind::Keepalive => {}
            FrameKind::Disconnect => {
                debug!("server requested disconnect");
                shared.set_state(ConnState::Disconnecting);
                shared.publish(EngineEvent::Disconnected { reason: 1 });
                shared.raise_halt();
                break;
            }
            other => {
                debug!("dropping unexpected {} frame ({} bytes)", other.name(), payload.len());
            }
        }
    }
}

/// Hand an incoming packet to the tunnel interface, or to the receive
/// queue when no descriptor is attached.
fn deliver(shared: &Shared, tun: Option<&TunDevice>, payload: Vec<u8>) {
    match tun {
        Some(dev) => match dev.write(&payload) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // Interface queue full: drop, as the platform would.
                shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                debug!("tunnel write would block, dropping {} bytes", payload.len());
            }
            Err(e) => {
                shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                debug!("tunnel write failed: {e}");
            }
        },
        None => {
            if shared.recv_queue.try_push(Packet::data(payload)).is_err() {
                shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                debug!("receive queue full, dropping packet");
            }
        }
    }
}

// =============================================================================
// EGRESS
// =============================================================================

/// Move facade-queued packets and tunnel reads onto the wire.
async fn egress<S>(
    writer: SharedWriter<S>,
    shared: Arc<Shared>,
    tun: Option<Arc<TunDevice>>,
    mtu: u16,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let read_size = (mtu as usize).min(MAX_PAYLOAD_SIZE);
    let mut buf = vec![0u8; read_size];

    loop {
        if shared.halted() {
            break;
        }

        let mut did_work = false;

        while let Some(packet) = shared.send_queue.try_pop() {
            if !emit(&writer, &shared, packet.kind, packet.flags, &packet.payload).await {
                return;
            }
            did_work = true;
        }

        if let Some(dev) = tun.as_deref() {
            match dev.read(&mut buf) {
                Ok(Some(n)) => {
                    if !emit(&writer, &shared, FrameKind::Data, 0, &buf[..n]).await {
                        return;
                    }
                    did_work = true;
                }
                Ok(None) => {}
                Err(e) => {
                    shared.fail(ErrorCode::TunFailed, &format!("tunnel read failed: {e}"));
                    return;
                }
            }
        }

        if !did_work {
            tokio::select! {
                _ = tokio::time::sleep(EGRESS_IDLE_SLEEP) => {}
                _ = shared.halt_notify.notified() => break,
            }
        }
    }
}

/// Write one frame, updating counters. Returns false on a fatal fault.
async fn emit<S>(
    writer: &SharedWriter<S>,
    shared: &Shared,
    kind: FrameKind,
    flags: u32,
    payload: &[u8],
) -> bool
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut w = writer.lock().await;
    match send_frame(&mut *w, kind, flags, payload).await {
        Ok(()) => {
            shared.counters.bytes_sent.fetch_add(payload.len() as u64, Ordering::Relaxed);
            shared.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
            true
        }
        Err(e) => {
            if !shared.halted() {
                shared.fail(ErrorCode::NetworkError, &format!("write failed: {e}"));
            }
            false
        }
    }
}

// =============================================================================
// KEEPALIVE
// =============================================================================

/// Emit an empty KEEPALIVE frame on a fixed cadence, sliced into short
/// waits so the halt signal is observed within [`HALT_POLL_INTERVAL`].
/// Each cycle also publishes the cumulative traffic counters.
async fn keepalive<S>(writer: SharedWriter<S>, shared: Arc<Shared>, interval: Duration)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        let mut waited = Duration::ZERO;
        while waited < interval {
            if shared.halted() {
                return;
            }
            let slice = HALT_POLL_INTERVAL.min(interval - waited);
            tokio::select! {
                _ = tokio::time::sleep(slice) => {}
                _ = shared.halt_notify.notified() => return,
            }
            waited += slice;
        }
        if shared.halted() {
            return;
        }

        {
            let mut w = writer.lock().await;
            if let Err(e) = send_frame(&mut *w, FrameKind::Keepalive, 0, &[]).await {
                // Ingress observes the dead link and reports it.
                debug!("keepalive write failed: {e}");
                return;
            }
        }
        shared.counters.packets_sent.fetch_add(1, Ordering::Relaxed);

        let stats = shared.stats();
        shared.publish(EngineEvent::BytesTransferred {
            sent: stats.bytes_sent,
            received: stats.bytes_received,
        });
    }
}
