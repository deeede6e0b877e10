//! Connection facade: create, connect, disconnect, send, receive,
//! statistics.
//!
//! A `Connection` owns the transport, the two packet queues and the
//! three session tasks. The handshake phase sequence and the idempotent
//! disconnect mirror the protocol contract; everything after `connect`
//! returns is driven by the session runtime and surfaced through the
//! event channel.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, ErrorCode};
use crate::handshake;
use crate::session::{self, SessionTasks, Shared};
use crate::transport;
use crate::types::{
    ConnState, ConnectParams, EngineEvent, NetworkConfig, CONNECT_TIMEOUT,
    EVENT_CHANNEL_CAPACITY, KEEPALIVE_INTERVAL, MAX_PAYLOAD_SIZE, SESSION_NONCE_SIZE,
};
use crate::tun::TunDevice;
use crate::wire::{FrameKind, Packet, ServerVersion};

type EngineStream = tokio_rustls::client::TlsStream<TcpStream>;

/// An SSL-VPN client connection.
///
/// Created in `Disconnected` with a fresh session identity; the nonce
/// is echoed in the hello and address-request payloads.
pub struct Connection {
    shared: Arc<Shared>,
    nonce: [u8; SESSION_NONCE_SIZE],
    session_key: u32,
    /// Host-provided tunnel descriptor; −1 while unset. Takes effect at
    /// the next `connect`.
    tunnel_fd: AtomicI32,
    /// Running session, present only between a successful `connect` and
    /// the matching `disconnect`. The tokio mutex also serializes
    /// connect/disconnect against each other.
    active: tokio::sync::Mutex<Option<SessionTasks<EngineStream>>>,
    /// Parameters of the last connect attempt, kept for `reconnect`.
    last_params: std::sync::Mutex<Option<ConnectParams>>,
}

impl Connection {
    /// Fresh connection plus the receiver for its engine events.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let mut nonce = [0u8; SESSION_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let session_key = OsRng.next_u32();

        debug!("connection created, nonce {}", hex::encode(&nonce[..8]));

        let conn = Arc::new(Self {
            shared: Arc::new(Shared::new(tx)),
            nonce,
            session_key,
            tunnel_fd: AtomicI32::new(-1),
            active: tokio::sync::Mutex::new(None),
            last_params: std::sync::Mutex::new(None),
        });
        (conn, rx)
    }

    // =========================================================================
    // CONNECT / DISCONNECT
    // =========================================================================

    /// Run the full connect sequence: TCP, TLS, hello, auth, address
    /// assignment, then start the session tasks.
    ///
    /// On failure the connection is left in `Error` with the sticky
    /// error code set and the transport torn down.
    pub async fn connect(&self, params: ConnectParams) -> Result<NetworkConfig, EngineError> {
        let mut active = self.active.lock().await;

        match self.shared.state() {
            ConnState::Disconnected | ConnState::Error => {}
            state => {
                return Err(EngineError::InvalidParam(format!(
                    "connect called in state {}",
                    state.as_str()
                )));
            }
        }

        if let Err(code) = params.validate() {
            self.fail_connect(code, "invalid connection parameters");
            return Err(EngineError::InvalidParam("parameter validation failed".into()));
        }

        // Entering a new attempt clears the sticky error.
        {
            let mut cell = self.shared.state.lock().unwrap();
            cell.state = ConnState::Connecting;
            cell.last_error = ErrorCode::Success;
            cell.network = None;
            cell.server_version = None;
        }
        self.shared.reset_halt();
        self.shared.send_queue.clear();
        self.shared.recv_queue.clear();

        info!(
            "connecting to {}:{} hub {:?}",
            params.server_host, params.server_port, params.hub
        );
        *self.last_params.lock().unwrap() = Some(params.clone());

        let mut stream = match self.establish(&params).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail_connect(e.code(), &e.to_string());
                return Err(e);
            }
        };

        let outcome = match handshake::run(&mut stream, &params, &self.nonce).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail_connect(e.code(), &e.to_string());
                return Err(e);
            }
        };

        let tun = match self.open_tun() {
            Ok(tun) => tun,
            Err(e) => {
                self.fail_connect(e.code(), &e.to_string());
                return Err(e);
            }
        };

        {
            let mut cell = self.shared.state.lock().unwrap();
            cell.network = Some(outcome.network);
            cell.server_version = Some(outcome.server_version);
        }
        self.shared.reset_stats();

        *active = Some(session::spawn(
            stream,
            self.shared.clone(),
            tun,
            params.mtu,
            KEEPALIVE_INTERVAL,
        ));

        self.shared.set_state(ConnState::Connected);
        self.shared.publish(EngineEvent::Connected(outcome.network));
        info!(
            "connected, session key {:08x}, client ip {}",
            self.session_key, outcome.network.client_ip
        );

        Ok(outcome.network)
    }

    async fn establish(&self, params: &ConnectParams) -> Result<EngineStream, EngineError> {
        let tcp =
            transport::connect_tcp(&params.server_host, params.server_port, CONNECT_TIMEOUT)
                .await?;
        transport::connect_tls(tcp, &params.server_host, params.verify_server_cert).await
    }

    fn open_tun(&self) -> Result<Option<TunDevice>, EngineError> {
        let fd = self.tunnel_fd.load(Ordering::Acquire);
        if fd < 0 {
            // No descriptor attached: DATA payloads flow through the
            // receive queue instead.
            return Ok(None);
        }
        TunDevice::new(fd).map(Some).map_err(EngineError::TunFailed)
    }

    fn fail_connect(&self, code: ErrorCode, message: &str) {
        warn!("connect failed: {message}");
        let mut cell = self.shared.state.lock().unwrap();
        cell.state = ConnState::Error;
        cell.last_error = code;
        drop(cell);
        self.shared
            .publish(EngineEvent::Error { code, message: message.to_string() });
    }

    /// Tear the connection down. Idempotent: repeat calls are no-ops,
    /// and at most one `DISCONNECT` frame is ever emitted.
    pub async fn disconnect(&self) {
        let mut active = self.active.lock().await;

        let prev_state = self.shared.state();
        if prev_state == ConnState::Disconnected && active.is_none() {
            return;
        }

        let was_connected = prev_state == ConnState::Connected;
        if was_connected {
            self.shared.set_state(ConnState::Disconnecting);
        }

        let Some(session) = active.take() else {
            self.shared.set_state(ConnState::Disconnected);
            return;
        };

        // Polite goodbye, only from an intact steady state.
        if was_connected {
            let mut writer = session.writer.lock().await;
            if let Err(e) =
                transport::send_frame(&mut *writer, FrameKind::Disconnect, 0, &[]).await
            {
                debug!("disconnect frame not delivered: {e}");
            }
        }

        self.shared.raise_halt();
        for task in session.tasks {
            if let Err(e) = task.await {
                debug!("session task join failed: {e}");
            }
        }

        // Drain politely: close_notify, then drop the stream.
        {
            let mut writer = session.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!("TLS shutdown: {e}");
            }
        }

        self.shared.send_queue.clear();
        self.shared.recv_queue.clear();

        let final_error = self.shared.last_error();
        self.shared.set_state(ConnState::Disconnected);
        if prev_state != ConnState::Disconnecting {
            self.shared.publish(EngineEvent::Disconnected {
                reason: if final_error.is_success() { 0 } else { 1 },
            });
        }
        info!("disconnected");
    }

    /// Tear down whatever is left of the previous attempt and connect
    /// again with the stored parameters.
    pub async fn reconnect(&self) -> Result<NetworkConfig, EngineError> {
        let Some(params) = self.last_params.lock().unwrap().clone() else {
            return Err(EngineError::InvalidParam("no stored connection parameters".into()));
        };
        self.disconnect().await;
        self.connect(params).await
    }

    // =========================================================================
    // DATA PATH (queue mode)
    // =========================================================================

    /// Enqueue application bytes as DATA frames, fragmenting oversized
    /// inputs. Never suspends; a full send queue is an error.
    pub fn send(&self, data: &[u8]) -> Result<usize, EngineError> {
        if !self.shared.state().is_connected() {
            return Err(EngineError::NotConnected);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let mut queued = 0usize;
        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            if self.shared.send_queue.try_push(Packet::data(chunk.to_vec())).is_err() {
                if queued == 0 {
                    return Err(EngineError::QueueFull);
                }
                break;
            }
            queued += chunk.len();
        }
        Ok(queued)
    }

    /// Copy the next received DATA payload into `buf`. Returns 0 when
    /// nothing is pending. Bytes beyond `buf.len()` are discarded.
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize, EngineError> {
        if !self.shared.state().is_connected() {
            return Err(EngineError::NotConnected);
        }
        match self.shared.recv_queue.try_pop() {
            None => Ok(0),
            Some(packet) => {
                let n = packet.payload.len().min(buf.len());
                buf[..n].copy_from_slice(&packet.payload[..n]);
                Ok(n)
            }
        }
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    pub fn set_tunnel_fd(&self, fd: RawFd) {
        self.tunnel_fd.store(fd, Ordering::Release);
    }

    pub fn state(&self) -> ConnState {
        self.shared.state()
    }

    pub fn last_error(&self) -> ErrorCode {
        self.shared.last_error()
    }

    pub fn network_config(&self) -> Option<NetworkConfig> {
        self.shared.state.lock().unwrap().network
    }

    pub fn server_version(&self) -> Option<ServerVersion> {
        self.shared.state.lock().unwrap().server_version
    }

    pub fn statistics(&self) -> crate::types::TransferStats {
        self.shared.stats()
    }

    pub fn reset_statistics(&self) {
        self.shared.reset_stats();
    }

    pub fn session_key(&self) -> u32 {
        self.session_key
    }

    pub fn session_nonce(&self) -> &[u8; SESSION_NONCE_SIZE] {
        &self.nonce
    }
}

/// Connectivity probe: full transport + handshake, a polite goodbye,
/// no session runtime and no tunnel descriptor. Used by the bridge's
/// `test_connect`.
pub async fn probe(params: &ConnectParams) -> Result<NetworkConfig, EngineError> {
    params
        .validate()
        .map_err(|_| EngineError::InvalidParam("parameter validation failed".into()))?;

    let tcp =
        transport::connect_tcp(&params.server_host, params.server_port, CONNECT_TIMEOUT).await?;
    let mut stream =
        transport::connect_tls(tcp, &params.server_host, params.verify_server_cert).await?;

    let mut nonce = [0u8; SESSION_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let outcome = handshake::run(&mut stream, params, &nonce).await?;

    if let Err(e) = transport::send_frame(&mut stream, FrameKind::Disconnect, 0, &[]).await {
        debug!("probe disconnect frame not delivered: {e}");
    }
    let _ = stream.shutdown().await;

    Ok(outcome.network)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_connection_invariants() {
        let (conn, _rx) = Connection::new();
        assert_eq!(conn.state(), ConnState::Disconnected);
        assert_eq!(conn.last_error(), ErrorCode::Success);
        assert!(conn.network_config().is_none());
    }

    #[tokio::test]
    async fn nonces_differ_between_connections() {
        let (a, _rx_a) = Connection::new();
        let (b, _rx_b) = Connection::new();
        assert_ne!(a.session_nonce(), b.session_nonce());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_when_never_connected() {
        let (conn, _rx) = Connection::new();
        conn.disconnect().await;
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnState::Disconnected);
    }

    #[tokio::test]
    async fn send_receive_require_connected() {
        let (conn, _rx) = Connection::new();
        assert!(matches!(conn.send(b"x"), Err(EngineError::NotConnected)));
        let mut buf = [0u8; 16];
        assert!(matches!(conn.receive(&mut buf), Err(EngineError::NotConnected)));
    }

    #[tokio::test]
    async fn invalid_params_set_sticky_error() {
        let (conn, _rx) = Connection::new();
        let mut params = ConnectParams::new("", 443, "HUB", "u", "p");
        params.server_host.clear();
        assert!(conn.connect(params).await.is_err());
        assert_eq!(conn.state(), ConnState::Error);
        assert_eq!(conn.last_error(), ErrorCode::InvalidParam);
    }

    #[tokio::test]
    async fn connect_refused_leaves_error_state() {
        let (conn, mut rx) = Connection::new();
        // Port 1 on loopback: refused immediately on any sane host.
        let params = ConnectParams::new("127.0.0.1", 1, "HUB", "u", "p");
        let err = conn.connect(params).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectFailed);
        assert_eq!(conn.state(), ConnState::Error);
        assert_eq!(conn.last_error(), ErrorCode::ConnectFailed);
        assert!(matches!(rx.recv().await, Some(EngineEvent::Error { .. })));

        // Sticky until the next connect attempt resets it.
        conn.disconnect().await;
        assert_eq!(conn.last_error(), ErrorCode::ConnectFailed);
    }

    #[tokio::test]
    async fn reconnect_without_history_fails() {
        let (conn, _rx) = Connection::new();
        let err = conn.reconnect().await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidParam(_)));
    }

    #[tokio::test]
    async fn statistics_reset_moves_session_start() {
        let (conn, _rx) = Connection::new();
        let before = conn.statistics();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        conn.reset_statistics();
        let after = conn.statistics();
        assert!(after.session_start_ms >= before.session_start_ms);
        assert_eq!(after.bytes_sent, 0);
    }
}
