//! Engine constants and shared types.
//!
//! # Design Goals
//!
//! 1. **Bounded memory usage**: frame payloads and queues have explicit
//!    size limits; a misbehaving server cannot make the engine allocate
//!    unboundedly.
//!
//! 2. **Responsive cancellation**: every periodic wait is sliced so the
//!    halt signal is observed within [`HALT_POLL_INTERVAL`], keeping the
//!    disconnect-to-idle latency under 200 ms.
//!
//! 3. **One source of truth**: the codec, handshake and session layers
//!    all reference the constants here. Size limits are not hardcoded
//!    elsewhere.

use std::net::Ipv4Addr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::error::ErrorCode;

/// Milliseconds on the engine's monotonic clock. The origin is the
/// first call in the process; only differences are meaningful.
pub fn now_ms() -> u64 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    ORIGIN.get_or_init(Instant::now).elapsed().as_millis() as u64
}

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Magic bytes opening the 64-byte hello block.
/// Prevents cross-talk with anything else answering on the port.
pub const HELLO_SIGNATURE: [u8; 4] = *b"STVP";

/// Size of the hello block exchanged in both directions.
pub const HELLO_SIZE: usize = 64;

/// Client protocol version advertised in the hello block.
pub const CLIENT_VERSION_MAJOR: u8 = 4;
pub const CLIENT_VERSION_MINOR: u8 = 0;
pub const CLIENT_VERSION_BUILD: u16 = 0;

/// Session nonce length. Generated from the OS CSPRNG at connection
/// creation and echoed in the hello and address-request payloads.
pub const SESSION_NONCE_SIZE: usize = 16;

// =============================================================================
// FRAME SIZE LIMITS
// =============================================================================

/// Fixed wire header: `kind:u32 | flags:u32 | payload_len:u32`, big endian.
pub const FRAME_HEADER_SIZE: usize = 12;

/// Maximum payload carried by a single frame (64 KB).
pub const MAX_PAYLOAD_SIZE: usize = 65_536;

/// Maximum total frame size on the wire.
pub const MAX_FRAME_SIZE: usize = FRAME_HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// Maximum length of any string connection parameter (host, hub,
/// username, password).
pub const MAX_PARAM_STRING: usize = 255;

// =============================================================================
// QUEUES
// =============================================================================

/// Default capacity of the send and receive packet queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Capacity of the engine event channel feeding host callbacks.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// TIMEOUTS AND CADENCES
// =============================================================================

/// TCP connect deadline. Enforced with a poll-style wait, never a
/// blocking connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for each of the hello and authentication exchanges.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the address-assignment exchange.
pub const DHCP_TIMEOUT: Duration = Duration::from_secs(30);

/// Keepalive emission cadence.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Slice length for interruptible waits. Bounds the halt-observation
/// latency of the keepalive task.
pub const HALT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Egress backoff when neither the tunnel fd nor the send queue has
/// data. Short enough to keep added latency negligible.
pub const EGRESS_IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Socket send/receive buffer size requested from the kernel (64 KB).
pub const SOCKET_BUFFER_SIZE: usize = 64 * 1024;

/// Default MTU assumed when the host does not supply one. Leaves room
/// for the outer TLS and frame overhead on a 1500-byte path.
pub const DEFAULT_MTU: u16 = 1400;

// =============================================================================
// CONNECTION STATE
// =============================================================================

/// Connection lifecycle state.
///
/// Transitions are monotone through the handshake phases; `Error` and
/// `Disconnected` are the only sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Disconnected => "DISCONNECTED",
            ConnState::Connecting => "CONNECTING",
            ConnState::Connected => "CONNECTED",
            ConnState::Disconnecting => "DISCONNECTING",
            ConnState::Error => "ERROR",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnState::Connected)
    }
}

// =============================================================================
// CONNECTION PARAMETERS
// =============================================================================

/// Inputs to `connect`. Immutable once the handshake starts.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub server_host: String,
    pub server_port: u16,
    pub hub: String,
    pub username: String,
    pub password: String,
    pub use_encrypt: bool,
    pub use_compress: bool,
    pub verify_server_cert: bool,
    pub mtu: u16,
}

impl ConnectParams {
    pub fn new(
        server_host: impl Into<String>,
        server_port: u16,
        hub: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            server_host: server_host.into(),
            server_port,
            hub: hub.into(),
            username: username.into(),
            password: password.into(),
            use_encrypt: true,
            use_compress: false,
            verify_server_cert: true,
            mtu: DEFAULT_MTU,
        }
    }

    /// Reject parameters the handshake cannot carry.
    pub fn validate(&self) -> Result<(), ErrorCode> {
        if self.server_host.is_empty() || self.server_port == 0 {
            return Err(ErrorCode::InvalidParam);
        }
        for s in [&self.server_host, &self.hub, &self.username, &self.password] {
            if s.len() > MAX_PARAM_STRING {
                return Err(ErrorCode::InvalidParam);
            }
        }
        if self.mtu == 0 {
            return Err(ErrorCode::InvalidParam);
        }
        Ok(())
    }
}

// =============================================================================
// NEGOTIATED NETWORK CONFIGURATION
// =============================================================================

/// Addresses assigned by the server during the DHCP-style exchange.
///
/// `dns2`, `dhcp_server` and `lease_secs` are optional on the wire and
/// stay at their zero defaults when the server sends the short form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkConfig {
    pub client_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns1: Ipv4Addr,
    pub dns2: Ipv4Addr,
    pub dhcp_server: Ipv4Addr,
    pub lease_secs: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            client_ip: Ipv4Addr::UNSPECIFIED,
            subnet_mask: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
            dns1: Ipv4Addr::UNSPECIFIED,
            dns2: Ipv4Addr::UNSPECIFIED,
            dhcp_server: Ipv4Addr::UNSPECIFIED,
            lease_secs: 0,
        }
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Point-in-time snapshot of the connection counters.
///
/// All counters are monotone non-decreasing between `reset_statistics`
/// calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub errors: u64,
    /// Session start, milliseconds on the engine's monotonic clock.
    pub session_start_ms: u64,
}

// =============================================================================
// ENGINE EVENTS
// =============================================================================

/// Events published by the session runtime and routed to host callbacks
/// by the bridge.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Handshake completed; the tunnel is up.
    Connected(NetworkConfig),
    /// Clean or server-initiated teardown. `reason` uses the host error
    /// code space (0 = requested by the host).
    Disconnected { reason: i32 },
    /// Fatal fault; the connection is in the error state.
    Error { code: ErrorCode, message: String },
    /// Cumulative traffic counters, published on the keepalive cadence.
    BytesTransferred { sent: u64, received: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_validation() {
        let params = ConnectParams::new("vpn.example.org", 443, "HUB", "user", "pass");
        assert!(params.validate().is_ok());

        let mut bad = params.clone();
        bad.server_host.clear();
        assert_eq!(bad.validate(), Err(ErrorCode::InvalidParam));

        let mut bad = params.clone();
        bad.server_port = 0;
        assert_eq!(bad.validate(), Err(ErrorCode::InvalidParam));

        let mut bad = params.clone();
        bad.username = "u".repeat(MAX_PARAM_STRING + 1);
        assert_eq!(bad.validate(), Err(ErrorCode::InvalidParam));

        let mut bad = params;
        bad.mtu = 0;
        assert_eq!(bad.validate(), Err(ErrorCode::InvalidParam));
    }

    #[test]
    fn state_names() {
        assert_eq!(ConnState::Disconnected.as_str(), "DISCONNECTED");
        assert_eq!(ConnState::Error.as_str(), "ERROR");
        assert!(ConnState::Connected.is_connected());
        assert!(!ConnState::Disconnecting.is_connected());
    }
}
