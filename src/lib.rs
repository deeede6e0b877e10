//! STVP engine: SSL-VPN client connection core for Android hosts.
//!
//! The engine performs a layered connect (TCP, TLS, `STVP` hello,
//! credential authentication, address assignment) and then pumps
//! packets between a host-provided tunnel descriptor and the encrypted
//! control channel, with a keepalive heartbeat and an event stream for
//! the host. Hosts drive it through the opaque handles in [`bridge`];
//! Android specifically goes through the JNI shims in `android`.

pub mod bridge;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod queue;
pub mod session;
pub mod transport;
pub mod tun;
pub mod types;
pub mod wire;

#[cfg(target_os = "android")]
pub mod android;

// Re-exports
pub use bridge::{host_error_code, host_state_code, HostCallbacks};
pub use connection::{probe, Connection};
pub use error::{EngineError, ErrorCode};
pub use queue::PacketQueue;
pub use tun::TunDevice;
pub use types::{
    ConnState, ConnectParams, EngineEvent, NetworkConfig, TransferStats, DEFAULT_MTU,
    DEFAULT_QUEUE_CAPACITY, FRAME_HEADER_SIZE, HELLO_SIGNATURE, HELLO_SIZE, KEEPALIVE_INTERVAL,
    MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, SESSION_NONCE_SIZE,
};
pub use wire::{FrameHeader, FrameKind, Packet, ServerVersion, WireError};
