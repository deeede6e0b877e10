//! Error taxonomy and state-facing error codes.
//!
//! Two layers: [`ErrorCode`] is the fixed public taxonomy the host sees
//! (stable codes, stable strings), [`EngineError`] is the internal error
//! type that carries source context and collapses onto a code at the
//! facade boundary.

use std::io;

// =============================================================================
// PUBLIC TAXONOMY
// =============================================================================

/// Classified connection errors. The "last error" of a connection holds
/// one of these and is sticky until the next successful `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success,
    InvalidParam,
    ConnectFailed,
    AuthFailed,
    SslHandshakeFailed,
    ProtocolMismatch,
    DhcpFailed,
    TunFailed,
    Timeout,
    NetworkError,
    OutOfMemory,
}

impl ErrorCode {
    /// Fixed human-readable string for this code.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::Success => "No error",
            ErrorCode::InvalidParam => "Invalid parameter",
            ErrorCode::ConnectFailed => "Connection failed",
            ErrorCode::AuthFailed => "Authentication failed",
            ErrorCode::SslHandshakeFailed => "TLS handshake failed",
            ErrorCode::ProtocolMismatch => "Protocol version mismatch",
            ErrorCode::DhcpFailed => "Network configuration failed",
            ErrorCode::TunFailed => "Tunnel device error",
            ErrorCode::Timeout => "Operation timed out",
            ErrorCode::NetworkError => "Network I/O error",
            ErrorCode::OutOfMemory => "Out of memory",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ErrorCode::Success)
    }
}

// =============================================================================
// INTERNAL ERROR TYPE
// =============================================================================

/// Engine-internal error. Every variant maps onto exactly one
/// [`ErrorCode`]; the io/TLS sources are kept for logging.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("connect failed: {0}")]
    ConnectFailed(#[source] io::Error),

    #[error("authentication rejected by server (status {0})")]
    AuthFailed(u32),

    #[error("TLS handshake failed: {0}")]
    SslHandshakeFailed(#[source] io::Error),

    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(&'static str),

    #[error("address assignment failed: {0}")]
    DhcpFailed(&'static str),

    #[error("tunnel descriptor error: {0}")]
    TunFailed(#[source] io::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("network I/O error: {0}")]
    Network(#[from] io::Error),

    #[error("not connected")]
    NotConnected,

    #[error("send queue full")]
    QueueFull,
}

impl EngineError {
    /// Collapse onto the public taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::InvalidParam(_) => ErrorCode::InvalidParam,
            EngineError::ConnectFailed(_) => ErrorCode::ConnectFailed,
            EngineError::AuthFailed(_) => ErrorCode::AuthFailed,
            EngineError::SslHandshakeFailed(_) => ErrorCode::SslHandshakeFailed,
            EngineError::ProtocolMismatch(_) => ErrorCode::ProtocolMismatch,
            EngineError::DhcpFailed(_) => ErrorCode::DhcpFailed,
            EngineError::TunFailed(_) => ErrorCode::TunFailed,
            EngineError::Timeout(_) => ErrorCode::Timeout,
            EngineError::Network(_) => ErrorCode::NetworkError,
            // Facade misuse surfaces as an invalid call, not a fault.
            EngineError::NotConnected => ErrorCode::NetworkError,
            EngineError::QueueFull => ErrorCode::NetworkError,
        }
    }
}
