//! Wire codec: the 12-byte frame header and the 64-byte hello block.
//!
//! Every frame is `kind:u32 | flags:u32 | payload_len:u32` (big endian,
//! no padding, no trailing checksum; integrity is TLS's job) followed by
//! `payload_len` raw bytes. Short input is a recoverable condition at
//! this layer: the transport retries until the byte count is satisfied.

use crate::types::{
    CLIENT_VERSION_BUILD, CLIENT_VERSION_MAJOR, CLIENT_VERSION_MINOR, FRAME_HEADER_SIZE,
    HELLO_SIGNATURE, HELLO_SIZE, MAX_PAYLOAD_SIZE, SESSION_NONCE_SIZE,
};

// =============================================================================
// FRAME KINDS
// =============================================================================

/// Frame discriminator. The known kinds plus a catchall for anything a
/// newer server might emit; unknown kinds are logged and dropped by the
/// session runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Control,
    Keepalive,
    AuthRequest,
    AuthResponse,
    AuthChallenge,
    DhcpRequest,
    DhcpResponse,
    Disconnect,
    Unknown(u32),
}

impl FrameKind {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0x0001 => FrameKind::Data,
            0x0002 => FrameKind::Control,
            0x0003 => FrameKind::Keepalive,
            0x0010 => FrameKind::AuthRequest,
            0x0011 => FrameKind::AuthResponse,
            0x0012 => FrameKind::AuthChallenge,
            0x0020 => FrameKind::DhcpRequest,
            0x0021 => FrameKind::DhcpResponse,
            0x00FF => FrameKind::Disconnect,
            other => FrameKind::Unknown(other),
        }
    }

    pub fn raw(&self) -> u32 {
        match self {
            FrameKind::Data => 0x0001,
            FrameKind::Control => 0x0002,
            FrameKind::Keepalive => 0x0003,
            FrameKind::AuthRequest => 0x0010,
            FrameKind::AuthResponse => 0x0011,
            FrameKind::AuthChallenge => 0x0012,
            FrameKind::DhcpRequest => 0x0020,
            FrameKind::DhcpResponse => 0x0021,
            FrameKind::Disconnect => 0x00FF,
            FrameKind::Unknown(raw) => *raw,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FrameKind::Data => "DATA",
            FrameKind::Control => "CONTROL",
            FrameKind::Keepalive => "KEEPALIVE",
            FrameKind::AuthRequest => "AUTH_REQUEST",
            FrameKind::AuthResponse => "AUTH_RESPONSE",
            FrameKind::AuthChallenge => "AUTH_CHALLENGE",
            FrameKind::DhcpRequest => "DHCP_REQUEST",
            FrameKind::DhcpResponse => "DHCP_RESPONSE",
            FrameKind::Disconnect => "DISCONNECT",
            FrameKind::Unknown(_) => "UNKNOWN",
        }
    }
}

// =============================================================================
// HEADER AND PACKET
// =============================================================================

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub flags: u32,
    pub payload_len: u32,
}

/// An owned frame in flight between the facade, the queues and the
/// session tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: FrameKind,
    pub flags: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn data(payload: Vec<u8>) -> Self {
        Self { kind: FrameKind::Data, flags: 0, payload }
    }
}

// =============================================================================
// CODEC ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("payload too large: {0} > {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(usize),

    #[error("buffer too short: need {need}, have {have}")]
    ShortBuffer { need: usize, have: usize },

    #[error("bad hello signature")]
    BadSignature,
}

// =============================================================================
// FRAME CODEC
// =============================================================================

/// Serialize a frame. Fails fast on oversized payloads; fragmenting is
/// the caller's job.
pub fn encode_frame(kind: FrameKind, flags: u32, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&kind.raw().to_be_bytes());
    buf.extend_from_slice(&flags.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Encode just the 12-byte header.
pub fn encode_header(kind: FrameKind, flags: u32, payload_len: u32) -> [u8; FRAME_HEADER_SIZE] {
    let mut buf = [0u8; FRAME_HEADER_SIZE];
    buf[0..4].copy_from_slice(&kind.raw().to_be_bytes());
    buf[4..8].copy_from_slice(&flags.to_be_bytes());
    buf[8..12].copy_from_slice(&payload_len.to_be_bytes());
    buf
}

/// Decode a header from the first 12 bytes of `buf`.
pub fn decode_header(buf: &[u8]) -> Result<FrameHeader, WireError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(WireError::ShortBuffer { need: FRAME_HEADER_SIZE, have: buf.len() });
    }
    let kind = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let flags = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
    Ok(FrameHeader { kind: FrameKind::from_raw(kind), flags, payload_len })
}

/// Decode a full frame, returning the header and a borrowed payload view.
pub fn decode_frame(buf: &[u8]) -> Result<(FrameHeader, &[u8]), WireError> {
    let header = decode_header(buf)?;
    let total = FRAME_HEADER_SIZE + header.payload_len as usize;
    if buf.len() < total {
        return Err(WireError::ShortBuffer { need: total, have: buf.len() });
    }
    Ok((header, &buf[FRAME_HEADER_SIZE..total]))
}

/// Read the declared payload length from bytes 8..12 without decoding
/// the rest.
pub fn peek_payload_len(buf: &[u8]) -> Result<u32, WireError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(WireError::ShortBuffer { need: FRAME_HEADER_SIZE, have: buf.len() });
    }
    Ok(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]))
}

// =============================================================================
// HELLO BLOCK
// =============================================================================

/// Server version triple parsed from the hello response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u16,
}

/// Build the 64-byte client hello.
///
/// Layout: `STVP` | version `{major, minor, build_hi, build_lo}` |
/// capability toggles (encrypt, compress) | zeros | nonce at 16..32 |
/// zeros to 64.
pub fn build_hello(nonce: &[u8; SESSION_NONCE_SIZE], use_encrypt: bool, use_compress: bool) -> [u8; HELLO_SIZE] {
    let mut hello = [0u8; HELLO_SIZE];
    hello[0..4].copy_from_slice(&HELLO_SIGNATURE);
    hello[4] = CLIENT_VERSION_MAJOR;
    hello[5] = CLIENT_VERSION_MINOR;
    hello[6] = (CLIENT_VERSION_BUILD >> 8) as u8;
    hello[7] = (CLIENT_VERSION_BUILD & 0xFF) as u8;
    hello[8] = use_encrypt as u8;
    hello[9] = use_compress as u8;
    hello[16..32].copy_from_slice(nonce);
    hello
}

/// Validate a hello block's signature and extract the peer version.
pub fn parse_hello(block: &[u8]) -> Result<ServerVersion, WireError> {
    if block.len() < HELLO_SIZE {
        return Err(WireError::ShortBuffer { need: HELLO_SIZE, have: block.len() });
    }
    if block[0..4] != HELLO_SIGNATURE {
        return Err(WireError::BadSignature);
    }
    Ok(ServerVersion {
        major: block[4],
        minor: block[5],
        build: ((block[6] as u16) << 8) | block[7] as u16,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip_exact_bytes() {
        let encoded = encode_frame(FrameKind::Data, 0, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        assert_eq!(
            encoded,
            [
                0x00, 0x00, 0x00, 0x01, // kind
                0x00, 0x00, 0x00, 0x00, // flags
                0x00, 0x00, 0x00, 0x04, // payload_len
                0xDE, 0xAD, 0xBE, 0xEF,
            ]
        );

        let (header, payload) = decode_frame(&encoded).unwrap();
        assert_eq!(header.kind, FrameKind::Data);
        assert_eq!(header.flags, 0);
        assert_eq!(header.payload_len, 4);
        assert_eq!(payload, [0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn frame_length_law() {
        for len in [0usize, 1, 100, MAX_PAYLOAD_SIZE] {
            let payload = vec![0xAB; len];
            let encoded = encode_frame(FrameKind::Control, 7, &payload).unwrap();
            assert_eq!(encoded.len(), FRAME_HEADER_SIZE + len);
        }
    }

    #[test]
    fn oversized_payload_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert_eq!(
            encode_frame(FrameKind::Data, 0, &payload),
            Err(WireError::PayloadTooLarge(MAX_PAYLOAD_SIZE + 1))
        );
    }

    #[test]
    fn short_buffer_is_not_fatal_shape() {
        let encoded = encode_frame(FrameKind::Keepalive, 0, &[1, 2, 3]).unwrap();
        assert_eq!(
            decode_header(&encoded[..8]),
            Err(WireError::ShortBuffer { need: 12, have: 8 })
        );
        assert_eq!(
            decode_frame(&encoded[..13]),
            Err(WireError::ShortBuffer { need: 15, have: 13 })
        );
    }

    #[test]
    fn peek_matches_header() {
        let encoded = encode_frame(FrameKind::Data, 0, &[0u8; 300]).unwrap();
        assert_eq!(peek_payload_len(&encoded).unwrap(), 300);
    }

    #[test]
    fn kind_round_trip_and_names() {
        for raw in [0x0001u32, 0x0002, 0x0003, 0x0010, 0x0011, 0x0012, 0x0020, 0x0021, 0x00FF] {
            let kind = FrameKind::from_raw(raw);
            assert_eq!(kind.raw(), raw);
            assert_ne!(kind.name(), "UNKNOWN");
        }
        assert_eq!(FrameKind::from_raw(0x7777), FrameKind::Unknown(0x7777));
        assert_eq!(FrameKind::Unknown(0x7777).name(), "UNKNOWN");
    }

    #[test]
    fn hello_layout() {
        let nonce = [0x42u8; SESSION_NONCE_SIZE];
        let hello = build_hello(&nonce, true, false);
        assert_eq!(&hello[0..4], b"STVP");
        assert_eq!(hello[4], CLIENT_VERSION_MAJOR);
        assert_eq!(hello[5], CLIENT_VERSION_MINOR);
        assert_eq!(hello[8], 1);
        assert_eq!(hello[9], 0);
        assert_eq!(&hello[16..32], &nonce);
        assert!(hello[32..].iter().all(|&b| b == 0));

        let version = parse_hello(&hello).unwrap();
        assert_eq!(version.major, CLIENT_VERSION_MAJOR);
        assert_eq!(version.build, CLIENT_VERSION_BUILD);
    }

    #[test]
    fn hello_bad_signature() {
        let mut hello = build_hello(&[0u8; SESSION_NONCE_SIZE], true, true);
        hello[0] = b'X';
        assert_eq!(parse_hello(&hello), Err(WireError::BadSignature));
    }
}
