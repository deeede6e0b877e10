//! Handshake driver: hello, authentication, address assignment.
//!
//! The three phases run strictly in order over the freshly established
//! TLS stream; each is gated on the previous one succeeding and carries
//! its own deadline. On any failure the caller tears the transport down
//! and parks the connection in the error state.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::transport::{recv_frame, send_frame};
use crate::types::{
    ConnectParams, NetworkConfig, DHCP_TIMEOUT, HANDSHAKE_TIMEOUT, HELLO_SIZE, SESSION_NONCE_SIZE,
};
use crate::wire::{self, FrameKind, ServerVersion};

/// Auth status used when the server answers with something other than
/// a well-formed `AUTH_RESPONSE`.
const AUTH_STATUS_MALFORMED: u32 = u32::MAX;

/// Result of a completed handshake.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeOutcome {
    pub server_version: ServerVersion,
    pub network: NetworkConfig,
}

/// Drive all three phases to completion.
pub async fn run<S>(
    stream: &mut S,
    params: &ConnectParams,
    nonce: &[u8; SESSION_NONCE_SIZE],
) -> Result<HandshakeOutcome, EngineError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_version = hello(stream, params, nonce, HANDSHAKE_TIMEOUT).await?;
    debug!(
        "hello complete, server version {}.{} build {}",
        server_version.major, server_version.minor, server_version.build
    );

    authenticate(stream, params, HANDSHAKE_TIMEOUT).await?;
    debug!("authenticated as {:?} on hub {:?}", params.username, params.hub);

    let network = acquire_network_config(stream, nonce, DHCP_TIMEOUT).await?;
    info!(
        "handshake complete: client {} mask {} gw {}",
        network.client_ip, network.subnet_mask, network.gateway
    );

    Ok(HandshakeOutcome { server_version, network })
}

// =============================================================================
// PHASE 1: HELLO
// =============================================================================

/// Exchange 64-byte hello blocks and capture the server version.
pub(crate) async fn hello<S>(
    stream: &mut S,
    params: &ConnectParams,
    nonce: &[u8; SESSION_NONCE_SIZE],
    timeout: Duration,
) -> Result<ServerVersion, EngineError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let block = wire::build_hello(nonce, params.use_encrypt, params.use_compress);
    stream.write_all(&block).await?;
    stream.flush().await?;

    let mut response = [0u8; HELLO_SIZE];
    tokio::time::timeout(timeout, stream.read_exact(&mut response))
        .await
        .map_err(|_| EngineError::Timeout("hello response"))??;

    wire::parse_hello(&response)
        .map_err(|_| EngineError::ProtocolMismatch("bad hello signature"))
}

// =============================================================================
// PHASE 2: AUTHENTICATION
// =============================================================================

/// Send the credential triple and evaluate the server's verdict.
///
/// An `AUTH_CHALLENGE` is answered with an empty `AUTH_RESPONSE` and
/// the verdict is read again; anything that is not a zero-status
/// `AUTH_RESPONSE` is an authentication failure.
pub(crate) async fn authenticate<S>(
    stream: &mut S,
    params: &ConnectParams,
    timeout: Duration,
) -> Result<(), EngineError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = encode_credentials(&params.username, &params.password, &params.hub);
    send_frame(stream, FrameKind::AuthRequest, 0, &payload).await?;

    let (header, body) = tokio::time::timeout(timeout, recv_frame(stream))
        .await
        .map_err(|_| EngineError::Timeout("auth response"))??;

    match header.kind {
        FrameKind::AuthResponse => auth_status(&body),
        FrameKind::AuthChallenge => {
            // Base flow: acknowledge the challenge with an empty
            // response, then read the final verdict.
            debug!("server issued auth challenge");
            send_frame(stream, FrameKind::AuthResponse, 0, &[]).await?;
            let (header, body) = tokio::time::timeout(timeout, recv_frame(stream))
                .await
                .map_err(|_| EngineError::Timeout("auth verdict"))??;
            match header.kind {
                FrameKind::AuthResponse => auth_status(&body),
                other => {
                    debug!("expected AUTH_RESPONSE, got {}", other.name());
                    Err(EngineError::AuthFailed(AUTH_STATUS_MALFORMED))
                }
            }
        }
        other => {
            debug!("expected AUTH_RESPONSE, got {}", other.name());
            Err(EngineError::AuthFailed(AUTH_STATUS_MALFORMED))
        }
    }
}

fn auth_status(body: &[u8]) -> Result<(), EngineError> {
    if body.len() < 4 {
        return Err(EngineError::AuthFailed(AUTH_STATUS_MALFORMED));
    }
    let status = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    if status == 0 {
        Ok(())
    } else {
        Err(EngineError::AuthFailed(status))
    }
}

/// `[u32 len][username][u32 len][password][u32 len][hub]`, big endian.
fn encode_credentials(username: &str, password: &str, hub: &str) -> Vec<u8> {
    let mut payload =
        Vec::with_capacity(12 + username.len() + password.len() + hub.len());
    for field in [username, password, hub] {
        payload.extend_from_slice(&(field.len() as u32).to_be_bytes());
        payload.extend_from_slice(field.as_bytes());
    }
    payload
}

// =============================================================================
// PHASE 3: ADDRESS ASSIGNMENT
// =============================================================================

/// Request the tunnel addresses, echoing the session nonce.
///
/// The response carries four mandatory big-endian IPv4 addresses
/// (client, mask, gateway, dns) and optionally dns2, the DHCP server
/// and the lease seconds.
pub(crate) async fn acquire_network_config<S>(
    stream: &mut S,
    nonce: &[u8; SESSION_NONCE_SIZE],
    timeout: Duration,
) -> Result<NetworkConfig, EngineError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_frame(stream, FrameKind::DhcpRequest, 0, nonce).await?;

    let (header, body) = tokio::time::timeout(timeout, recv_frame(stream))
        .await
        .map_err(|_| EngineError::Timeout("address assignment"))??;

    if header.kind != FrameKind::DhcpResponse {
        debug!("expected DHCP_RESPONSE, got {}", header.kind.name());
        return Err(EngineError::DhcpFailed("unexpected frame"));
    }
    parse_network_config(&body)
}

fn parse_network_config(body: &[u8]) -> Result<NetworkConfig, EngineError> {
    if body.len() < 16 {
        return Err(EngineError::DhcpFailed("short payload"));
    }
    let addr = |at: usize| {
        std::net::Ipv4Addr::from(u32::from_be_bytes([
            body[at],
            body[at + 1],
            body[at + 2],
            body[at + 3],
        ]))
    };

    let mut config = NetworkConfig {
        client_ip: addr(0),
        subnet_mask: addr(4),
        gateway: addr(8),
        dns1: addr(12),
        ..NetworkConfig::default()
    };
    if body.len() >= 28 {
        config.dns2 = addr(16);
        config.dhcp_server = addr(20);
        config.lease_secs = u32::from_be_bytes([body[24], body[25], body[26], body[27]]);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::net::Ipv4Addr;

    fn params() -> ConnectParams {
        ConnectParams::new("vpn.example.org", 443, "HUB", "alice", "secret")
    }

    const NONCE: [u8; SESSION_NONCE_SIZE] = [7u8; SESSION_NONCE_SIZE];
    const TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn hello_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let mut block = [0u8; HELLO_SIZE];
            server.read_exact(&mut block).await.unwrap();
            assert_eq!(&block[0..4], b"STVP");
            assert_eq!(&block[16..32], &NONCE);

            let mut reply = [0u8; HELLO_SIZE];
            reply[0..4].copy_from_slice(b"STVP");
            reply[4] = 4;
            reply[5] = 2;
            reply[7] = 9;
            server.write_all(&reply).await.unwrap();
        });

        let version = hello(&mut client, &params(), &NONCE, TIMEOUT).await.unwrap();
        assert_eq!((version.major, version.minor, version.build), (4, 2, 9));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn hello_bad_signature_is_protocol_mismatch() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let mut block = [0u8; HELLO_SIZE];
            server.read_exact(&mut block).await.unwrap();
            let mut reply = [0u8; HELLO_SIZE];
            reply[0..4].copy_from_slice(b"XTVP");
            server.write_all(&reply).await.unwrap();
        });

        let err = hello(&mut client, &params(), &NONCE, TIMEOUT).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolMismatch);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn hello_silence_times_out() {
        let (mut client, _server) = tokio::io::duplex(4096);
        let err = hello(&mut client, &params(), &NONCE, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn auth_success_and_credential_layout() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let (header, body) = recv_frame(&mut server).await.unwrap();
            assert_eq!(header.kind, FrameKind::AuthRequest);

            // [len]alice[len]secret[len]HUB
            let mut expected = Vec::new();
            for field in ["alice", "secret", "HUB"] {
                expected.extend_from_slice(&(field.len() as u32).to_be_bytes());
                expected.extend_from_slice(field.as_bytes());
            }
            assert_eq!(body, expected);

            send_frame(&mut server, FrameKind::AuthResponse, 0, &[0, 0, 0, 0]).await.unwrap();
        });

        authenticate(&mut client, &params(), TIMEOUT).await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn auth_nonzero_status_fails() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let _ = recv_frame(&mut server).await.unwrap();
            send_frame(&mut server, FrameKind::AuthResponse, 0, &[0, 0, 0, 1]).await.unwrap();
        });

        let err = authenticate(&mut client, &params(), TIMEOUT).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthFailed);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn auth_challenge_answered_then_accepted() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let _ = recv_frame(&mut server).await.unwrap();
            send_frame(&mut server, FrameKind::AuthChallenge, 0, &[0xAA; 8]).await.unwrap();

            // The client must answer with an empty AUTH_RESPONSE.
            let (header, body) = recv_frame(&mut server).await.unwrap();
            assert_eq!(header.kind, FrameKind::AuthResponse);
            assert!(body.is_empty());

            send_frame(&mut server, FrameKind::AuthResponse, 0, &[0, 0, 0, 0]).await.unwrap();
        });

        authenticate(&mut client, &params(), TIMEOUT).await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn auth_unexpected_frame_fails() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let _ = recv_frame(&mut server).await.unwrap();
            send_frame(&mut server, FrameKind::Control, 0, &[]).await.ok();
        });

        let err = authenticate(&mut client, &params(), TIMEOUT).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthFailed);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn dhcp_parses_all_addresses() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let (header, body) = recv_frame(&mut server).await.unwrap();
            assert_eq!(header.kind, FrameKind::DhcpRequest);
            assert_eq!(body, NONCE);

            let payload = [
                0x0A, 0x00, 0x00, 0x02, // 10.0.0.2
                0xFF, 0xFF, 0xFF, 0x00, // 255.255.255.0
                0x0A, 0x00, 0x00, 0x01, // 10.0.0.1
                0x08, 0x08, 0x08, 0x08, // 8.8.8.8
            ];
            send_frame(&mut server, FrameKind::DhcpResponse, 0, &payload).await.unwrap();
        });

        let config = acquire_network_config(&mut client, &NONCE, TIMEOUT).await.unwrap();
        assert_eq!(config.client_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(config.subnet_mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(config.gateway, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(config.dns1, Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(config.dns2, Ipv4Addr::UNSPECIFIED);
        assert_eq!(config.lease_secs, 0);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn dhcp_extended_payload_carries_lease() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let _ = recv_frame(&mut server).await.unwrap();
            let mut payload = Vec::new();
            for addr in [
                [10, 0, 0, 2],
                [255, 255, 255, 0],
                [10, 0, 0, 1],
                [8, 8, 8, 8],
                [8, 8, 4, 4],
                [10, 0, 0, 1],
            ] {
                payload.extend_from_slice(&addr);
            }
            payload.extend_from_slice(&86_400u32.to_be_bytes());
            send_frame(&mut server, FrameKind::DhcpResponse, 0, &payload).await.unwrap();
        });

        let config = acquire_network_config(&mut client, &NONCE, TIMEOUT).await.unwrap();
        assert_eq!(config.dns2, Ipv4Addr::new(8, 8, 4, 4));
        assert_eq!(config.dhcp_server, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(config.lease_secs, 86_400);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn dhcp_short_payload_fails() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let _ = recv_frame(&mut server).await.unwrap();
            send_frame(&mut server, FrameKind::DhcpResponse, 0, &[1, 2, 3]).await.unwrap();
        });

        let err = acquire_network_config(&mut client, &NONCE, TIMEOUT).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DhcpFailed);
        server_task.await.unwrap();
    }
}
