//! Transport: deadline TCP connect, socket tuning, TLS client session,
//! and frame-level I/O helpers.
//!
//! The control channel is TLS-only. Certificate verification runs
//! against the webpki root set unless the caller opted out, in which
//! case an accept-any verifier is installed; the byte stream is
//! encrypted either way.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::EngineError;
use crate::types::{FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE, SOCKET_BUFFER_SIZE};
use crate::wire::{self, FrameHeader, FrameKind};

// =============================================================================
// TCP
// =============================================================================

/// Resolve `host` and open a TCP connection within `timeout`.
///
/// The returned stream has keepalive on, Nagle off and 64 KB kernel
/// buffers. Resolution failures, refusals and the deadline all map to
/// `CONNECT_FAILED`.
pub async fn connect_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, EngineError> {
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(EngineError::ConnectFailed)?
        .collect();
    if addrs.is_empty() {
        return Err(EngineError::ConnectFailed(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {host}"),
        )));
    }

    let mut last_err = None;
    for addr in addrs {
        debug!("connecting to {} ({})", addr, host);
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).map_err(EngineError::ConnectFailed)?;
                tune_socket(&stream);
                return Ok(stream);
            }
            Ok(Err(e)) => last_err = Some(e),
            Err(_) => {
                last_err = Some(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out"),
                ));
            }
        }
    }
    Err(EngineError::ConnectFailed(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::Other, "connect failed")
    })))
}

/// Set SO_KEEPALIVE and the kernel send/receive buffer sizes.
fn tune_socket(stream: &TcpStream) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let one: libc::c_int = 1;
    let size: libc::c_int = SOCKET_BUFFER_SIZE as libc::c_int;
    let optlen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &one as *const _ as *const libc::c_void,
            optlen,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            optlen,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            optlen,
        );
    }
}

// =============================================================================
// TLS
// =============================================================================

/// Wrap `stream` in a TLS 1.2+ client session with SNI set to `host`.
pub async fn connect_tls(
    stream: TcpStream,
    host: &str,
    verify_server_cert: bool,
) -> Result<TlsStream<TcpStream>, EngineError> {
    let config = client_config(verify_server_cert);

    let server_name = ServerName::try_from(host.to_owned()).map_err(|e| {
        EngineError::SslHandshakeFailed(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid server name {host}: {e}"),
        ))
    })?;

    let connector = TlsConnector::from(config);
    let tls = connector
        .connect(server_name, stream)
        .await
        .map_err(EngineError::SslHandshakeFailed)?;

    debug!("TLS session established with {}", host);
    Ok(tls)
}

fn client_config(verify_server_cert: bool) -> Arc<rustls::ClientConfig> {
    if verify_server_cert {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    } else {
        Arc::new(
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::AcceptAnyCert))
                .with_no_client_auth(),
        )
    }
}

/// Accept-any certificate verifier, installed only when the host sets
/// `verify_server_cert = false`. The channel stays encrypted; only the
/// chain check is skipped.
mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::DigitallySignedStruct;

    #[derive(Debug)]
    pub struct AcceptAnyCert;

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            vec![
                rustls::SignatureScheme::RSA_PKCS1_SHA256,
                rustls::SignatureScheme::RSA_PKCS1_SHA384,
                rustls::SignatureScheme::RSA_PKCS1_SHA512,
                rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
                rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
                rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
                rustls::SignatureScheme::RSA_PSS_SHA256,
                rustls::SignatureScheme::RSA_PSS_SHA384,
                rustls::SignatureScheme::RSA_PSS_SHA512,
                rustls::SignatureScheme::ED25519,
            ]
        }
    }
}

// =============================================================================
// FRAME I/O
// =============================================================================

/// Write one frame to the stream.
pub async fn send_frame<S>(
    stream: &mut S,
    kind: FrameKind,
    flags: u32,
    payload: &[u8],
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let frame = wire::encode_frame(kind, flags, payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    stream.write_all(&frame).await?;
    stream.flush().await
}

/// Read one full frame from the stream.
///
/// Reads exactly 12 header bytes, then exactly `payload_len` payload
/// bytes; `read_exact` absorbs short reads. A declared length above the
/// frame cap is rejected before any allocation.
pub async fn recv_frame<S>(stream: &mut S) -> io::Result<(FrameHeader, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; FRAME_HEADER_SIZE];
    stream.read_exact(&mut header_buf).await?;
    let header = wire::decode_header(&header_buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if header.payload_len as usize > MAX_PAYLOAD_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("declared payload too large: {}", header.payload_len),
        ));
    }

    let mut payload = vec![0u8; header.payload_len as usize];
    if !payload.is_empty() {
        stream.read_exact(&mut payload).await?;
    }
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[tokio::test]
    async fn frame_io_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        send_frame(&mut client, FrameKind::Data, 5, b"payload").await.unwrap();
        let (header, payload) = recv_frame(&mut server).await.unwrap();
        assert_eq!(header.kind, FrameKind::Data);
        assert_eq!(header.flags, 5);
        assert_eq!(payload, b"payload");

        // Empty payloads carry no body bytes.
        send_frame(&mut client, FrameKind::Keepalive, 0, &[]).await.unwrap();
        let (header, payload) = recv_frame(&mut server).await.unwrap();
        assert_eq!(header.kind, FrameKind::Keepalive);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn recv_frame_survives_fragmented_writes() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let frame = wire::encode_frame(FrameKind::Data, 0, &[9u8; 32]).unwrap();

        let writer = tokio::spawn(async move {
            for chunk in frame.chunks(5) {
                client.write_all(chunk).await.unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let (header, payload) = recv_frame(&mut server).await.unwrap();
        assert_eq!(header.payload_len, 32);
        assert_eq!(payload, vec![9u8; 32]);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn recv_frame_rejects_oversized_declared_length() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let header = wire::encode_header(FrameKind::Data, 0, (MAX_PAYLOAD_SIZE + 1) as u32);
        client.write_all(&header).await.unwrap();

        let err = recv_frame(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn connect_unreachable_maps_to_connect_failed() {
        // Blackhole address: either times out or errors immediately
        // depending on the environment; both classify the same way.
        let result = connect_tcp("10.255.255.1", 443, Duration::from_millis(200)).await;
        let err = result.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectFailed);
    }
}
