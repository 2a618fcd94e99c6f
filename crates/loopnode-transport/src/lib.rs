//! TCP + TLS byte transport
//!
//! Everything above this layer sees a reliable, boundary-free byte pipe.
//! TLS is rustls with SNI taken from the dialed hostname; certificate
//! verification can be disabled for development against relays with
//! self-signed certificates.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use socket2::SockRef;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        source: std::io::Error,
    },

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("Invalid server name for SNI: {0}")]
    InvalidServerName(String),

    #[error("TLS handshake with {addr} failed: {source}")]
    TlsHandshake {
        addr: String,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A connected stream, plain or TLS.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
    /// Shut down the underlying socket in both directions, unblocking any
    /// pending read on another task.
    pub fn shutdown_socket(&self) {
        let tcp = match self {
            Self::Plain(s) => s,
            Self::Tls(s) => s.get_ref().0,
        };
        let _ = SockRef::from(tcp).shutdown(std::net::Shutdown::Both);
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Connect to `host:port`, optionally wrapping the socket in TLS with SNI
/// set to `host`. The whole dial (TCP + TLS handshake) is bounded by
/// `timeout`.
pub async fn connect(
    host: &str,
    port: u16,
    tls: bool,
    insecure_skip_verify: bool,
    timeout: Duration,
) -> Result<MaybeTlsStream, TransportError> {
    let addr = format!("{host}:{port}");

    let dial_addr = addr.clone();
    let dial = async move {
        let addr = dial_addr;
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| TransportError::ConnectFailed {
                addr: addr.clone(),
                source: e,
            })?;
        tcp.set_nodelay(true)?;
        // tokio exposes no keepalive setter; go through socket2.
        let _ = SockRef::from(&tcp).set_keepalive(true);

        if !tls {
            debug!(addr = %addr, "TCP connected");
            return Ok(MaybeTlsStream::Plain(tcp));
        }

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| TransportError::InvalidServerName(host.to_string()))?;
        let connector = build_tls_connector(insecure_skip_verify);
        let stream =
            connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| TransportError::TlsHandshake {
                    addr: addr.clone(),
                    source: e,
                })?;

        debug!(addr = %addr, "TLS connected");
        Ok(MaybeTlsStream::Tls(Box::new(stream)))
    };

    tokio::time::timeout(timeout, dial)
        .await
        .map_err(|_| TransportError::ConnectTimeout(addr))?
}

/// Build a rustls client connector with the webpki root set.
fn build_tls_connector(insecure_skip_verify: bool) -> TlsConnector {
    ensure_crypto_provider();

    let config = if insecure_skip_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    TlsConnector::from(Arc::new(config))
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_plain_connect_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let mut stream = connect(
            "127.0.0.1",
            addr.port(),
            false,
            false,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port that refuses connections.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = connect("127.0.0.1", port, false, false, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(TransportError::ConnectFailed { .. })));
    }

    #[tokio::test]
    async fn test_invalid_sni_name() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // An IP is a valid ServerName, but an empty host is not.
        let result = connect("", addr.port(), true, false, Duration::from_secs(5)).await;
        assert!(matches!(
            result,
            Err(TransportError::InvalidServerName(_)) | Err(TransportError::ConnectFailed { .. })
        ));
    }
}
