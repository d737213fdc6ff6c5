//! Connection establishment used by the probes.
//!
//! [`Dialer`] is the seam for alternate transports (proxies, custom
//! resolvers, test doubles); [`DefaultDialer`] dials directly with tokio,
//! native-tls and quinn.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time;

use crate::config::{ScanConfig, TlsVersion};
use crate::error::{ProbeError, TimeoutStage};

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

/// An established TLS session and the protocol the server picked via ALPN.
pub struct TlsConnection {
    pub stream: BoxStream,
    pub alpn: Option<Vec<u8>>,
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial_tcp(&self, target: SocketAddr) -> Result<BoxStream, ProbeError>;

    async fn dial_tls(
        &self,
        target: SocketAddr,
        server_name: &str,
    ) -> Result<TlsConnection, ProbeError>;

    async fn dial_quic(
        &self,
        target: SocketAddr,
        server_name: &str,
        alpn: &[&[u8]],
    ) -> Result<quinn::Connection, ProbeError>;

    /// A UDP socket connected to `target`.
    async fn dial_udp(&self, target: SocketAddr) -> Result<UdpSocket, ProbeError>;
}

pub struct DefaultDialer {
    config: Arc<ScanConfig>,
    tls: tokio_native_tls::TlsConnector,
}

impl DefaultDialer {
    pub fn new(config: Arc<ScanConfig>) -> Result<Self, ProbeError> {
        let (min, max) = protocol_bounds(config.tls_version);
        let mut builder = native_tls::TlsConnector::builder();
        builder
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .danger_accept_invalid_hostnames(config.insecure_skip_verify)
            .min_protocol_version(Some(min))
            .max_protocol_version(max)
            .request_alpns(&config.alpn());
        let tls = tokio_native_tls::TlsConnector::from(builder.build()?);
        Ok(Self { config, tls })
    }

    fn quic_client_config(&self, alpn: &[&[u8]]) -> Result<quinn::ClientConfig, ProbeError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut crypto = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| ProbeError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth();
        crypto.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

        let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| ProbeError::Quic(e.to_string()))?;
        let mut client = quinn::ClientConfig::new(Arc::new(quic_crypto));

        let mut transport = quinn::TransportConfig::default();
        let idle = quinn::IdleTimeout::try_from(self.config.connect_timeout)
            .map_err(|e| ProbeError::Quic(e.to_string()))?;
        transport.max_idle_timeout(Some(idle));
        client.transport_config(Arc::new(transport));
        Ok(client)
    }
}

#[async_trait]
impl Dialer for DefaultDialer {
    async fn dial_tcp(&self, target: SocketAddr) -> Result<BoxStream, ProbeError> {
        let stream = time::timeout(self.config.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| ProbeError::Timeout { stage: TimeoutStage::Connect })??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn dial_tls(
        &self,
        target: SocketAddr,
        server_name: &str,
    ) -> Result<TlsConnection, ProbeError> {
        let raw = self.dial_tcp(target).await?;
        let stream = time::timeout(
            self.config.handshake_timeout,
            self.tls.connect(server_name, raw),
        )
        .await
        .map_err(|_| ProbeError::Timeout { stage: TimeoutStage::Handshake })??;
        let alpn = stream.get_ref().negotiated_alpn()?;
        Ok(TlsConnection { stream: Box::new(stream), alpn })
    }

    async fn dial_quic(
        &self,
        target: SocketAddr,
        server_name: &str,
        alpn: &[&[u8]],
    ) -> Result<quinn::Connection, ProbeError> {
        let endpoint = quinn::Endpoint::client(any_local(target))?;
        let connecting = endpoint
            .connect_with(self.quic_client_config(alpn)?, target, server_name)
            .map_err(|e| ProbeError::Quic(e.to_string()))?;
        // Dropping the endpoint handle is fine: the driver lives as long as the connection.
        time::timeout(self.config.handshake_timeout, connecting)
            .await
            .map_err(|_| ProbeError::Timeout { stage: TimeoutStage::Handshake })?
            .map_err(|e| match e {
                quinn::ConnectionError::TimedOut => {
                    ProbeError::Timeout { stage: TimeoutStage::Handshake }
                }
                other => ProbeError::Quic(other.to_string()),
            })
    }

    async fn dial_udp(&self, target: SocketAddr) -> Result<UdpSocket, ProbeError> {
        let socket = UdpSocket::bind(any_local(target)).await?;
        socket.connect(target).await?;
        Ok(socket)
    }
}

fn any_local(target: SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// native-tls has no TLS 1.3 pin, so 1.3 means "1.2 or newer".
fn protocol_bounds(version: TlsVersion) -> (native_tls::Protocol, Option<native_tls::Protocol>) {
    use native_tls::Protocol;
    match version {
        TlsVersion::Tls10 => (Protocol::Tlsv10, Some(Protocol::Tlsv10)),
        TlsVersion::Tls11 => (Protocol::Tlsv11, Some(Protocol::Tlsv11)),
        TlsVersion::Tls12 => (Protocol::Tlsv12, Some(Protocol::Tlsv12)),
        TlsVersion::Tls13 => (Protocol::Tlsv12, None),
    }
}

/// Skips chain validation but still checks handshake signatures.
///
/// Candidates are bare IPs, so a certificate rarely matches anyway; what
/// matters is that the endpoint finishes the QUIC handshake.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[test]
    fn tls_pins() {
        use native_tls::Protocol;
        assert!(matches!(protocol_bounds(TlsVersion::Tls12), (Protocol::Tlsv12, Some(Protocol::Tlsv12))));
        assert!(matches!(protocol_bounds(TlsVersion::Tls13), (Protocol::Tlsv12, None)));
    }

    #[tokio::test]
    async fn tcp_dial_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = DefaultDialer::new(Arc::new(ScanConfig::default())).unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        assert!(dialer.dial_tcp(addr).await.is_ok());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn tcp_dial_refused_is_not_a_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let cfg = ScanConfig { connect_timeout: Duration::from_secs(2), ..Default::default() };
        let dialer = DefaultDialer::new(Arc::new(cfg)).unwrap();
        let err = dialer.dial_tcp(addr).await.err().unwrap();
        assert!(!err.is_timeout(), "{err}");
    }

    #[tokio::test]
    async fn silent_tls_peer_times_out_at_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accept, then never answer the ClientHello
        let held = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            time::sleep(Duration::from_secs(5)).await;
            drop(sock);
        });
        let cfg = ScanConfig {
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_millis(150),
            ..Default::default()
        };
        let dialer = DefaultDialer::new(Arc::new(cfg)).unwrap();
        let started = time::Instant::now();
        let err = dialer.dial_tls(addr, "www.cloudflare.com").await.err().unwrap();
        assert!(matches!(err, ProbeError::Timeout { stage: TimeoutStage::Handshake }), "{err}");
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(2));
        held.abort();
    }

    #[tokio::test]
    async fn quic_client_config_builds() {
        let dialer = DefaultDialer::new(Arc::new(ScanConfig::default())).unwrap();
        assert!(dialer.quic_client_config(&[b"h3"]).is_ok());
    }
}
