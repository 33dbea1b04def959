//! TLS configuration for the direct peer-to-peer path
//!
//! Each node generates a self-signed certificate; the peer's certificate
//! fingerprint travels inside the authenticated ESTABLISHED handshake
//! message, so the direct transport pins the exact certificate instead of
//! trusting a CA. A fingerprint mismatch is a hard failure, never a warning.

use crate::transport::websocket::WsTransport;
use crate::{NetworkError, Result};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// SNI name used on the direct path (the pin, not the name, authenticates)
const DIRECT_SNI: &str = "umbra.direct";

/// Certificate fingerprint: SHA-256 over the DER encoding
pub type CertFingerprint = [u8; 32];

/// Generated TLS certificate and key pair
pub struct TlsIdentity {
    /// DER-encoded certificate
    pub cert_der: rustls::pki_types::CertificateDer<'static>,
    /// DER-encoded private key
    pub key_der: rustls::pki_types::PrivatePkcs8KeyDer<'static>,
}

impl TlsIdentity {
    /// Generate a fresh self-signed identity for the direct path
    pub fn generate() -> Result<Self> {
        let cert = rcgen::generate_simple_self_signed(vec![DIRECT_SNI.to_string()])
            .map_err(|e| NetworkError::Tls(format!("cert generation failed: {}", e)))?;

        let cert_der = rustls::pki_types::CertificateDer::from(cert.cert);
        let key_der = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

        Ok(Self { cert_der, key_der })
    }

    /// SHA-256 fingerprint of the certificate
    pub fn fingerprint(&self) -> CertFingerprint {
        fingerprint(&self.cert_der)
    }
}

/// SHA-256 fingerprint of a DER-encoded certificate
pub fn fingerprint(cert_der: &rustls::pki_types::CertificateDer<'_>) -> CertFingerprint {
    fingerprint_der(cert_der.as_ref())
}

/// SHA-256 fingerprint over raw DER bytes
pub fn fingerprint_der(der: &[u8]) -> CertFingerprint {
    let digest = Sha256::digest(der);
    digest.into()
}

/// Build a rustls ServerConfig from a TLS identity
pub fn server_config(identity: &TlsIdentity) -> Result<Arc<rustls::ServerConfig>> {
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![identity.cert_der.clone()],
            identity.key_der.clone_key().into(),
        )
        .map_err(|e| NetworkError::Tls(format!("server config failed: {}", e)))?;

    Ok(Arc::new(config))
}

/// Build a rustls ClientConfig that accepts exactly one pinned certificate
pub fn pinned_client_config(expected: CertFingerprint) -> Arc<rustls::ClientConfig> {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier { expected }))
        .with_no_client_auth();

    Arc::new(config)
}

/// Dial a peer's direct endpoint over TLS with certificate pinning,
/// then upgrade to WebSocket.
pub async fn dial_direct(
    addr: SocketAddr,
    expected: CertFingerprint,
    timeout: Duration,
) -> Result<WsTransport> {
    let dial = async {
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;

        let connector = TlsConnector::from(pinned_client_config(expected));
        let server_name = rustls::pki_types::ServerName::try_from(DIRECT_SNI.to_string())
            .map_err(|e| NetworkError::Tls(format!("invalid SNI: {}", e)))?;
        let tls = connector.connect(server_name, tcp).await?;

        let url = format!("ws://{}/direct", addr);
        let (ws, _response) = tokio_tungstenite::client_async_with_config(
            url.as_str(),
            tls,
            Some(direct_ws_config()),
        )
        .await
        .map_err(|e| NetworkError::ConnectionFailed(format!("direct upgrade failed: {}", e)))?;

        debug!(%addr, "direct TLS transport dialed");
        Ok::<_, NetworkError>(WsTransport::from_dialed_tls(ws, addr))
    };

    tokio::time::timeout(timeout, dial)
        .await
        .map_err(|_| NetworkError::Timeout)?
}

/// Listener for incoming direct-path connections
pub struct DirectListener {
    tcp: TcpListener,
    acceptor: TlsAcceptor,
    local_addr: SocketAddr,
}

impl DirectListener {
    /// Bind a direct-path listener with the node's TLS identity
    pub async fn bind(addr: SocketAddr, identity: &TlsIdentity) -> Result<Self> {
        let tcp = TcpListener::bind(addr).await?;
        let local_addr = tcp.local_addr()?;
        let acceptor = TlsAcceptor::from(server_config(identity)?);

        debug!(%local_addr, "direct TLS listener bound");

        Ok(Self {
            tcp,
            acceptor,
            local_addr,
        })
    }

    /// The bound local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one incoming direct transport
    pub async fn accept(&self) -> Result<WsTransport> {
        let (tcp, remote) = self.tcp.accept().await?;
        tcp.set_nodelay(true)?;

        let tls = self.acceptor.accept(tcp).await?;
        let ws = tokio_tungstenite::accept_async_with_config(tls, Some(direct_ws_config()))
            .await
            .map_err(|e| NetworkError::ConnectionFailed(format!("direct upgrade failed: {}", e)))?;

        debug!(%remote, "direct TLS transport accepted");

        Ok(WsTransport::from_accepted_tls(ws, remote))
    }
}

fn direct_ws_config() -> tokio_tungstenite::tungstenite::protocol::WebSocketConfig {
    crate::transport::websocket::ws_config()
}

/// Certificate verifier that accepts exactly one pinned certificate
///
/// The fingerprint comes from the authenticated handshake, which makes this
/// stronger than CA validation for this use case: only the certificate the
/// peer committed to is accepted.
#[derive(Debug)]
struct PinnedCertVerifier {
    expected: CertFingerprint,
}

impl rustls::client::danger::ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let actual = fingerprint(end_entity);
        if umbra_crypto::mem::ct_eq(&actual, &self.expected) {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "peer certificate does not match pinned fingerprint".to_string(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
