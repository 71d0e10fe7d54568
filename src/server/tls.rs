//! TLS/QUIC configuration for the VPN server.
//!
//! Mutual TLS: the server presents its leaf and requires a client
//! certificate chained to the operator CA. The client identity is the
//! certificate Common-Name.

use crate::error::{Result, VpnError};
use crate::masque::{QUIC_IDLE_TIMEOUT, QUIC_KEEPALIVE_INTERVAL};
use quinn::TransportConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::sync::Arc;
use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;

/// Build the QUIC server configuration: TLS 1.3, ALPN `h3`, client
/// certificates verified against `client_ca`.
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_ca: Vec<CertificateDer<'static>>,
    key_log: bool,
) -> Result<quinn::ServerConfig> {
    let mut roots = RootCertStore::empty();
    for ca in client_ca {
        roots
            .add(ca)
            .map_err(|e| VpnError::Config(format!("adding client CA certificate: {e}")))?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| VpnError::Config(format!("building client verifier: {e}")))?;

    let provider = rustls::crypto::ring::default_provider();
    let mut rustls_config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| VpnError::Config(format!("TLS protocol versions: {e}")))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| VpnError::Config(format!("server certificate/key: {e}")))?;

    rustls_config.alpn_protocols = vec![b"h3".to_vec()];
    if key_log {
        rustls_config.key_log = Arc::new(rustls::KeyLogFile::new());
    }

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(Arc::new(rustls_config))
        .map_err(|e| VpnError::Config(format!("building QUIC server crypto: {e}")))?;

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    server_config.transport_config(Arc::new(transport_config()?));
    Ok(server_config)
}

/// QUIC transport knobs shared with the client side: idle timeout,
/// keepalive, and an MTU window that fits tunnel frames.
pub fn transport_config() -> Result<TransportConfig> {
    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(
        QUIC_IDLE_TIMEOUT
            .try_into()
            .map_err(|e| VpnError::Config(format!("idle timeout: {e}")))?,
    ));
    transport.keep_alive_interval(Some(QUIC_KEEPALIVE_INTERVAL));
    // TUN MTU 1400 + framing fits under standard Ethernet; keep the
    // IPv6 minimum as the floor and let discovery raise it.
    transport.initial_mtu(1500);
    transport.min_mtu(1280);
    transport.mtu_discovery_config(Some(quinn::MtuDiscoveryConfig::default()));
    Ok(transport)
}

/// Common-Name of the peer's leaf certificate, the client identity.
pub fn client_common_name(connection: &quinn::Connection) -> Option<String> {
    let identity = connection.peer_identity()?;
    let certs = identity
        .downcast::<Vec<CertificateDer<'static>>>()
        .ok()?;
    let leaf = certs.first()?;
    let (_, parsed) = X509Certificate::from_der(leaf.as_ref()).ok()?;
    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .filter(|cn| !cn.is_empty());
    cn
}
