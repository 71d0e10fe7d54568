//! TLS/QUIC configuration for the VPN client.
//!
//! Mutual TLS: the client verifies the server against the operator CA
//! (or the system roots) and presents its own leaf certificate; the
//! server derives the client identity from it.

use crate::config::ClientConfig;
use crate::error::{Result, VpnError};
use crate::server::tls::transport_config;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;

/// Build the QUIC client configuration from the loaded config file.
pub fn build_client_config(config: &ClientConfig) -> Result<quinn::ClientConfig> {
    let cert_chain = config.load_cert_chain()?;
    let key = config.load_private_key()?;

    let provider = rustls::crypto::ring::default_provider();
    let builder = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| VpnError::Config(format!("TLS protocol versions: {e}")))?;

    let mut crypto = if config.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
            .with_client_auth_cert(cert_chain, key)
            .map_err(|e| VpnError::Config(format!("client certificate/key: {e}")))?
    } else {
        let mut roots = RootCertStore::empty();
        if config.ca_pem.is_empty() && config.ca_file.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for ca in config.load_ca()? {
                roots
                    .add(ca)
                    .map_err(|e| VpnError::Config(format!("adding CA certificate: {e}")))?;
            }
        }
        builder
            .with_root_certificates(roots)
            .with_client_auth_cert(cert_chain, key)
            .map_err(|e| VpnError::Config(format!("client certificate/key: {e}")))?
    };

    crypto.alpn_protocols = vec![b"h3".to_vec()];
    if !config.key_log_file.is_empty() {
        // rustls reads SSLKEYLOGFILE; honor the config option too.
        std::env::set_var("SSLKEYLOGFILE", &config.key_log_file);
        crypto.key_log = Arc::new(rustls::KeyLogFile::new());
    }

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| VpnError::Config(format!("building QUIC client crypto: {e}")))?;

    let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(Arc::new(transport_config()?));
    Ok(client_config)
}

/// Certificate verifier that accepts anything. Gated behind
/// `insecure_skip_verify` for test setups only.
#[derive(Debug)]
pub struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}
