//! Configuration structures loaded from TOML files.
//!
//! Field names match the recognized option names exactly. Certificates
//! and keys may be given inline (`*_pem`) or as file paths; the inline
//! form wins when both are set.

use crate::error::{Result, VpnError};
use crate::fec::FecConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::Deserialize;
use std::path::Path;

/// VPN client configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    /// Remote UDP endpoint, `host:port`.
    pub server_addr: String,
    /// TLS SNI / hostname to verify.
    pub server_name: String,
    pub ca_file: String,
    pub ca_pem: String,
    pub tls_cert: String,
    pub cert_pem: String,
    pub tls_key: String,
    pub key_pem: String,
    /// Test-only: skip server certificate verification.
    pub insecure_skip_verify: bool,
    /// Requested TUN name; empty uses the platform default.
    pub tun_name: String,
    pub mtu: u16,
    pub log_level: String,
    pub key_log_file: String,
    pub fec: FecConfig,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            VpnError::Config(format!("reading config at {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&data).map_err(|e| {
            VpnError::Config(format!("parsing config at {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_addr.is_empty() {
            return Err(VpnError::Config("server_addr is required".into()));
        }
        if self.server_name.is_empty() && !self.insecure_skip_verify {
            return Err(VpnError::Config("server_name is required".into()));
        }
        if self.cert_pem.is_empty() && self.tls_cert.is_empty() {
            return Err(VpnError::Config(
                "client certificate is required (cert_pem or tls_cert)".into(),
            ));
        }
        if self.key_pem.is_empty() && self.tls_key.is_empty() {
            return Err(VpnError::Config(
                "client key is required (key_pem or tls_key)".into(),
            ));
        }
        self.fec.validate()
    }

    pub fn load_ca(&self) -> Result<Vec<CertificateDer<'static>>> {
        load_pem_certs(&self.ca_pem, &self.ca_file)
    }

    pub fn load_cert_chain(&self) -> Result<Vec<CertificateDer<'static>>> {
        load_pem_certs(&self.cert_pem, &self.tls_cert)
    }

    pub fn load_private_key(&self) -> Result<PrivateKeyDer<'static>> {
        load_pem_key(&self.key_pem, &self.tls_key)
    }

    /// TUN MTU, defaulted when the file omits it.
    pub fn effective_mtu(&self) -> u16 {
        if self.mtu == 0 {
            1400
        } else {
            self.mtu
        }
    }
}

/// External metrics exposition knobs; the core only keeps counters.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

/// External admin API knobs; `database_path` names the client registry
/// the core checks identities against.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ApiServerConfig {
    pub listen_addr: String,
    pub database_path: String,
}

/// VPN server configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// QUIC listen address, `host:port`.
    pub listen_addr: String,
    pub cert_file: String,
    pub cert_pem: String,
    pub key_file: String,
    pub key_pem: String,
    pub ca_cert_file: String,
    pub ca_cert_pem: String,
    /// IPv4 network clients are assigned from.
    pub assign_cidr: String,
    /// Optional IPv6 network clients are assigned from.
    pub assign_cidr_v6: String,
    /// CIDRs advertised to every client, verbatim.
    pub advertise_routes: Vec<String>,
    /// Server TUN name; empty disables the TUN (signalling harness mode).
    pub tun_name: String,
    pub mtu: u16,
    pub log_level: String,
    pub key_log_file: String,
    pub fec: FecConfig,
    pub metrics: MetricsConfig,
    pub api_server: ApiServerConfig,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            VpnError::Config(format!("reading config at {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&data).map_err(|e| {
            VpnError::Config(format!("parsing config at {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(VpnError::Config("listen_addr is required".into()));
        }
        if self.cert_pem.is_empty() && self.cert_file.is_empty() {
            return Err(VpnError::Config(
                "server certificate is required (cert_pem or cert_file)".into(),
            ));
        }
        if self.key_pem.is_empty() && self.key_file.is_empty() {
            return Err(VpnError::Config(
                "server key is required (key_pem or key_file)".into(),
            ));
        }
        if self.ca_cert_pem.is_empty() && self.ca_cert_file.is_empty() {
            return Err(VpnError::Config(
                "client CA is required (ca_cert_pem or ca_cert_file)".into(),
            ));
        }
        if self.assign_cidr.is_empty() {
            return Err(VpnError::Config("assign_cidr is required".into()));
        }
        self.fec.validate()
    }

    pub fn load_cert_chain(&self) -> Result<Vec<CertificateDer<'static>>> {
        load_pem_certs(&self.cert_pem, &self.cert_file)
    }

    pub fn load_private_key(&self) -> Result<PrivateKeyDer<'static>> {
        load_pem_key(&self.key_pem, &self.key_file)
    }

    pub fn load_client_ca(&self) -> Result<Vec<CertificateDer<'static>>> {
        load_pem_certs(&self.ca_cert_pem, &self.ca_cert_file)
    }

    pub fn effective_mtu(&self) -> u16 {
        if self.mtu == 0 {
            1400
        } else {
            self.mtu
        }
    }
}

fn load_pem_certs(inline: &str, file: &str) -> Result<Vec<CertificateDer<'static>>> {
    let data = resolve_pem(inline, file, "certificate")?;
    let certs: std::result::Result<Vec<_>, _> =
        rustls_pemfile::certs(&mut data.as_bytes()).collect();
    let certs = certs.map_err(|e| VpnError::Config(format!("parsing certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(VpnError::Config("no certificates found in PEM".into()));
    }
    Ok(certs)
}

fn load_pem_key(inline: &str, file: &str) -> Result<PrivateKeyDer<'static>> {
    let data = resolve_pem(inline, file, "private key")?;
    rustls_pemfile::private_key(&mut data.as_bytes())
        .map_err(|e| VpnError::Config(format!("parsing key PEM: {e}")))?
        .ok_or_else(|| VpnError::Config("no private key found in PEM".into()))
}

fn resolve_pem(inline: &str, file: &str, what: &str) -> Result<String> {
    if !inline.is_empty() {
        return Ok(inline.to_string());
    }
    if file.is_empty() {
        return Err(VpnError::Config(format!("{what} not configured")));
    }
    std::fs::read_to_string(file)
        .map_err(|e| VpnError::Config(format!("reading {what} from {file}: {e}")))
}
