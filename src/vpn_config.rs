//! Address assignment exchange.
//!
//! After the server accepts a CONNECT-IP request it pushes the
//! assigned prefix and the advertised routes to the client over the
//! control channel of the session, before packet framing starts.
//!
//! Wire format: length-prefixed JSON, for extensibility.

use crate::error::{Result, VpnError};
use crate::ip::parse_prefix;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum encoded assignment size.
const MAX_CONFIG_SIZE: usize = 65536;

/// Assignment pushed from server to client after a 200 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnConfig {
    /// Assigned host prefix (/32), CIDR notation.
    pub assigned: String,
    /// Assigned IPv6 host prefix (/128), when the server runs a v6 pool.
    #[serde(default)]
    pub assigned_v6: Option<String>,
    /// Gateway address (the server's TUN address).
    pub gateway: IpAddr,
    /// Routes the client should send through the tunnel, CIDR notation.
    #[serde(default)]
    pub routes: Vec<String>,
    /// MTU for the client TUN.
    pub mtu: u16,
}

impl VpnConfig {
    pub fn new(assigned: IpNetwork, gateway: IpAddr, mtu: u16) -> Self {
        Self {
            assigned: assigned.to_string(),
            assigned_v6: None,
            gateway,
            routes: Vec::new(),
            mtu,
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.routes.push(route.into());
        self
    }

    pub fn with_assigned_v6(mut self, prefix: IpNetwork) -> Self {
        self.assigned_v6 = Some(prefix.to_string());
        self
    }

    /// Parse the assigned prefix.
    pub fn assigned_prefix(&self) -> Result<IpNetwork> {
        let prefix: IpNetwork = self
            .assigned
            .parse()
            .map_err(|e| VpnError::Protocol(format!("assigned prefix {}: {e}", self.assigned)))?;
        Ok(prefix)
    }

    /// Parse the advertised routes, rejecting malformed entries.
    pub fn parsed_routes(&self) -> Result<Vec<IpNetwork>> {
        self.routes.iter().map(|r| parse_prefix(r)).collect()
    }

    /// Serialize to length-prefixed JSON.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        if json.len() > MAX_CONFIG_SIZE {
            return Err(VpnError::Protocol(format!(
                "assignment message too large: {} bytes",
                json.len()
            )));
        }
        let mut buf = Vec::with_capacity(4 + json.len());
        buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
        buf.extend_from_slice(&json);
        Ok(buf)
    }

    /// Send over the control channel.
    pub async fn send<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let bytes = self.to_bytes()?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Receive from the control channel.
    pub async fn recv<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_CONFIG_SIZE {
            return Err(VpnError::Protocol(format!(
                "assignment message too large: {len} bytes"
            )));
        }

        let mut json = vec![0u8; len];
        reader.read_exact(&mut json).await?;
        Ok(serde_json::from_slice(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_roundtrip() {
        let config = VpnConfig::new(
            "10.0.0.2/32".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
            1400,
        )
        .with_route("0.0.0.0/0")
        .with_route("192.168.50.0/24");

        let bytes = config.to_bytes().unwrap();
        let parsed: VpnConfig = serde_json::from_slice(&bytes[4..]).unwrap();

        assert_eq!(parsed.assigned, "10.0.0.2/32");
        assert_eq!(parsed.gateway, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(parsed.routes.len(), 2);
        assert_eq!(parsed.mtu, 1400);
    }

    #[test]
    fn prefix_and_route_parsing() {
        let config = VpnConfig::new(
            "10.0.0.2/32".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
            1400,
        )
        .with_route("0.0.0.0/0");

        assert_eq!(config.assigned_prefix().unwrap().prefix(), 32);
        let routes = config.parsed_routes().unwrap();
        assert_eq!(routes[0].prefix(), 0);

        let bad = VpnConfig {
            routes: vec!["10.0.0.0/99".into()],
            ..config
        };
        assert!(bad.parsed_routes().is_err());
    }

    #[tokio::test]
    async fn async_send_recv() {
        let config = VpnConfig::new(
            "10.0.0.7/32".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
            1380,
        );

        let (mut client, mut server) = tokio::io::duplex(1024);
        let send = tokio::spawn(async move {
            config.send(&mut client).await.unwrap();
        });
        let received = VpnConfig::recv(&mut server).await.unwrap();
        send.await.unwrap();

        assert_eq!(received.assigned, "10.0.0.7/32");
        assert_eq!(received.mtu, 1380);
    }

    #[tokio::test]
    async fn recv_rejects_oversized() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let len = (MAX_CONFIG_SIZE as u32 + 1).to_be_bytes();
            let _ = client.write_all(&len).await;
        });
        assert!(VpnConfig::recv(&mut server).await.is_err());
    }
}
