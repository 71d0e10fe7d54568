//! IP packet header parsing.
//!
//! The demultiplexer only needs the version and the destination
//! address; the pumps use the source address for ingress validation.

use crate::error::{Result, VpnError};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Minimal view over an IP packet header, IPv4 or IPv6.
#[derive(Debug, Clone, Copy)]
pub struct IpPacketInfo {
    pub version: u8,
    pub protocol: u8,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
}

impl IpPacketInfo {
    /// Parse the fixed header. Frames shorter than the fixed header or
    /// with an unknown version are rejected.
    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.is_empty() {
            return Err(VpnError::Protocol("empty IP packet".into()));
        }
        match packet[0] >> 4 {
            4 => Self::parse_v4(packet),
            6 => Self::parse_v6(packet),
            v => Err(VpnError::Protocol(format!("unknown IP version: {v}"))),
        }
    }

    fn parse_v4(packet: &[u8]) -> Result<Self> {
        if packet.len() < 20 {
            return Err(VpnError::Protocol(format!(
                "IPv4 packet too short: {} bytes",
                packet.len()
            )));
        }
        let src: [u8; 4] = packet[12..16].try_into().expect("bounds checked");
        let dst: [u8; 4] = packet[16..20].try_into().expect("bounds checked");
        Ok(Self {
            version: 4,
            protocol: packet[9],
            src_addr: IpAddr::V4(Ipv4Addr::from(src)),
            dst_addr: IpAddr::V4(Ipv4Addr::from(dst)),
        })
    }

    fn parse_v6(packet: &[u8]) -> Result<Self> {
        if packet.len() < 40 {
            return Err(VpnError::Protocol(format!(
                "IPv6 packet too short: {} bytes",
                packet.len()
            )));
        }
        let src: [u8; 16] = packet[8..24].try_into().expect("bounds checked");
        let dst: [u8; 16] = packet[24..40].try_into().expect("bounds checked");
        Ok(Self {
            version: 6,
            protocol: packet[6],
            src_addr: IpAddr::V6(Ipv6Addr::from(src)),
            dst_addr: IpAddr::V6(Ipv6Addr::from(dst)),
        })
    }

    pub fn protocol_name(&self) -> &'static str {
        match (self.version, self.protocol) {
            (4, 1) => "ICMP",
            (6, 58) => "ICMPv6",
            (_, 6) => "TCP",
            (_, 17) => "UDP",
            _ => "OTHER",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ipv4_header() {
        // ICMP echo shell: 10.0.0.2 -> 10.0.0.1
        let packet = [
            0x45, 0x00, 0x00, 0x1c, 0x00, 0x01, 0x00, 0x00, 0x40, 0x01, 0x00, 0x00, 0x0a,
            0x00, 0x00, 0x02, 0x0a, 0x00, 0x00, 0x01,
        ];
        let info = IpPacketInfo::parse(&packet).unwrap();
        assert_eq!(info.version, 4);
        assert_eq!(info.protocol_name(), "ICMP");
        assert_eq!(info.src_addr, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(info.dst_addr, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn parse_ipv6_header() {
        let mut packet = [0u8; 40];
        packet[0] = 0x60;
        packet[6] = 17; // UDP
        packet[8] = 0xfd; // src fd00::...
        packet[24] = 0xfd;
        packet[39] = 0x02; // dst ...::2
        let info = IpPacketInfo::parse(&packet).unwrap();
        assert_eq!(info.version, 6);
        assert_eq!(info.protocol_name(), "UDP");
        assert_eq!(info.dst_addr, "fd00::2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn rejects_short_and_unknown() {
        assert!(IpPacketInfo::parse(&[]).is_err());
        assert!(IpPacketInfo::parse(&[0x45, 0x00]).is_err());
        assert!(IpPacketInfo::parse(&[0x45; 19]).is_err());
        let mut v6_short = [0u8; 39];
        v6_short[0] = 0x60;
        assert!(IpPacketInfo::parse(&v6_short).is_err());
        assert!(IpPacketInfo::parse(&[0x10; 20]).is_err());
    }
}
