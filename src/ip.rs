//! IP address arithmetic for prefix and pool handling.
//!
//! Small helpers shared by the pool allocator and the TUN
//! configuration path: increment-with-carry, last address of a
//! prefix, and host enumeration.

use crate::error::{Result, VpnError};
use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Next address after `addr`, carrying across bytes. Wraps at the top
/// of the address space.
pub fn next_address(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            for b in octets.iter_mut().rev() {
                *b = b.wrapping_add(1);
                if *b != 0 {
                    break;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        IpAddr::V6(v6) => {
            let mut octets = v6.octets();
            for b in octets.iter_mut().rev() {
                *b = b.wrapping_add(1);
                if *b != 0 {
                    break;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }
}

/// Last address covered by `prefix` (the broadcast address for IPv4
/// networks): all host bits set to one.
pub fn last_address(prefix: &IpNetwork) -> IpAddr {
    match prefix {
        IpNetwork::V4(net) => {
            let bits = u32::from(net.network()) | !u32::from(net.mask());
            IpAddr::V4(Ipv4Addr::from(bits))
        }
        IpNetwork::V6(net) => {
            let bits = u128::from(net.network()) | !u128::from(net.mask());
            IpAddr::V6(Ipv6Addr::from(bits))
        }
    }
}

/// Enumerate the assignable host addresses of `prefix`, lowest first.
///
/// Excludes the network address and, for IPv4, the broadcast address.
/// The gateway is excluded separately by the pool.
pub fn host_addresses(prefix: &IpNetwork) -> Vec<IpAddr> {
    let network = prefix.network_addr();
    let last = last_address(prefix);
    let mut out = Vec::new();
    let mut addr = next_address(network);
    while addr <= last {
        // IPv4 reserves the all-ones address for broadcast.
        if !(prefix.is_ipv4() && addr == last) {
            out.push(addr);
        }
        if addr == last {
            break;
        }
        addr = next_address(addr);
    }
    out
}

/// Host prefix (/32 or /128) for a single address.
pub fn host_prefix(addr: IpAddr) -> IpNetwork {
    match addr {
        IpAddr::V4(v4) => IpNetwork::new(IpAddr::V4(v4), 32).expect("/32 is valid"),
        IpAddr::V6(v6) => IpNetwork::new(IpAddr::V6(v6), 128).expect("/128 is valid"),
    }
}

/// Parse a CIDR string into a network prefix (host bits cleared).
pub fn parse_prefix(cidr: &str) -> Result<IpNetwork> {
    let net: IpNetwork = cidr
        .parse()
        .map_err(|e| VpnError::Config(format!("invalid CIDR {cidr}: {e}")))?;
    let masked = IpNetwork::new(net.network_addr(), net.prefix())
        .map_err(|e| VpnError::Config(format!("invalid CIDR {cidr}: {e}")))?;
    Ok(masked)
}

/// Extension to get the network address uniformly across families.
pub trait NetworkAddr {
    fn network_addr(&self) -> IpAddr;
}

impl NetworkAddr for IpNetwork {
    fn network_addr(&self) -> IpAddr {
        match self {
            IpNetwork::V4(net) => IpAddr::V4(net.network()),
            IpNetwork::V6(net) => IpAddr::V6(net.network()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_address_carries() {
        assert_eq!(
            next_address("10.0.0.255".parse().unwrap()),
            "10.0.1.0".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            next_address("10.0.0.1".parse().unwrap()),
            "10.0.0.2".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            next_address("fd00::ff".parse().unwrap()),
            "fd00::100".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn last_address_is_broadcast() {
        let net: IpNetwork = "10.0.0.0/24".parse().unwrap();
        assert_eq!(last_address(&net), "10.0.0.255".parse::<IpAddr>().unwrap());

        let net: IpNetwork = "10.9.9.0/30".parse().unwrap();
        assert_eq!(last_address(&net), "10.9.9.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn host_addresses_skip_network_and_broadcast() {
        let net: IpNetwork = "10.9.9.0/30".parse().unwrap();
        let hosts = host_addresses(&net);
        assert_eq!(
            hosts,
            vec![
                "10.9.9.1".parse::<IpAddr>().unwrap(),
                "10.9.9.2".parse::<IpAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn host_addresses_lowest_first() {
        let net: IpNetwork = "192.168.1.0/29".parse().unwrap();
        let hosts = host_addresses(&net);
        assert_eq!(hosts.len(), 6);
        assert_eq!(hosts[0], "192.168.1.1".parse::<IpAddr>().unwrap());
        assert_eq!(hosts[5], "192.168.1.6".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn parse_prefix_masks_host_bits() {
        let net = parse_prefix("10.0.0.5/24").unwrap();
        assert_eq!(net.network_addr(), "10.0.0.0".parse::<IpAddr>().unwrap());
        assert!(parse_prefix("10.0.0.0/33").is_err());
        assert!(parse_prefix("not-a-cidr").is_err());
    }

    #[test]
    fn host_prefix_width() {
        assert_eq!(host_prefix("10.0.0.2".parse().unwrap()).prefix(), 32);
        assert_eq!(host_prefix("fd00::2".parse().unwrap()).prefix(), 128);
    }
}
