//! IP address pool for VPN clients.
//!
//! Allocates host addresses out of the configured VPN prefix, skipping
//! the network address, the broadcast address, and the gateway. All
//! operations are thread-safe behind a single mutex.

use crate::error::{Result, VpnError};
use crate::ip::{host_addresses, host_prefix, NetworkAddr};
use ipnetwork::IpNetwork;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Mutex;

/// Pool statistics: `(total, allocated, available)` counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub allocated: usize,
    pub available: usize,
}

/// Allocator of host addresses from a VPN network prefix.
///
/// `allocate` hands out the lowest free address; an address released
/// by a disconnecting client is the first candidate for the next
/// allocation, and reconnecting clients tend to get their address back.
#[derive(Debug)]
pub struct IpPool {
    inner: Mutex<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    network: IpNetwork,
    gateway: IpAddr,
    free: BTreeSet<IpAddr>,
    allocated: HashMap<IpAddr, String>,
}

impl IpPool {
    /// Create a pool covering `network`, with `gateway` excluded from
    /// allocation. Fails if the gateway is not a host address of the
    /// network.
    pub fn new(network: IpNetwork, gateway: IpAddr) -> Result<Self> {
        if !network.contains(gateway) {
            return Err(VpnError::Config(format!(
                "gateway {gateway} is outside network {network}"
            )));
        }
        if gateway == network.network_addr() {
            return Err(VpnError::Config(format!(
                "gateway {gateway} is the network address of {network}"
            )));
        }

        let free: BTreeSet<IpAddr> = host_addresses(&network)
            .into_iter()
            .filter(|a| *a != gateway)
            .collect();

        Ok(Self {
            inner: Mutex::new(PoolInner {
                network,
                gateway,
                free,
                allocated: HashMap::new(),
            }),
        })
    }

    /// Allocate the lowest free host address for `client_id`, returned
    /// as a /32 (or /128) prefix.
    pub fn allocate(&self, client_id: &str) -> Result<IpNetwork> {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        let addr = *inner.free.iter().next().ok_or(VpnError::Exhausted)?;
        inner.free.remove(&addr);
        inner.allocated.insert(addr, client_id.to_string());

        debug_assert!(inner.network.contains(addr));
        debug_assert_ne!(addr, inner.gateway);
        Ok(host_prefix(addr))
    }

    /// Return `addr` to the free set. No-op if the address was not
    /// allocated, so a double release is harmless.
    pub fn release(&self, addr: IpAddr) {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        if inner.allocated.remove(&addr).is_some() {
            inner.free.insert(addr);
        }
    }

    /// Owner of an allocated address, if any.
    pub fn owner(&self, addr: IpAddr) -> Option<String> {
        let inner = self.inner.lock().expect("pool mutex poisoned");
        inner.allocated.get(&addr).cloned()
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().expect("pool mutex poisoned");
        PoolStats {
            total: inner.free.len() + inner.allocated.len(),
            allocated: inner.allocated.len(),
            available: inner.free.len(),
        }
    }

    /// Gateway address this pool was built around.
    pub fn gateway(&self) -> IpAddr {
        self.inner.lock().expect("pool mutex poisoned").gateway
    }

    /// Covering network prefix.
    pub fn network(&self) -> IpNetwork {
        self.inner.lock().expect("pool mutex poisoned").network
    }
}
