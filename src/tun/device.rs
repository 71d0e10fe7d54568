//! TUN device abstraction.
//!
//! The pumps depend only on the [`TunDevice`] trait: read and write
//! with a platform header offset, and a batch-size hint. The Linux
//! backend wraps `tokio-tun`; [`MemTun`] is the in-memory backend the
//! test suite drives packets through.

use crate::error::{Result, VpnError};
use async_trait::async_trait;
use bytes::Bytes;
use ipnetwork::IpNetwork;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
#[cfg(target_os = "linux")]
use tracing::info;

/// Header offset for the primary Linux path (no packet info).
pub const LINUX_HEADER_OFFSET: usize = 0;
/// Header offset for the macOS point-to-point path (4-byte AF prefix).
pub const DARWIN_HEADER_OFFSET: usize = 4;
/// Header offset when the driver prepends a virtio-net header.
pub const VIRTIO_HEADER_OFFSET: usize = 10;

/// Default packets-per-burst when the driver reports nothing better.
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// OS-level layer-3 interface as the pumps see it.
///
/// `offset` reserves leading bytes for the platform header: reads land
/// at `buf[offset..]`, writes take `[offset bytes of header space]
/// [packet]` and hand the driver the whole slice.
#[async_trait]
pub trait TunDevice: Send + Sync {
    fn name(&self) -> &str;

    fn mtu(&self) -> u16;

    /// Leading bytes the platform reserves in every buffer.
    fn header_offset(&self) -> usize;

    /// Packets the driver can produce per read burst.
    fn batch_size(&self) -> usize;

    /// Read one packet into `buf[offset..]`. Returns the payload
    /// length; 0 means no packet was available.
    async fn read_packet(&self, buf: &mut [u8], offset: usize) -> Result<usize>;

    /// Write `buf`, where `buf[..offset]` is header space and
    /// `buf[offset..]` the IP packet.
    async fn write_packet(&self, buf: &[u8], offset: usize) -> Result<()>;

    /// Release OS resources. Backends that close on drop may leave
    /// this as the default no-op.
    fn close(&self) {}
}

/// Creation parameters for a TUN device.
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Requested name; empty lets the kernel pick.
    pub name: String,
    /// Host address and prefix to assign.
    pub address: IpNetwork,
    /// Point-to-point destination (macOS path); `None` elsewhere.
    pub destination: Option<std::net::IpAddr>,
    pub mtu: u16,
}

/// Create and configure the platform TUN device.
#[cfg(target_os = "linux")]
pub async fn create_tun(config: TunConfig) -> Result<Arc<dyn TunDevice>> {
    let IpNetwork::V4(v4net) = config.address else {
        return Err(VpnError::System(
            "linux TUN creation requires an IPv4 address; add IPv6 via `ip -6 addr`".into(),
        ));
    };

    let mut builder = tokio_tun::TunBuilder::new();
    if !config.name.is_empty() {
        builder = builder.name(&config.name);
    }
    let tun = builder
        .address(v4net.ip())
        .netmask(v4net.mask())
        .mtu(config.mtu as i32)
        .up()
        .try_build()
        .map_err(|e| VpnError::System(format!("creating TUN device: {e}")))?;

    let name = tun.name().to_string();
    info!(name = %name, address = %config.address, mtu = config.mtu, "TUN device created");

    Ok(Arc::new(LinuxTun {
        name,
        mtu: config.mtu,
        tun,
    }))
}

#[cfg(not(target_os = "linux"))]
pub async fn create_tun(_config: TunConfig) -> Result<Arc<dyn TunDevice>> {
    Err(VpnError::System(
        "no TUN backend for this platform".into(),
    ))
}

/// Linux backend over `tokio-tun`. The kernel driver handles
/// concurrent reads and writes, so the handle is shared freely.
#[cfg(target_os = "linux")]
pub struct LinuxTun {
    name: String,
    mtu: u16,
    tun: tokio_tun::Tun,
}

#[cfg(target_os = "linux")]
#[async_trait]
impl TunDevice for LinuxTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn header_offset(&self) -> usize {
        LINUX_HEADER_OFFSET
    }

    fn batch_size(&self) -> usize {
        DEFAULT_BATCH_SIZE
    }

    async fn read_packet(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let n = self.tun.recv(&mut buf[offset..]).await?;
        Ok(n)
    }

    async fn write_packet(&self, buf: &[u8], offset: usize) -> Result<()> {
        self.tun.send(&buf[offset..]).await?;
        Ok(())
    }
}

/// In-memory TUN used by the test suite: injected packets appear on
/// `read_packet`, written packets come out the harness receiver.
/// Channels are bounded; injecting into a full device drops.
pub struct MemTun {
    name: String,
    mtu: u16,
    offset: usize,
    batch: usize,
    incoming: Mutex<mpsc::Receiver<Bytes>>,
    outgoing: mpsc::Sender<Bytes>,
}

/// Test-side handle for a [`MemTun`].
pub struct MemTunHarness {
    inject_tx: mpsc::Sender<Bytes>,
    written_rx: mpsc::Receiver<Bytes>,
}

impl MemTunHarness {
    /// Make a packet readable from the device. Drops on overrun.
    pub fn inject(&self, packet: Bytes) {
        let _ = self.inject_tx.try_send(packet);
    }

    /// Next packet the pumps wrote to the device.
    pub async fn written(&mut self) -> Option<Bytes> {
        self.written_rx.recv().await
    }
}

impl MemTun {
    pub fn new(name: &str, offset: usize) -> (Arc<Self>, MemTunHarness) {
        let (inject_tx, inject_rx) = mpsc::channel(128);
        let (written_tx, written_rx) = mpsc::channel(128);
        let tun = Arc::new(Self {
            name: name.to_string(),
            mtu: 1400,
            offset,
            batch: 4,
            incoming: Mutex::new(inject_rx),
            outgoing: written_tx,
        });
        (
            tun,
            MemTunHarness {
                inject_tx,
                written_rx,
            },
        )
    }
}

#[async_trait]
impl TunDevice for MemTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn header_offset(&self) -> usize {
        self.offset
    }

    fn batch_size(&self) -> usize {
        self.batch
    }

    async fn read_packet(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let packet = {
            let mut incoming = self.incoming.lock().await;
            incoming.recv().await
        };
        match packet {
            Some(p) => {
                let room = buf.len().saturating_sub(offset);
                if p.len() > room {
                    return Err(VpnError::Resource(format!(
                        "packet of {} bytes exceeds buffer room {room}",
                        p.len()
                    )));
                }
                buf[offset..offset + p.len()].copy_from_slice(&p);
                Ok(p.len())
            }
            None => Err(VpnError::TransportClosed),
        }
    }

    async fn write_packet(&self, buf: &[u8], offset: usize) -> Result<()> {
        let packet = Bytes::copy_from_slice(&buf[offset..]);
        self.outgoing
            .send(packet)
            .await
            .map_err(|_| VpnError::TransportClosed)
    }
}
