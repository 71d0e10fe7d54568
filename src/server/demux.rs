//! Server TUN demultiplexer and per-session ingress filter.
//!
//! One task reads the shared server TUN and dispatches each packet to
//! the owning session by destination address. Packets for addresses
//! with no session are dropped silently; a full session channel is a
//! drop too, so one stalled client cannot stall the shared TUN read.

use crate::buffer_pool::BufferPool;
use crate::error::Result;
use crate::masque::MAX_PACKET_SIZE;
use crate::server::metrics::Metrics;
use crate::server::session::SessionTable;
use crate::tun::{IpPacketInfo, TunDevice};
use async_trait::async_trait;
use bytes::Bytes;
use ipnetwork::IpNetwork;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, trace};

/// Buffers kept by the demultiplexer's read pool.
const DEMUX_POOL_BUFFERS: usize = 64;

/// Read the server TUN and route packets to sessions by destination.
pub async fn demux_task(
    tun: Arc<dyn TunDevice>,
    table: Arc<SessionTable>,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let offset = tun.header_offset();
    let mut pool = BufferPool::new(offset, MAX_PACKET_SIZE, DEMUX_POOL_BUFFERS);

    loop {
        let mut buf = pool.get();
        let read = tokio::select! {
            r = tun.read_packet(&mut buf, offset) => r,
            _ = shutdown.recv() => {
                debug!("demultiplexer stopping");
                return;
            }
        };
        let n = match read {
            Ok(n) => n,
            Err(e) if e.is_closed() => {
                debug!("server TUN closed, demultiplexer exiting");
                return;
            }
            Err(e) => {
                error!(%e, "server TUN read failed");
                return;
            }
        };
        if n == 0 {
            pool.put(buf);
            continue;
        }

        let packet = &buf[offset..offset + n];
        match IpPacketInfo::parse(packet) {
            Ok(info) => match table.lookup_addr(&info.dst_addr) {
                Some(session) => {
                    match session.tx.try_send(Bytes::copy_from_slice(packet)) {
                        Ok(()) => metrics.record_forwarded(n),
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            metrics
                                .packets_dropped_backpressure
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            trace!(client = %session.client_id, "session channel closed");
                        }
                    }
                }
                None => {
                    metrics
                        .packets_dropped_unknown_dest
                        .fetch_add(1, Ordering::Relaxed);
                    trace!(proto = info.protocol_name(), "packet for unknown destination dropped");
                }
            },
            Err(e) => {
                trace!(%e, len = n, "unparseable packet from TUN dropped");
            }
        }

        pool.put(buf);
    }
}

/// TUN decorator that drops tunnel-ingress packets whose source
/// address is not the session's assigned address. Spoofed or
/// misrouted frames never reach the shared TUN.
pub struct SourceFilteredTun {
    inner: Arc<dyn TunDevice>,
    allowed: Vec<std::net::IpAddr>,
    metrics: Arc<Metrics>,
}

impl SourceFilteredTun {
    pub fn new(
        inner: Arc<dyn TunDevice>,
        assigned: IpNetwork,
        assigned_v6: Option<IpNetwork>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let mut allowed = vec![assigned.ip()];
        if let Some(v6) = assigned_v6 {
            allowed.push(v6.ip());
        }
        Self {
            inner,
            allowed,
            metrics,
        }
    }
}

#[async_trait]
impl TunDevice for SourceFilteredTun {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn mtu(&self) -> u16 {
        self.inner.mtu()
    }

    fn header_offset(&self) -> usize {
        self.inner.header_offset()
    }

    fn batch_size(&self) -> usize {
        self.inner.batch_size()
    }

    async fn read_packet(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        self.inner.read_packet(buf, offset).await
    }

    async fn write_packet(&self, buf: &[u8], offset: usize) -> Result<()> {
        match IpPacketInfo::parse(&buf[offset..]) {
            Ok(info) if self.allowed.contains(&info.src_addr) => {
                self.inner.write_packet(buf, offset).await
            }
            Ok(info) => {
                self.metrics
                    .packets_dropped_bad_source
                    .fetch_add(1, Ordering::Relaxed);
                trace!(src = %info.src_addr, "dropping packet with foreign source address");
                Ok(())
            }
            Err(e) => {
                trace!(%e, "dropping unparseable tunnel packet");
                Ok(())
            }
        }
    }

    fn close(&self) {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::session::Session;
    use crate::tun::MemTun;

    #[tokio::test]
    async fn demux_routes_by_destination() {
        let (tun, harness) = MemTun::new("srv0", 0);
        let table = Arc::new(SessionTable::new());
        let metrics = Arc::new(Metrics::new());

        let (tx, mut session_rx) = tokio::sync::mpsc::channel(8);
        let session = Session::new(
            "alice".into(),
            "10.0.0.2/32".parse().unwrap(),
            None,
            tx,
            None,
        );
        table.insert(session);

        let (shutdown_tx, _) = broadcast::channel(1);
        tokio::spawn(demux_task(
            tun,
            table.clone(),
            metrics.clone(),
            shutdown_tx.subscribe(),
        ));

        // dst 10.0.0.2: delivered.
        let mut to_alice = vec![
            0x45, 0x00, 0x00, 0x1c, 0x00, 0x01, 0x00, 0x00, 0x40, 0x01, 0x00, 0x00, 0x0a,
            0x00, 0x00, 0x01, 0x0a, 0x00, 0x00, 0x02,
        ];
        harness.inject(Bytes::copy_from_slice(&to_alice));

        // dst 10.0.0.9: no session, dropped.
        to_alice[19] = 9;
        harness.inject(Bytes::copy_from_slice(&to_alice));

        let delivered = session_rx.recv().await.unwrap();
        assert_eq!(delivered[19], 2);

        // Give the drop a moment to be counted.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let snap = metrics.snapshot();
        assert_eq!(snap.packets_forwarded, 1);
        assert_eq!(snap.packets_dropped_unknown_dest, 1);

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn source_filter_drops_foreign_sources() {
        let (inner, mut harness) = MemTun::new("srv0", 0);
        let metrics = Arc::new(Metrics::new());
        let filtered = SourceFilteredTun::new(
            inner,
            "10.0.0.2/32".parse().unwrap(),
            None,
            metrics.clone(),
        );

        let mut packet = vec![
            0x45, 0x00, 0x00, 0x1c, 0x00, 0x01, 0x00, 0x00, 0x40, 0x01, 0x00, 0x00, 0x0a,
            0x00, 0x00, 0x02, 0x0a, 0x00, 0x00, 0x01,
        ];
        filtered.write_packet(&packet, 0).await.unwrap();
        assert!(harness.written().await.is_some());

        // Same packet with a spoofed source.
        packet[15] = 66;
        filtered.write_packet(&packet, 0).await.unwrap();
        assert_eq!(
            metrics.snapshot().packets_dropped_bad_source,
            1,
            "spoofed packet must be dropped"
        );
    }
}
