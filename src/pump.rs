//! Packet pumps: the two directional forwarding loops of a session.
//!
//! Tun→Tunnel drains a channel fed by the TUN reader (or, on the
//! server, by the demultiplexer), applying FEC encoding when enabled.
//! Tunnel→Tun reads the session's byte transport and writes packets to
//! the TUN, reassembling FEC blocks and recovering single losses.
//!
//! Each pump reports exactly once on the exit channel and returns. A
//! closed transport or TUN is a graceful exit, not an error.

use crate::buffer_pool::BufferPool;
use crate::error::{Result, VpnError};
use crate::fec::{FecConfig, XorDecoder, XorEncoder};
use crate::masque::transport::PacketTransport;
use crate::masque::{MAX_FRAME_SIZE, MAX_PACKET_SIZE};
use crate::tun::TunDevice;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, trace, warn};

/// Sequence header on every tunnel packet when FEC is enabled.
pub const SEQ_HEADER_LEN: usize = 4;

/// Capacity of the per-session packet channel feeding Tun→Tunnel.
pub const SESSION_CHANNEL_CAPACITY: usize = 256;

/// Buffers kept per pump pool.
const POOL_BUFFERS: usize = 64;

/// Sentinel for "no block received yet".
const INVALID_BLOCK: u32 = u32::MAX;

/// One terminal report per pump: `error` is `None` on graceful exit.
#[derive(Debug)]
pub struct PumpExit {
    pub direction: &'static str,
    pub error: Option<VpnError>,
}

async fn report(exits: &mpsc::Sender<PumpExit>, direction: &'static str, result: Result<()>) {
    let error = match result {
        Ok(()) => None,
        Err(e) if e.is_closed() => {
            debug!(direction, "transport closed, pump exiting");
            None
        }
        Err(e) => Some(e),
    };
    let _ = exits.send(PumpExit { direction, error }).await;
}

/// Outbound FEC state: the pending block, the encoder, and the
/// monotonic sequence counter. Guarded by a mutex in the session so
/// the demultiplexer and any local source serialize on block
/// boundaries.
pub struct FecSender {
    encoder: XorEncoder,
    pending: Vec<Bytes>,
    seq: u32,
}

impl FecSender {
    pub fn new(config: FecConfig) -> Result<Self> {
        let encoder = XorEncoder::new(config)?;
        Ok(Self {
            encoder,
            pending: Vec::with_capacity(config.block_size as usize),
            seq: 0,
        })
    }

    /// Append a packet to the pending block; encodes and sends the
    /// block once it reaches `block_size`.
    pub async fn push(&mut self, packet: Bytes, transport: &dyn PacketTransport) -> Result<()> {
        self.pending.push(packet);
        if self.pending.len() >= self.encoder.config().block_size as usize {
            self.send_block(transport).await?;
        }
        Ok(())
    }

    /// Encode and send whatever is pending, as if it were a full block.
    pub async fn flush(&mut self, transport: &dyn PacketTransport) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.send_block(transport).await
    }

    async fn send_block(&mut self, transport: &dyn PacketTransport) -> Result<()> {
        let encoded = self.encoder.encode(&self.pending);
        let mut frame = Vec::with_capacity(SEQ_HEADER_LEN + MAX_FRAME_SIZE);
        for packet in &encoded {
            frame.clear();
            frame.extend_from_slice(&self.seq.to_be_bytes());
            frame.extend_from_slice(packet);
            transport.write_packet(&frame).await?;
            self.seq = self.seq.wrapping_add(1);
        }
        self.pending.clear();
        Ok(())
    }

    /// Next sequence number to be written.
    pub fn seq(&self) -> u32 {
        self.seq
    }
}

/// Inbound FEC state: the current block's packets and which indices
/// arrived. Recovery of a block runs when the first packet of the next
/// block shows up.
pub struct FecReceiver {
    decoder: XorDecoder,
    block_size: usize,
    total: usize,
    current_block: u32,
    buffer: Vec<Option<Bytes>>,
    received: Vec<bool>,
}

impl FecReceiver {
    pub fn new(config: FecConfig) -> Result<Self> {
        let decoder = XorDecoder::new(config)?;
        let block_size = config.block_size as usize;
        let total = config.total_block_size();
        Ok(Self {
            decoder,
            block_size,
            total,
            current_block: INVALID_BLOCK,
            buffer: vec![None; total],
            received: vec![false; total],
        })
    }

    /// Accept one sequenced payload.
    ///
    /// Returns any packets recovered by this arrival and whether this
    /// payload is a data packet that should be written through
    /// immediately. Recovery runs when the block's redundancy packet
    /// lands, and again at the block boundary for packets that
    /// straggled in after it.
    pub fn ingest(&mut self, seq: u32, payload: &[u8]) -> (Vec<Bytes>, bool) {
        let block_id = seq / self.total as u32;
        let index = (seq % self.total as u32) as usize;

        let mut recovered = Vec::new();
        if block_id != self.current_block {
            if self.current_block != INVALID_BLOCK {
                recovered = self.recover_block();
            }
            self.current_block = block_id;
            self.buffer.iter_mut().for_each(|slot| *slot = None);
            self.received.iter_mut().for_each(|flag| *flag = false);
        }

        self.buffer[index] = Some(Bytes::copy_from_slice(payload));
        self.received[index] = true;

        if index == self.block_size {
            recovered.extend(self.recover_block());
        }

        (recovered, index < self.block_size)
    }

    /// Recover at most one lost data packet from the current block.
    /// The recovered packet is marked received so a later pass does
    /// not produce it twice.
    fn recover_block(&mut self) -> Vec<Bytes> {
        let lost: Vec<usize> = (0..self.block_size)
            .filter(|&i| !self.received[i])
            .collect();
        if lost.len() != 1 || self.buffer[self.block_size].is_none() {
            return Vec::new();
        }

        let input = self.buffer[..=self.block_size].to_vec();
        let output = self.decoder.decode(&input, &lost);
        let recovered: Vec<Bytes> = output.into_iter().flatten().collect();
        if let Some(packet) = recovered.first() {
            debug!(
                block = self.current_block,
                index = lost[0],
                "FEC recovered lost packet"
            );
            self.buffer[lost[0]] = Some(packet.clone());
            self.received[lost[0]] = true;
        }
        recovered
    }
}

/// Read packets off the TUN and feed the session channel.
///
/// The channel send blocks, so TUN reads pace themselves to the
/// tunnel. Runs once per client; the server uses the demultiplexer
/// instead.
pub async fn tun_reader_task(
    tun: Arc<dyn TunDevice>,
    packets: mpsc::Sender<Bytes>,
    exits: mpsc::Sender<PumpExit>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let result = run_tun_reader(tun, packets, &mut shutdown).await;
    report(&exits, "tun-read", result).await;
}

async fn run_tun_reader(
    tun: Arc<dyn TunDevice>,
    packets: mpsc::Sender<Bytes>,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<()> {
    let offset = tun.header_offset();
    let mut pool = BufferPool::new(offset, MAX_PACKET_SIZE, POOL_BUFFERS);

    loop {
        let mut buf = pool.get();
        let n = tokio::select! {
            r = tun.read_packet(&mut buf, offset) => r?,
            _ = shutdown.recv() => return Ok(()),
        };
        if n == 0 {
            pool.put(buf);
            continue;
        }

        // The pool buffer is reused, so the channel gets a copy.
        let packet = Bytes::copy_from_slice(&buf[offset..offset + n]);
        pool.put(buf);

        if packets.send(packet).await.is_err() {
            return Ok(());
        }
    }
}

/// Tun→Tunnel pump: drain the session channel in batches and write to
/// the tunnel, encoding through the session's FEC state when enabled.
/// Partial blocks flush at every batch boundary.
pub async fn pump_tun_to_tunnel(
    packets: mpsc::Receiver<Bytes>,
    transport: Arc<dyn PacketTransport>,
    fec: Option<Arc<Mutex<FecSender>>>,
    batch_size: usize,
    exits: mpsc::Sender<PumpExit>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let result = run_tun_to_tunnel(packets, transport, fec, batch_size, &mut shutdown).await;
    report(&exits, "tun->tunnel", result).await;
}

async fn run_tun_to_tunnel(
    mut packets: mpsc::Receiver<Bytes>,
    transport: Arc<dyn PacketTransport>,
    fec: Option<Arc<Mutex<FecSender>>>,
    batch_size: usize,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<()> {
    let batch_size = batch_size.max(1);
    let mut batch: Vec<Bytes> = Vec::with_capacity(batch_size);

    loop {
        batch.clear();
        let n = tokio::select! {
            n = packets.recv_many(&mut batch, batch_size) => n,
            _ = shutdown.recv() => return Ok(()),
        };
        if n == 0 {
            // Channel closed: the packet source is gone.
            return Ok(());
        }

        match &fec {
            Some(fec) => {
                let mut sender = fec.lock().await;
                for packet in batch.drain(..) {
                    sender.push(packet, transport.as_ref()).await?;
                }
                // Trailing-latency floor: don't sit on a partial block
                // across an idle gap.
                sender.flush(transport.as_ref()).await?;
            }
            None => {
                for packet in batch.drain(..) {
                    transport.write_packet(&packet).await?;
                }
            }
        }
    }
}

/// Tunnel→Tun pump: read the session transport and write packets to
/// the TUN, reassembling FEC blocks when enabled. Data packets are
/// written through immediately; recovery runs on block boundaries.
pub async fn pump_tunnel_to_tun(
    transport: Arc<dyn PacketTransport>,
    tun: Arc<dyn TunDevice>,
    fec: Option<FecReceiver>,
    exits: mpsc::Sender<PumpExit>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let result = run_tunnel_to_tun(transport, tun, fec, &mut shutdown).await;
    report(&exits, "tunnel->tun", result).await;
}

async fn run_tunnel_to_tun(
    transport: Arc<dyn PacketTransport>,
    tun: Arc<dyn TunDevice>,
    mut fec: Option<FecReceiver>,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<()> {
    let offset = tun.header_offset();
    let mut pool = BufferPool::new(offset, MAX_FRAME_SIZE, POOL_BUFFERS);

    loop {
        let mut buf = pool.get();
        let read = tokio::select! {
            r = transport.read_packet(&mut buf[offset..]) => r,
            _ = shutdown.recv() => {
                pool.put(buf);
                return Ok(());
            }
        };
        let n = match read {
            Ok(n) => n,
            Err(e) => {
                pool.put(buf);
                return Err(e);
            }
        };
        if n == 0 {
            pool.put(buf);
            continue;
        }

        match &mut fec {
            None => {
                let result = tun.write_packet(&buf[..offset + n], offset).await;
                pool.put(buf);
                result?;
            }
            Some(receiver) => {
                if n < SEQ_HEADER_LEN {
                    trace!(len = n, "dropping undersized FEC frame");
                    pool.put(buf);
                    continue;
                }

                let seq = u32::from_be_bytes(
                    buf[offset..offset + SEQ_HEADER_LEN]
                        .try_into()
                        .expect("bounds checked"),
                );
                let payload_len = n - SEQ_HEADER_LEN;
                let (recovered, write_now) =
                    receiver.ingest(seq, &buf[offset + SEQ_HEADER_LEN..offset + n]);

                for packet in recovered {
                    write_recovered(&mut pool, tun.as_ref(), offset, &packet).await?;
                }

                if write_now {
                    // Shift the payload over the sequence header so the
                    // driver gets [header space][payload] in place.
                    buf.copy_within(offset + SEQ_HEADER_LEN..offset + n, offset);
                    let result = tun
                        .write_packet(&buf[..offset + payload_len], offset)
                        .await;
                    pool.put(buf);
                    result?;
                } else {
                    pool.put(buf);
                }
            }
        }
    }
}

async fn write_recovered(
    pool: &mut BufferPool,
    tun: &dyn TunDevice,
    offset: usize,
    packet: &Bytes,
) -> Result<()> {
    if packet.len() > MAX_PACKET_SIZE {
        warn!(len = packet.len(), "recovered packet exceeds frame limit, dropping");
        return Ok(());
    }
    let mut buf = pool.get();
    buf[offset..offset + packet.len()].copy_from_slice(packet);
    let result = tun.write_packet(&buf[..offset + packet.len()], offset).await;
    pool.put(buf);
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_closed() => Err(e),
        Err(e) => {
            // A bad recovered frame must not kill the live path.
            warn!(%e, "failed to write recovered packet to TUN");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masque::transport::memory_pair;

    fn fec_config(block_size: u8) -> FecConfig {
        FecConfig {
            enabled: true,
            redundancy_percent: 10,
            block_size,
        }
    }

    async fn collect_frames(
        peer: &dyn PacketTransport,
        count: usize,
    ) -> Vec<(u32, Bytes)> {
        let mut frames = Vec::new();
        let mut buf = vec![0u8; MAX_FRAME_SIZE + SEQ_HEADER_LEN];
        for _ in 0..count {
            let n = peer.read_packet(&mut buf).await.unwrap();
            assert!(n >= SEQ_HEADER_LEN);
            let seq = u32::from_be_bytes(buf[..4].try_into().unwrap());
            frames.push((seq, Bytes::copy_from_slice(&buf[4..n])));
        }
        frames
    }

    #[tokio::test]
    async fn fec_sender_emits_block_with_sequential_seq() {
        let (near, far) = memory_pair(64);
        let mut sender = FecSender::new(fec_config(3)).unwrap();

        for i in 0..3u8 {
            sender
                .push(Bytes::copy_from_slice(&[i; 8]), &near)
                .await
                .unwrap();
        }

        // 3 data + 1 redundancy, seq 0..=3.
        let frames = collect_frames(&far, 4).await;
        for (i, (seq, _)) in frames.iter().enumerate() {
            assert_eq!(*seq, i as u32);
        }
        assert_eq!(frames[0].1, Bytes::copy_from_slice(&[0u8; 8]));
        assert_eq!(sender.seq(), 4);
    }

    #[tokio::test]
    async fn fec_sender_flush_sends_partial_block() {
        let (near, far) = memory_pair(64);
        let mut sender = FecSender::new(fec_config(10)).unwrap();

        sender.push(Bytes::from_static(b"only"), &near).await.unwrap();
        sender.flush(&near).await.unwrap();

        let frames = collect_frames(&far, 2).await;
        assert_eq!(frames[0].0, 0);
        assert_eq!(frames[0].1, Bytes::from_static(b"only"));
        assert_eq!(frames[1].0, 1); // redundancy for the 1-packet block
        assert_eq!(sender.seq(), 2);

        // Flushing an empty buffer sends nothing.
        sender.flush(&near).await.unwrap();
        assert_eq!(sender.seq(), 2);
    }

    #[tokio::test]
    async fn fec_receiver_passes_data_through_and_recovers() {
        let config = fec_config(3);
        let mut receiver = FecReceiver::new(config).unwrap();
        let total = config.total_block_size() as u32;
        assert_eq!(total, 4);

        // Encode one block to get a real redundancy packet.
        let encoder = XorEncoder::new(config).unwrap();
        let data = vec![
            Bytes::from_static(b"pkt-0"),
            Bytes::from_static(b"pkt-1!"),
            Bytes::from_static(b"pkt-2!!"),
        ];
        let encoded = encoder.encode(&data);

        // Deliver seq 0, 2, 3 (drop seq 1).
        let (r0, now0) = receiver.ingest(0, &encoded[0]);
        assert!(r0.is_empty() && now0);
        let (r2, now2) = receiver.ingest(2, &encoded[2]);
        assert!(r2.is_empty() && now2);

        // The redundancy packet completes the block and recovers.
        let (recovered, now3) = receiver.ingest(3, &encoded[3]);
        assert!(!now3); // redundancy packet, never written through
        assert_eq!(recovered, vec![Bytes::from_static(b"pkt-1!")]);

        // The block boundary does not produce the packet again.
        let (again, now) = receiver.ingest(total, b"next-block");
        assert!(now);
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn fec_receiver_skips_double_loss() {
        let config = fec_config(3);
        let mut receiver = FecReceiver::new(config).unwrap();
        let total = config.total_block_size() as u32;

        let encoder = XorEncoder::new(config).unwrap();
        let data = vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
        ];
        let encoded = encoder.encode(&data);

        receiver.ingest(0, &encoded[0]);
        receiver.ingest(3, &encoded[3]); // seq 1 and 2 lost

        let (recovered, _) = receiver.ingest(total, b"next");
        assert!(recovered.is_empty());
    }

    #[tokio::test]
    async fn pump_raw_path_forwards_in_order() {
        let (near, far) = memory_pair(64);
        let (tx, rx) = mpsc::channel(16);
        let (exit_tx, mut exit_rx) = mpsc::channel(4);
        let (shutdown_tx, _) = broadcast::channel(1);

        let pump = tokio::spawn(pump_tun_to_tunnel(
            rx,
            Arc::new(near),
            None,
            8,
            exit_tx,
            shutdown_tx.subscribe(),
        ));

        for i in 0..5u8 {
            tx.send(Bytes::copy_from_slice(&[i; 10])).await.unwrap();
        }
        drop(tx);

        let exit = exit_rx.recv().await.unwrap();
        assert!(exit.error.is_none());
        pump.await.unwrap();

        // Frames arrive unsequenced and in order.
        let mut buf = vec![0u8; 64];
        for i in 0..5u8 {
            let n = far.read_packet(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &[i; 10]);
        }
    }

    #[tokio::test]
    async fn pump_tunnel_to_tun_strips_offset() {
        use crate::tun::MemTun;

        let (near, far) = memory_pair(64);
        let (tun, mut harness) = MemTun::new("t0", 4);
        let (exit_tx, _exit_rx) = mpsc::channel(4);
        let (shutdown_tx, _) = broadcast::channel(1);

        tokio::spawn(pump_tunnel_to_tun(
            Arc::new(far),
            tun,
            None,
            exit_tx,
            shutdown_tx.subscribe(),
        ));

        near.write_packet(b"ip-packet-bytes").await.unwrap();
        let written = harness.written().await.unwrap();
        assert_eq!(written, Bytes::from_static(b"ip-packet-bytes"));

        let _ = shutdown_tx.send(());
    }
}
