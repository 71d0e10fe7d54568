//! Packet-oriented transport over the negotiated byte stream.
//!
//! The QUIC stream is a byte pipe, so each tunnel packet is framed
//! with a 2-byte big-endian length. When FEC is enabled the framed
//! payload additionally starts with the 4-byte sequence header; the
//! transport is oblivious to that.

use super::{MAX_FRAME_SIZE, TUNNEL_READ_TIMEOUT, TUNNEL_WRITE_TIMEOUT};
use crate::error::{Result, VpnError};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

/// Length prefix on every tunnel frame.
pub const FRAME_HEADER_LEN: usize = 2;

/// Bidirectional packet transport between the peers of one session.
///
/// Implementations must be safe to drive from one reader task and one
/// writer task concurrently.
#[async_trait]
pub trait PacketTransport: Send + Sync {
    /// Read one packet into `buf`, returning its length.
    /// [`VpnError::TransportClosed`] signals orderly EOF.
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one packet.
    async fn write_packet(&self, packet: &[u8]) -> Result<()>;

    /// Close the write direction; the peer observes EOF.
    async fn close(&self) -> Result<()>;
}

/// Production transport: the CONNECT-IP bidirectional QUIC stream.
#[derive(Debug)]
pub struct QuicTransport {
    send: Mutex<quinn::SendStream>,
    recv: Mutex<quinn::RecvStream>,
}

impl QuicTransport {
    pub fn new(send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
        Self {
            send: Mutex::new(send),
            recv: Mutex::new(recv),
        }
    }
}

#[async_trait]
impl PacketTransport for QuicTransport {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        let mut recv = self.recv.lock().await;

        // No deadline while waiting for a frame to start: an idle
        // tunnel is normal, and the QUIC keepalive/idle timeout pair
        // detects dead peers. A deadline here would also cancel
        // read_exact mid-header and desync the framing.
        let mut header = [0u8; FRAME_HEADER_LEN];
        recv.read_exact(&mut header).await?;

        let len = u16::from_be_bytes(header) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(VpnError::Protocol(format!(
                "tunnel frame of {len} bytes exceeds limit {MAX_FRAME_SIZE}"
            )));
        }
        if len > buf.len() {
            return Err(VpnError::Resource(format!(
                "tunnel frame of {len} bytes exceeds buffer of {}",
                buf.len()
            )));
        }

        // A frame that started must complete within the deadline; an
        // expiry abandons the stream, so the cancelled read is safe.
        match timeout(TUNNEL_READ_TIMEOUT, recv.read_exact(&mut buf[..len])).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(VpnError::Connection(
                    "tunnel read timed out mid-frame".into(),
                ))
            }
        }
        Ok(len)
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<()> {
        if packet.len() > MAX_FRAME_SIZE {
            return Err(VpnError::Protocol(format!(
                "refusing to send {} byte frame (limit {MAX_FRAME_SIZE})",
                packet.len()
            )));
        }

        let mut send = self.send.lock().await;
        let header = (packet.len() as u16).to_be_bytes();
        let write = async {
            send.write_all(&header).await?;
            send.write_all(packet).await?;
            Ok::<(), VpnError>(())
        };
        match timeout(TUNNEL_WRITE_TIMEOUT, write).await {
            Ok(result) => result,
            Err(_) => Err(VpnError::Connection("tunnel write timed out".into())),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut send = self.send.lock().await;
        // finish() errors only if the stream is already closed.
        let _ = send.finish();
        Ok(())
    }
}

/// In-memory transport: the test shim standing in for the QUIC
/// stream. Channels are bounded; a full peer buffer drops the packet
/// rather than erroring.
pub struct MemoryTransport {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
}

/// Create a linked pair of in-memory transports.
pub fn memory_pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        MemoryTransport {
            tx: Mutex::new(Some(a_tx)),
            rx: Mutex::new(b_rx),
        },
        MemoryTransport {
            tx: Mutex::new(Some(b_tx)),
            rx: Mutex::new(a_rx),
        },
    )
}

#[async_trait]
impl PacketTransport for MemoryTransport {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        let packet = {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        };
        match packet {
            Some(p) => {
                if p.len() > buf.len() {
                    return Err(VpnError::Resource(format!(
                        "packet of {} bytes exceeds buffer of {}",
                        p.len(),
                        buf.len()
                    )));
                }
                buf[..p.len()].copy_from_slice(&p);
                Ok(p.len())
            }
            None => Err(VpnError::TransportClosed),
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<()> {
        let tx = self.tx.lock().await;
        match tx.as_ref() {
            // Peer buffer full: drop, as the lossy shim should.
            Some(sender) => {
                let _ = sender.try_send(Bytes::copy_from_slice(packet));
                Ok(())
            }
            None => Err(VpnError::TransportClosed),
        }
    }

    async fn close(&self) -> Result<()> {
        self.tx.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pair_roundtrip() {
        let (a, b) = memory_pair(8);
        a.write_packet(b"hello").await.unwrap();

        let mut buf = [0u8; 32];
        let n = b.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn close_propagates_as_eof() {
        let (a, b) = memory_pair(8);
        a.close().await.unwrap();

        let mut buf = [0u8; 32];
        let err = b.read_packet(&mut buf).await.unwrap_err();
        assert!(err.is_closed());

        let err = a.write_packet(b"x").await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn overrun_drops_instead_of_erroring() {
        let (a, b) = memory_pair(2);
        for i in 0..5u8 {
            a.write_packet(&[i]).await.unwrap();
        }

        let mut buf = [0u8; 4];
        assert_eq!(b.read_packet(&mut buf).await.unwrap(), 1);
        assert_eq!(buf[0], 0);
        assert_eq!(b.read_packet(&mut buf).await.unwrap(), 1);
        assert_eq!(buf[0], 1);
        // Packets 2..5 were dropped, not queued.
        a.close().await.unwrap();
        assert!(b.read_packet(&mut buf).await.unwrap_err().is_closed());
    }
}
