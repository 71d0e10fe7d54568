//! MASQUE CONNECT-IP session layer.
//!
//! [`connect`] carries the upgrade-form CONNECT-IP negotiation over a
//! fresh QUIC bidirectional stream; [`transport`] frames IP packets on
//! that stream once negotiation succeeds.

pub mod connect;
pub mod transport;

pub use connect::{ConnectRequest, ConnectResponse};
pub use transport::{memory_pair, MemoryTransport, PacketTransport, QuicTransport};

use std::time::Duration;

/// QUIC dial + TLS handshake deadline.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
/// CONNECT-IP negotiation deadline (request, response, config push).
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for completing a tunnel frame once its header arrived.
/// Waiting for a frame to start has no deadline; the QUIC keepalive
/// and idle timeout police peer liveness.
pub const TUNNEL_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-write deadline on the tunnel stream; the backpressure bound.
pub const TUNNEL_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// QUIC connection idle timeout.
pub const QUIC_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// QUIC keep-alive interval.
pub const QUIC_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Largest IP packet the pumps move (TUN read bound).
pub const MAX_PACKET_SIZE: usize = 2048;

/// Largest tunnel frame: an IP packet plus the FEC sequence header,
/// with headroom for a full redundancy length table
/// (4 + 1 + 2 * 255 bytes on top of the XOR payload).
pub const MAX_FRAME_SIZE: usize = 4096;
