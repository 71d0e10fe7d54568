//! Error types for the VPN core.
//!
//! All core operations return [`Result<T>`] which wraps [`VpnError`].
//! The variants mirror the failure classes the components report:
//! connection setup, configuration, protocol negotiation, transport
//! teardown, resource exhaustion, and system-level faults.

use thiserror::Error;

/// Error type for all VPN core operations.
///
/// `TransportClosed` is special: the pumps treat it as a graceful end
/// of stream, not a fault. Use [`VpnError::is_closed`] when deciding
/// whether to report an error or exit quietly.
#[derive(Debug, Error)]
pub enum VpnError {
    /// Dial, handshake, or established-connection failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Invalid or missing configuration (bad CIDR, bad PEM, bad FEC shape)
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed or unexpected CONNECT-IP traffic
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Tunnel or TUN signalled EOF / reset; graceful from the pump's view
    #[error("transport closed")]
    TransportClosed,

    /// IP pool has no free addresses
    #[error("no available IP addresses")]
    Exhausted,

    /// Resource limits other than the pool (buffers, channels)
    #[error("resource error: {0}")]
    Resource(String),

    /// TUN creation, route installation, or other OS-level failure
    #[error("system error: {0}")]
    System(String),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for VPN core operations.
pub type Result<T> = std::result::Result<T, VpnError>;

impl VpnError {
    /// Whether this error means the peer or the OS closed the path
    /// under us. Pumps exit gracefully on closed paths and only report
    /// everything else.
    pub fn is_closed(&self) -> bool {
        match self {
            VpnError::TransportClosed => true,
            VpnError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

impl From<quinn::ConnectionError> for VpnError {
    fn from(e: quinn::ConnectionError) -> Self {
        match e {
            quinn::ConnectionError::ApplicationClosed(_)
            | quinn::ConnectionError::ConnectionClosed(_)
            | quinn::ConnectionError::LocallyClosed => VpnError::TransportClosed,
            quinn::ConnectionError::TimedOut => {
                VpnError::Connection("QUIC idle timeout".into())
            }
            other => VpnError::Connection(other.to_string()),
        }
    }
}

impl From<quinn::WriteError> for VpnError {
    fn from(e: quinn::WriteError) -> Self {
        match e {
            quinn::WriteError::Stopped(_) | quinn::WriteError::ClosedStream => {
                VpnError::TransportClosed
            }
            quinn::WriteError::ConnectionLost(ce) => ce.into(),
            other => VpnError::Connection(other.to_string()),
        }
    }
}

impl From<quinn::ReadError> for VpnError {
    fn from(e: quinn::ReadError) -> Self {
        match e {
            quinn::ReadError::Reset(_) | quinn::ReadError::ClosedStream => {
                VpnError::TransportClosed
            }
            quinn::ReadError::ConnectionLost(ce) => ce.into(),
            other => VpnError::Connection(other.to_string()),
        }
    }
}

impl From<quinn::ReadExactError> for VpnError {
    fn from(e: quinn::ReadExactError) -> Self {
        match e {
            quinn::ReadExactError::FinishedEarly(_) => VpnError::TransportClosed,
            quinn::ReadExactError::ReadError(re) => re.into(),
        }
    }
}

impl From<serde_json::Error> for VpnError {
    fn from(e: serde_json::Error) -> Self {
        VpnError::Protocol(format!("control message: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_classification() {
        assert!(VpnError::TransportClosed.is_closed());
        assert!(VpnError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof"
        ))
        .is_closed());
        assert!(!VpnError::Exhausted.is_closed());
        assert!(!VpnError::Protocol("bad request".into()).is_closed());
    }

    #[test]
    fn display_keeps_kind() {
        let e = VpnError::Config("invalid CIDR 10.0.0.0/33".into());
        assert!(e.to_string().contains("configuration"));
        assert!(e.to_string().contains("10.0.0.0/33"));
    }
}
