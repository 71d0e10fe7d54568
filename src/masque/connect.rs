//! CONNECT-IP negotiation codec.
//!
//! The upgrade form of MASQUE CONNECT-IP: the client opens a
//! bidirectional stream and writes an HTTP/1.1-style CONNECT head for
//! the `/vpn` path with the capsule-protocol headers; the server
//! answers with a status line. Only after a 200 does the stream switch
//! to packet framing.

use crate::error::{Result, VpnError};
use std::collections::HashMap;
use std::fmt::Write as _;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Request path for CONNECT-IP sessions.
pub const CONNECT_PATH: &str = "/vpn";

/// Capsule protocol indicator required on CONNECT-IP requests.
pub const CAPSULE_PROTOCOL: &str = "?masque";

/// Content type of an accepted CONNECT-IP response.
pub const MASQUE_CONTENT_TYPE: &str = "application/masque";

/// Upper bound on a request or response head.
const MAX_HEAD_SIZE: usize = 4096;

/// Parsed CONNECT-IP request head. Header names are lowercased.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub method: String,
    pub path: String,
    headers: HashMap<String, String>,
}

impl ConnectRequest {
    /// Build the client-side CONNECT-IP request.
    pub fn connect_ip(host: &str) -> Self {
        let mut headers = HashMap::new();
        headers.insert("host".into(), host.to_string());
        headers.insert("capsule-protocol".into(), CAPSULE_PROTOCOL.into());
        headers.insert("upgrade".into(), "masque".into());
        headers.insert("connection".into(), "Upgrade".into());
        Self {
            method: "CONNECT".into(),
            path: CONNECT_PATH.into(),
            headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    /// Whether the request carries the MASQUE markers: the capsule
    /// protocol header, or `Upgrade: masque`.
    pub fn is_masque(&self) -> bool {
        self.header("capsule-protocol") == Some(CAPSULE_PROTOCOL)
            || self
                .header("upgrade")
                .is_some_and(|v| v.to_ascii_lowercase().contains("masque"))
    }

    pub fn encode(&self) -> String {
        let mut head = format!("{} {} HTTP/1.1\r\n", self.method, self.path);
        // Deterministic order keeps the wire form stable.
        let mut names: Vec<&String> = self.headers.keys().collect();
        names.sort();
        for name in names {
            let _ = write!(head, "{}: {}\r\n", canonical(name), self.headers[name]);
        }
        head.push_str("\r\n");
        head
    }

    pub fn parse(head: &str) -> Result<Self> {
        let mut lines = head.split("\r\n");
        let request_line = lines
            .next()
            .ok_or_else(|| VpnError::Protocol("empty request head".into()))?;
        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| VpnError::Protocol("missing request method".into()))?
            .to_string();
        let path = parts
            .next()
            .ok_or_else(|| VpnError::Protocol("missing request path".into()))?
            .to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| VpnError::Protocol(format!("malformed header line: {line}")))?;
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        Ok(Self {
            method,
            path,
            headers,
        })
    }
}

/// CONNECT-IP response head.
#[derive(Debug, Clone)]
pub struct ConnectResponse {
    pub status: u16,
    headers: HashMap<String, String>,
}

impl ConnectResponse {
    /// Accepted session: 200 with the MASQUE content type.
    pub fn ok_masque() -> Self {
        let mut headers = HashMap::new();
        headers.insert("content-type".into(), MASQUE_CONTENT_TYPE.into());
        headers.insert("capsule-protocol".into(), CAPSULE_PROTOCOL.into());
        Self {
            status: 200,
            headers,
        }
    }

    /// Rejection with the mapped status code.
    pub fn error(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
        }
    }

    /// 200 with a JSON body (`GET /` on the signalling stream).
    pub fn ok_json() -> Self {
        let mut headers = HashMap::new();
        headers.insert("content-type".into(), "application/json".into());
        Self {
            status: 200,
            headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    pub fn encode(&self) -> String {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason(self.status));
        let mut names: Vec<&String> = self.headers.keys().collect();
        names.sort();
        for name in names {
            let _ = write!(head, "{}: {}\r\n", canonical(name), self.headers[name]);
        }
        head.push_str("\r\n");
        head
    }

    /// Parse a response head. The status is the numeric code from the
    /// status line; reason phrases are ignored.
    pub fn parse(head: &str) -> Result<Self> {
        let mut lines = head.split("\r\n");
        let status_line = lines
            .next()
            .ok_or_else(|| VpnError::Protocol("empty response head".into()))?;
        let mut parts = status_line.split_whitespace();
        let version = parts
            .next()
            .ok_or_else(|| VpnError::Protocol("missing HTTP version".into()))?;
        if !version.starts_with("HTTP/") {
            return Err(VpnError::Protocol(format!(
                "not an HTTP response: {status_line}"
            )));
        }
        let status: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| VpnError::Protocol(format!("bad status line: {status_line}")))?;

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        Ok(Self { status, headers })
    }
}

/// Read a request/response head up to and including the blank line.
///
/// Reads byte-at-a-time; the head is tiny, exchanged once per session,
/// and must never consume bytes past the terminator.
pub async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut head = Vec::with_capacity(256);
    loop {
        let byte = reader.read_u8().await?;
        head.push(byte);
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_HEAD_SIZE {
            return Err(VpnError::Protocol(format!(
                "request head exceeds {MAX_HEAD_SIZE} bytes"
            )));
        }
    }
    String::from_utf8(head).map_err(|_| VpnError::Protocol("head is not valid UTF-8".into()))
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Restore conventional capitalization for wire output.
fn canonical(lower: &str) -> String {
    lower
        .split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = ConnectRequest::connect_ip("vpn.example.com");
        let encoded = req.encode();
        assert!(encoded.starts_with("CONNECT /vpn HTTP/1.1\r\n"));
        assert!(encoded.ends_with("\r\n\r\n"));

        let parsed = ConnectRequest::parse(&encoded).unwrap();
        assert_eq!(parsed.method, "CONNECT");
        assert_eq!(parsed.path, CONNECT_PATH);
        assert_eq!(parsed.header("capsule-protocol"), Some(CAPSULE_PROTOCOL));
        assert_eq!(parsed.header("upgrade"), Some("masque"));
        assert!(parsed.is_masque());
    }

    #[test]
    fn masque_detection() {
        let plain = ConnectRequest::parse("CONNECT /vpn HTTP/1.1\r\n\r\n").unwrap();
        assert!(!plain.is_masque());

        let upgraded =
            ConnectRequest::parse("CONNECT /vpn HTTP/1.1\r\nUpgrade: masque\r\n\r\n").unwrap();
        assert!(upgraded.is_masque());

        let capsule = ConnectRequest::parse(
            "CONNECT /vpn HTTP/1.1\r\nCapsule-Protocol: ?masque\r\n\r\n",
        )
        .unwrap();
        assert!(capsule.is_masque());
    }

    #[test]
    fn response_roundtrip() {
        let resp = ConnectResponse::ok_masque();
        let encoded = resp.encode();
        assert!(encoded.starts_with("HTTP/1.1 200 OK\r\n"));

        let parsed = ConnectResponse::parse(&encoded).unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.header("content-type"), Some(MASQUE_CONTENT_TYPE));
    }

    #[test]
    fn error_statuses() {
        for status in [400u16, 401, 500] {
            let parsed = ConnectResponse::parse(&ConnectResponse::error(status).encode()).unwrap();
            assert_eq!(parsed.status, status);
        }
    }

    #[test]
    fn status_is_code_not_reason() {
        // A reason phrase containing "OK" must not make a failure pass.
        let parsed = ConnectResponse::parse("HTTP/1.1 500 OK-ish\r\n\r\n").unwrap();
        assert_eq!(parsed.status, 500);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(ConnectResponse::parse("garbage\r\n\r\n").is_err());
        assert!(ConnectRequest::parse("\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn read_head_stops_at_terminator() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let payload = b"CONNECT /vpn HTTP/1.1\r\nUpgrade: masque\r\n\r\nEXTRA";
        tokio::io::AsyncWriteExt::write_all(&mut client, payload)
            .await
            .unwrap();

        let head = read_head(&mut server).await.unwrap();
        assert!(head.ends_with("\r\n\r\n"));
        assert!(!head.contains("EXTRA"));

        // The bytes after the head stay in the stream.
        let mut rest = [0u8; 5];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut rest)
            .await
            .unwrap();
        assert_eq!(&rest, b"EXTRA");
    }
}
