//! # MASQUE CONNECT-IP VPN core
//!
//! Data plane for a mutually-authenticated VPN: IP packets move
//! between TUN interfaces and QUIC/HTTP-3 tunnels negotiated with the
//! CONNECT-IP upgrade form, optionally protected by an XOR
//! forward-error-correction layer.
//!
//! ```text
//!   Client host                          Server host
//!   ┌──────────┐            ┌────────┐            ┌──────────┐
//!   │ user app │──────────▶ │  TUN   │ ◀──────────│ internet │
//!   └──────────┘            └───┬────┘            └────┬─────┘
//!                               │                      │
//!                          packet pumps           demultiplexer
//!                               │                      │
//!                           FEC codec              FEC codec
//!                               │                      │
//!                          ┌────▼────┐  CONNECT-IP ┌───▼─────┐
//!                          │ MASQUE  │─────────────│ MASQUE  │
//!                          │ client  │ QUIC stream │ handler │
//!                          └─────────┘             └───┬─────┘
//!                                                      │
//!                                          ┌───────────▼──────────┐
//!                                          │ IP pool + sessions   │
//!                                          └──────────────────────┘
//! ```
//!
//! The server owns an [`ip_pool::IpPool`], a
//! [`server::SessionTable`], and the CONNECT-IP handler; the client
//! owns a [`client::SessionEstablisher`]. Both sides run one
//! [`pump`] pair per session.

/// Pooled packet buffers with a reserved header region
pub mod buffer_pool;
/// Session establishment and the client-side session loop
pub mod client;
/// TOML-backed configuration structures
pub mod config;
/// Typed error taxonomy
pub mod error;
/// XOR block forward error correction
pub mod fec;
/// IP address arithmetic
pub mod ip;
/// Per-connection IP address pool
pub mod ip_pool;
/// CONNECT-IP negotiation and tunnel framing
pub mod masque;
/// The directional packet pumps
pub mod pump;
/// Server: handler, session table, demultiplexer, metrics
pub mod server;
/// TUN device abstraction and platform shims
pub mod tun;
/// Address assignment control message
pub mod vpn_config;

pub use error::{Result, VpnError};
