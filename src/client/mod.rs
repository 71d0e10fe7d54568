//! VPN client: session establishment and the client-side session loop.

mod tls;

pub use tls::{build_client_config, InsecureVerifier};

use crate::config::ClientConfig;
use crate::error::{Result, VpnError};
use crate::masque::connect::{read_head, ConnectRequest, ConnectResponse};
use crate::masque::transport::{PacketTransport, QuicTransport};
use crate::masque::{HANDSHAKE_TIMEOUT, NEGOTIATION_TIMEOUT};
use crate::pump::{
    pump_tun_to_tunnel, pump_tunnel_to_tun, tun_reader_task, FecReceiver, FecSender, PumpExit,
    SESSION_CHANNEL_CAPACITY,
};
use crate::server::SHUTDOWN_TIMEOUT;
use crate::tun::TunDevice;
use crate::vpn_config::VpnConfig;
use ipnetwork::IpNetwork;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// A negotiated CONNECT-IP session, ready for pumps.
#[derive(Debug)]
pub struct EstablishedSession {
    /// Keeps the UDP socket driver alive for the connection's lifetime.
    pub endpoint: quinn::Endpoint,
    pub connection: quinn::Connection,
    pub transport: Arc<QuicTransport>,
    pub assigned: IpNetwork,
    pub assigned_v6: Option<IpNetwork>,
    pub gateway: IpAddr,
    pub routes: Vec<IpNetwork>,
    pub mtu: u16,
}

/// Dials the server and negotiates CONNECT-IP.
pub struct SessionEstablisher {
    config: ClientConfig,
}

impl SessionEstablisher {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Dial, negotiate, and read the address assignment.
    pub async fn establish(&self) -> Result<EstablishedSession> {
        let server_addr = resolve(&self.config.server_addr).await?;

        let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().expect("valid bind"))
            .map_err(|e| VpnError::Connection(format!("opening UDP socket: {e}")))?;
        endpoint.set_default_client_config(build_client_config(&self.config)?);

        let connecting = endpoint
            .connect(server_addr, &self.config.server_name)
            .map_err(|e| VpnError::Connection(format!("starting QUIC dial: {e}")))?;
        let connection = match timeout(HANDSHAKE_TIMEOUT, connecting).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(VpnError::Connection(format!(
                    "QUIC handshake with {server_addr} timed out"
                )))
            }
        };
        info!(server = %server_addr, "QUIC connection established");

        let (mut send, mut recv) = connection.open_bi().await?;
        let negotiation = async {
            let request = ConnectRequest::connect_ip(&self.config.server_name);
            send.write_all(request.encode().as_bytes()).await?;

            let head = read_head(&mut recv).await?;
            let response = ConnectResponse::parse(&head)?;
            if response.status != 200 {
                return Err(VpnError::Protocol(format!(
                    "CONNECT-IP rejected with status {}",
                    response.status
                )));
            }

            VpnConfig::recv(&mut recv).await
        };
        let assignment = match timeout(NEGOTIATION_TIMEOUT, negotiation).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(VpnError::Connection(
                    "CONNECT-IP negotiation timed out".into(),
                ))
            }
        };

        let assigned = assignment.assigned_prefix()?;
        let assigned_v6 = match &assignment.assigned_v6 {
            Some(prefix) => Some(prefix.parse().map_err(|e| {
                VpnError::Protocol(format!("assigned v6 prefix {prefix}: {e}"))
            })?),
            None => None,
        };
        let routes = assignment.parsed_routes()?;
        info!(assigned = %assigned, routes = routes.len(), "CONNECT-IP session negotiated");

        Ok(EstablishedSession {
            endpoint,
            connection,
            transport: Arc::new(QuicTransport::new(send, recv)),
            assigned,
            assigned_v6,
            gateway: assignment.gateway,
            routes,
            mtu: assignment.mtu,
        })
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| VpnError::Connection(format!("resolving {addr}: {e}")))?
        .next()
        .ok_or_else(|| VpnError::Connection(format!("{addr} resolved to no addresses")))
}

/// Run the client's pump pair over an established session until the
/// tunnel ends, a pump errors, or `shutdown` fires.
///
/// Returns `Ok` on graceful closure; a returned error is the first
/// pump error, after siblings have been drained.
pub async fn run_session(
    session: &EstablishedSession,
    tun: Arc<dyn TunDevice>,
    fec: crate::fec::FecConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let transport: Arc<dyn PacketTransport> = session.transport.clone();
    let (exit_tx, mut exit_rx) = mpsc::channel::<PumpExit>(4);
    let (packets_tx, packets_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
    // Session-scoped cancellation, so the caller's channel stays a
    // pure shutdown signal.
    let (cancel_tx, _) = broadcast::channel(1);

    let fec_sender = if fec.enabled {
        Some(Arc::new(Mutex::new(FecSender::new(fec)?)))
    } else {
        None
    };
    let fec_receiver = if fec.enabled {
        Some(FecReceiver::new(fec)?)
    } else {
        None
    };

    let mut tasks = JoinSet::new();
    tasks.spawn(tun_reader_task(
        tun.clone(),
        packets_tx,
        exit_tx.clone(),
        cancel_tx.subscribe(),
    ));
    tasks.spawn(pump_tun_to_tunnel(
        packets_rx,
        transport.clone(),
        fec_sender,
        tun.batch_size(),
        exit_tx.clone(),
        cancel_tx.subscribe(),
    ));
    tasks.spawn(pump_tunnel_to_tun(
        transport.clone(),
        tun,
        fec_receiver,
        exit_tx.clone(),
        cancel_tx.subscribe(),
    ));
    drop(exit_tx);

    let mut first_error = None;
    tokio::select! {
        exit = exit_rx.recv() => {
            if let Some(exit) = exit {
                match exit.error {
                    Some(e) => {
                        warn!(direction = exit.direction, %e, "pump failed");
                        first_error = Some(e);
                    }
                    None => debug!(direction = exit.direction, "pump finished"),
                }
            }
        }
        _ = session.connection.closed() => {
            debug!("QUIC connection closed");
        }
        _ = shutdown.recv() => {
            debug!("shutdown requested");
        }
    }

    let _ = cancel_tx.send(());
    let _ = transport.close().await;
    session
        .connection
        .close(0u32.into(), b"client disconnecting");

    if timeout(SHUTDOWN_TIMEOUT, async {
        while tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("session tasks did not stop in time");
        tasks.abort_all();
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
