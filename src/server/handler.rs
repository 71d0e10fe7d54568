//! Per-connection MASQUE CONNECT-IP handling.
//!
//! One task per accepted QUIC connection: authenticate the client
//! certificate, negotiate CONNECT-IP on the first bidirectional
//! stream, allocate an address, run the session pumps, and tear
//! everything down exactly once on the first error or cancellation.

use crate::error::{Result, VpnError};
use crate::fec::FecConfig;
use crate::ip_pool::IpPool;
use crate::masque::connect::{read_head, ConnectRequest, ConnectResponse, CONNECT_PATH};
use crate::masque::transport::{PacketTransport, QuicTransport};
use crate::masque::{MAX_FRAME_SIZE, NEGOTIATION_TIMEOUT};
use crate::pump::{
    pump_tun_to_tunnel, pump_tunnel_to_tun, FecReceiver, FecSender, PumpExit,
    SESSION_CHANNEL_CAPACITY,
};
use crate::server::demux::SourceFilteredTun;
use crate::server::metrics::Metrics;
use crate::server::registry::ClientRegistry;
use crate::server::session::{teardown_session, Session, SessionTable};
use crate::server::tls::client_common_name;
use crate::server::SHUTDOWN_TIMEOUT;
use crate::tun::TunDevice;
use crate::vpn_config::VpnConfig;
use ipnetwork::IpNetwork;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Everything a connection handler needs, passed as one handle.
pub struct ServerContext {
    pub pool: Arc<IpPool>,
    pub pool_v6: Option<Arc<IpPool>>,
    pub table: Arc<SessionTable>,
    pub registry: Arc<dyn ClientRegistry>,
    /// Shared server TUN; `None` runs the server as a signalling
    /// harness without a data plane.
    pub tun: Option<Arc<dyn TunDevice>>,
    pub metrics: Arc<Metrics>,
    /// Routes advertised verbatim to every client.
    pub routes: Vec<IpNetwork>,
    pub fec: FecConfig,
    pub mtu: u16,
    /// Network string reported by the info endpoint.
    pub network: String,
    /// Root cancellation: signalled on process shutdown.
    pub shutdown: broadcast::Sender<()>,
}

/// Handle one accepted QUIC connection to completion.
pub async fn handle_connection(ctx: Arc<ServerContext>, connection: quinn::Connection) {
    let remote = connection.remote_address();
    ctx.metrics.record_connection();
    debug!(%remote, "connection accepted");

    match serve_connection(&ctx, &connection).await {
        Ok(()) => debug!(%remote, "connection finished"),
        Err(e) if e.is_closed() => debug!(%remote, "connection closed"),
        Err(e) => warn!(%remote, %e, "connection failed"),
    }

    ctx.metrics.record_disconnection();
}

async fn serve_connection(ctx: &Arc<ServerContext>, connection: &quinn::Connection) -> Result<()> {
    let client_id = client_common_name(connection);

    let (mut send, mut recv) = connection.accept_bi().await?;
    let head = match timeout(NEGOTIATION_TIMEOUT, read_head(&mut recv)).await {
        Ok(head) => head?,
        Err(_) => {
            return Err(VpnError::Protocol(
                "CONNECT-IP request did not arrive in time".into(),
            ))
        }
    };

    let request = match ConnectRequest::parse(&head) {
        Ok(request) => request,
        Err(e) => {
            ctx.metrics.requests_rejected.fetch_add(1, Ordering::Relaxed);
            reject(&mut send, connection, 400).await;
            return Err(e);
        }
    };

    if request.method == "GET" && request.path == "/" {
        return send_server_info(ctx, &mut send).await;
    }

    if request.method != "CONNECT" {
        ctx.metrics.requests_rejected.fetch_add(1, Ordering::Relaxed);
        reject(&mut send, connection, 405).await;
        return Err(VpnError::Protocol(format!(
            "unexpected method {}",
            request.method
        )));
    }
    if request.path != CONNECT_PATH || !request.is_masque() {
        ctx.metrics.requests_rejected.fetch_add(1, Ordering::Relaxed);
        reject(&mut send, connection, 400).await;
        return Err(VpnError::Protocol("not a MASQUE CONNECT-IP request".into()));
    }

    let client_id = match client_id {
        Some(id) => id,
        None => {
            ctx.metrics.requests_rejected.fetch_add(1, Ordering::Relaxed);
            reject(&mut send, connection, 401).await;
            return Err(VpnError::Protocol("client certificate required".into()));
        }
    };
    if !ctx.registry.contains(&client_id) {
        ctx.metrics.requests_rejected.fetch_add(1, Ordering::Relaxed);
        reject(&mut send, connection, 401).await;
        return Err(VpnError::Protocol(format!(
            "client {client_id} not in registry"
        )));
    }

    // A reconnect replaces the old session; tear it down first so its
    // address is back in the pool (and, being lowest-free, comes right
    // back to this client).
    if let Some(existing) = ctx.table.lookup_client(&client_id) {
        info!(client = %client_id, "replacing existing session");
        teardown_session(&ctx.table, &ctx.pool, ctx.pool_v6.as_deref(), &existing);
    }

    let fec = if ctx.fec.enabled {
        Some(Arc::new(Mutex::new(FecSender::new(ctx.fec)?)))
    } else {
        None
    };

    let assigned = match ctx.pool.allocate(&client_id) {
        Ok(prefix) => prefix,
        Err(VpnError::Exhausted) => {
            error!(client = %client_id, "no available IP");
            ctx.metrics.pool_exhausted.fetch_add(1, Ordering::Relaxed);
            reject(&mut send, connection, 500).await;
            return Err(VpnError::Exhausted);
        }
        Err(e) => return Err(e),
    };
    let assigned_v6 = ctx
        .pool_v6
        .as_ref()
        .and_then(|pool| pool.allocate(&client_id).ok());

    let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
    let session = Session::new(client_id.clone(), assigned, assigned_v6, tx, fec);
    ctx.table.insert(session.clone());
    info!(client = %client_id, addr = %assigned, "session established");

    // From here on the session owns pool slots; always tear down.
    let result = run_session(ctx, connection, &session, rx, send, recv).await;
    teardown_session(&ctx.table, &ctx.pool, ctx.pool_v6.as_deref(), &session);
    result
}

async fn run_session(
    ctx: &Arc<ServerContext>,
    connection: &quinn::Connection,
    session: &Arc<Session>,
    packets: mpsc::Receiver<bytes::Bytes>,
    mut send: quinn::SendStream,
    recv: quinn::RecvStream,
) -> Result<()> {
    // Accept, then push the assignment over the control channel.
    send.write_all(ConnectResponse::ok_masque().encode().as_bytes())
        .await?;

    let mut assignment = VpnConfig::new(session.assigned, ctx.pool.gateway(), ctx.mtu);
    if let Some(v6) = session.assigned_v6 {
        assignment = assignment.with_assigned_v6(v6);
    }
    for route in &ctx.routes {
        assignment = assignment.with_route(route.to_string());
    }
    assignment.send(&mut send).await?;

    let transport: Arc<dyn PacketTransport> = Arc::new(QuicTransport::new(send, recv));
    let (exit_tx, mut exit_rx) = mpsc::channel::<PumpExit>(4);
    let mut tasks = JoinSet::new();

    tasks.spawn(pump_tun_to_tunnel(
        packets,
        transport.clone(),
        session.fec.clone(),
        ctx.tun
            .as_ref()
            .map(|t| t.batch_size())
            .unwrap_or(crate::tun::DEFAULT_BATCH_SIZE),
        exit_tx.clone(),
        session.subscribe_shutdown(),
    ));

    match &ctx.tun {
        Some(tun) => {
            let filtered: Arc<dyn TunDevice> = Arc::new(SourceFilteredTun::new(
                tun.clone(),
                session.assigned,
                session.assigned_v6,
                ctx.metrics.clone(),
            ));
            let fec_receiver = if ctx.fec.enabled {
                Some(FecReceiver::new(ctx.fec)?)
            } else {
                None
            };
            tasks.spawn(pump_tunnel_to_tun(
                transport.clone(),
                filtered,
                fec_receiver,
                exit_tx.clone(),
                session.subscribe_shutdown(),
            ));
        }
        None => {
            // Signalling harness mode: keep the stream drained so
            // closure is still observed.
            tasks.spawn(discard_tunnel(
                transport.clone(),
                exit_tx.clone(),
                session.subscribe_shutdown(),
            ));
        }
    }
    drop(exit_tx);

    let mut root_shutdown = ctx.shutdown.subscribe();
    let mut first_error = None;
    tokio::select! {
        exit = exit_rx.recv() => {
            if let Some(exit) = exit {
                match exit.error {
                    Some(e) => {
                        warn!(client = %session.client_id, direction = exit.direction, %e, "pump failed");
                        first_error = Some(e);
                    }
                    None => debug!(client = %session.client_id, direction = exit.direction, "pump finished"),
                }
            }
        }
        _ = connection.closed() => {
            debug!(client = %session.client_id, "QUIC connection closed by peer");
        }
        _ = root_shutdown.recv() => {
            debug!(client = %session.client_id, "server shutting down");
        }
    }

    session.cancel();
    let _ = transport.close().await;
    connection.close(0u32.into(), b"session closed");

    // Bounded drain: every task must observe the cancellation.
    if timeout(SHUTDOWN_TIMEOUT, async {
        while tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!(client = %session.client_id, "session tasks did not stop in time");
        tasks.abort_all();
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn discard_tunnel(
    transport: Arc<dyn PacketTransport>,
    exits: mpsc::Sender<PumpExit>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_FRAME_SIZE];
    let error = loop {
        let read = tokio::select! {
            r = transport.read_packet(&mut buf) => r,
            _ = shutdown.recv() => break None,
        };
        match read {
            Ok(_) => continue,
            Err(e) if e.is_closed() => break None,
            Err(e) => break Some(e),
        }
    };
    let _ = exits
        .send(PumpExit {
            direction: "tunnel->void",
            error,
        })
        .await;
}

/// Write a rejection status and hold the connection open briefly so
/// the response is delivered before the handler drops the connection.
async fn reject(send: &mut quinn::SendStream, connection: &quinn::Connection, status: u16) {
    let response = ConnectResponse::error(status);
    let _ = send.write_all(response.encode().as_bytes()).await;
    let _ = send.finish();
    let _ = timeout(std::time::Duration::from_secs(1), connection.closed()).await;
    connection.close(0u32.into(), b"request rejected");
}

async fn send_server_info(ctx: &Arc<ServerContext>, send: &mut quinn::SendStream) -> Result<()> {
    let body = serde_json::json!({
        "service": "masque-vpn-server",
        "protocol": "MASQUE CONNECT-IP",
        "network": ctx.network,
        "active_sessions": ctx.table.len(),
    })
    .to_string();
    let head = ConnectResponse::ok_json().encode();
    send.write_all(head.as_bytes()).await?;
    send.write_all(body.as_bytes()).await?;
    let _ = send.finish();
    Ok(())
}
