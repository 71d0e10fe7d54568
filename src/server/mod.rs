//! VPN server components.
//!
//! The binary wires these together: TLS/QUIC configuration, the accept
//! loop, the per-connection CONNECT-IP handler, the session table, the
//! TUN demultiplexer, and the metrics counters.

pub mod demux;
pub mod handler;
pub mod metrics;
pub mod registry;
pub mod session;
pub mod tls;

pub use demux::{demux_task, SourceFilteredTun};
pub use handler::{handle_connection, ServerContext};
pub use metrics::{Metrics, MetricsSnapshot};
pub use registry::{ClientRegistry, MemoryRegistry, OpenRegistry};
pub use session::{teardown_session, Session, SessionTable};
pub use tls::{build_server_config, client_common_name, transport_config};

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info};

/// Bound on shutdown: every task must return within this window.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept QUIC connections until the endpoint closes or the root
/// shutdown fires, then drain the per-connection tasks.
pub async fn accept_loop(endpoint: quinn::Endpoint, ctx: Arc<ServerContext>) {
    let mut shutdown = ctx.shutdown.subscribe();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => {
                    let ctx = ctx.clone();
                    connections.spawn(async move {
                        match incoming.await {
                            Ok(connection) => handle_connection(ctx, connection).await,
                            Err(e) => debug!(%e, "incoming connection failed during handshake"),
                        }
                    });
                }
                None => break,
            },
            _ = shutdown.recv() => break,
        }
    }

    info!("accept loop stopping, draining sessions");
    if timeout(SHUTDOWN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        connections.abort_all();
    }
}

/// Administrative disconnect: close a client's session and release its
/// address. Returns false when the client is not connected.
pub fn disconnect_client(ctx: &ServerContext, client_id: &str) -> bool {
    match ctx.table.lookup_client(client_id) {
        Some(session) => {
            info!(client = %client_id, "administrative disconnect");
            teardown_session(&ctx.table, &ctx.pool, ctx.pool_v6.as_deref(), &session)
        }
        None => false,
    }
}
