//! MASQUE CONNECT-IP VPN client.
//!
//! Dials the server, negotiates a CONNECT-IP session, brings up the
//! local TUN with the assigned address and advertised routes, and runs
//! the packet pumps until interrupted. Connection failures reconnect
//! with backoff; configuration and system failures are fatal.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use masque_vpn::client::{run_session, SessionEstablisher};
use masque_vpn::config::ClientConfig;
use masque_vpn::tun::{create_tun, install_routes, remove_routes, TunConfig};
use masque_vpn::VpnError;

/// Reconnect backoff bounds.
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "vpn-client", version, about = "MASQUE CONNECT-IP VPN client")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "client.toml")]
    config: PathBuf,

    /// Override server_addr from the config
    #[arg(long)]
    server: Option<String>,

    /// Override log_level from the config
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let args = Args::parse();
    let mut config = ClientConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(server) = args.server {
        config.server_addr = server;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    init_tracing(&config.log_level);
    run(config).await
}

fn init_tracing(level: &str) {
    let level = Level::from_str(level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn run(config: ClientConfig) -> Result<()> {
    let establisher = SessionEstablisher::new(config.clone())?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let stopping = Arc::new(AtomicBool::new(false));
    {
        let shutdown_tx = shutdown_tx.clone();
        let stopping = stopping.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received, shutting down");
            stopping.store(true, Ordering::SeqCst);
            let _ = shutdown_tx.send(());
        });
    }

    let mut backoff = BACKOFF_START;
    while !stopping.load(Ordering::SeqCst) {
        match establisher.establish().await {
            Ok(session) => {
                backoff = BACKOFF_START;

                let tun = create_tun(TunConfig {
                    name: config.tun_name.clone(),
                    address: session.assigned,
                    destination: Some(session.gateway),
                    mtu: if session.mtu > 0 {
                        session.mtu
                    } else {
                        config.effective_mtu()
                    },
                })
                .await
                .context("creating TUN device")?;
                install_routes(tun.name(), &session.routes).context("installing routes")?;

                let result =
                    run_session(&session, tun.clone(), config.fec, shutdown_tx.subscribe()).await;

                remove_routes(tun.name(), &session.routes);
                tun.close();

                match result {
                    Ok(()) => info!("tunnel closed"),
                    Err(e) => warn!(%e, "session ended with error"),
                }
            }
            Err(e @ (VpnError::Config(_) | VpnError::System(_))) => {
                error!(%e, "fatal startup failure");
                return Err(e.into());
            }
            Err(e) => warn!(%e, "connection attempt failed"),
        }

        if stopping.load(Ordering::SeqCst) {
            break;
        }

        info!(delay = ?backoff, "reconnecting");
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::select! {
            _ = sleep(backoff) => {}
            _ = shutdown_rx.recv() => break,
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }

    info!("client stopped");
    Ok(())
}
