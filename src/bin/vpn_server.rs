//! MASQUE CONNECT-IP VPN server.
//!
//! Listens for mutually-authenticated QUIC connections, negotiates
//! CONNECT-IP sessions, assigns addresses from the configured pool,
//! and forwards packets between each session and the shared TUN.

use anyhow::{Context, Result};
use clap::Parser;
use ipnetwork::IpNetwork;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use masque_vpn::config::ServerConfig;
use masque_vpn::ip::{next_address, parse_prefix, NetworkAddr};
use masque_vpn::ip_pool::IpPool;
use masque_vpn::server::{
    accept_loop, build_server_config, demux_task, ClientRegistry, MemoryRegistry, Metrics,
    OpenRegistry, ServerContext, SessionTable,
};
use masque_vpn::tun::{create_tun, TunConfig, TunDevice};

#[derive(Parser, Debug)]
#[command(name = "vpn-server", version, about = "MASQUE CONNECT-IP VPN server")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "server.toml")]
    config: PathBuf,

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
    let mut config = ServerConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    let level = Level::from_str(&config.log_level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    run(config).await
}

async fn run(config: ServerConfig) -> Result<()> {
    let listen_addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("parsing listen_addr {}", config.listen_addr))?;

    // Address pools: gateway is the first host of each network.
    let network = parse_prefix(&config.assign_cidr)?;
    let gateway = next_address(network.network_addr());
    let pool = Arc::new(IpPool::new(network, gateway)?);

    let pool_v6 = if config.assign_cidr_v6.is_empty() {
        None
    } else {
        let network_v6 = parse_prefix(&config.assign_cidr_v6)?;
        let gateway_v6 = next_address(network_v6.network_addr());
        Some(Arc::new(IpPool::new(network_v6, gateway_v6)?))
    };

    let routes: Vec<IpNetwork> = config
        .advertise_routes
        .iter()
        .map(|r| parse_prefix(r))
        .collect::<masque_vpn::Result<_>>()
        .context("parsing advertise_routes")?;

    // TLS: server identity plus the client CA for mutual auth.
    if !config.key_log_file.is_empty() {
        std::env::set_var("SSLKEYLOGFILE", &config.key_log_file);
    }
    let server_config = build_server_config(
        config.load_cert_chain()?,
        config.load_private_key()?,
        config.load_client_ca()?,
        !config.key_log_file.is_empty(),
    )?;

    // Shared TUN; empty name runs without a data plane.
    let tun: Option<Arc<dyn TunDevice>> = if config.tun_name.is_empty() {
        warn!("tun_name is empty; running as signalling harness without a TUN");
        None
    } else {
        let gateway_prefix = IpNetwork::new(gateway, network.prefix())
            .context("building gateway prefix")?;
        Some(
            create_tun(TunConfig {
                name: config.tun_name.clone(),
                address: gateway_prefix,
                destination: None,
                mtu: config.effective_mtu(),
            })
            .await
            .context("creating server TUN device")?,
        )
    };

    let registry: Arc<dyn ClientRegistry> = if config.api_server.database_path.is_empty() {
        warn!("no client registry configured; admitting every authenticated certificate");
        Arc::new(OpenRegistry)
    } else {
        Arc::new(
            MemoryRegistry::from_file(std::path::Path::new(&config.api_server.database_path))
                .with_context(|| {
                    format!("loading registry {}", config.api_server.database_path)
                })?,
        )
    };

    let (shutdown_tx, _) = broadcast::channel(1);
    let metrics = Arc::new(Metrics::new());
    let table = Arc::new(SessionTable::new());
    let ctx = Arc::new(ServerContext {
        pool,
        pool_v6,
        table: table.clone(),
        registry,
        tun: tun.clone(),
        metrics: metrics.clone(),
        routes,
        fec: config.fec,
        mtu: config.effective_mtu(),
        network: config.assign_cidr.clone(),
        shutdown: shutdown_tx.clone(),
    });

    let endpoint = quinn::Endpoint::server(server_config, listen_addr)
        .with_context(|| format!("binding QUIC endpoint on {listen_addr}"))?;
    info!(
        listen = %listen_addr,
        network = %config.assign_cidr,
        gateway = %gateway,
        fec = config.fec.enabled,
        "VPN server started"
    );

    let demux = tun.clone().map(|tun| {
        tokio::spawn(demux_task(
            tun,
            table.clone(),
            metrics.clone(),
            shutdown_tx.subscribe(),
        ))
    });

    {
        let shutdown_tx = shutdown_tx.clone();
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(());
            endpoint.close(0u32.into(), b"server shutdown");
        });
    }

    accept_loop(endpoint.clone(), ctx).await;

    if let Some(demux) = demux {
        demux.abort();
    }
    if let Some(tun) = &tun {
        tun.close();
    }
    endpoint.wait_idle().await;

    let snapshot = metrics.snapshot();
    info!(
        connections = snapshot.connections_total,
        forwarded = snapshot.packets_forwarded,
        "server stopped"
    );
    Ok(())
}
