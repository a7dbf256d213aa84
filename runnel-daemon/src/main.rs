//! Runnel Daemon (`runneld`)
//!
//! Headless daemon running one shard-holder node: serves the stream and
//! node-to-node services, replicates writes to the configured peers and
//! answers sync subscriptions. Storage is in-memory; point the storage
//! seam at a durable engine for anything beyond development.

use anyhow::Context;
use clap::Parser;
use runnel_model::NodeAddress;
use runnel_node::{MemStorage, OpenAuth, StaticPlacement, StreamCache};
use runnel_rpc::{NetworkConfig, NodeRegistry, RpcServer, ServiceCore};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "runneld", version, about = "Runnel Stream Node Daemon")]
struct Args {
    /// Address to serve gRPC on
    #[arg(long, default_value = "127.0.0.1:7470")]
    listen: SocketAddr,

    /// This node's address (40 hex characters)
    #[arg(long)]
    address: String,

    /// Peer node as `<hex-address>=<url>`; repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Replicas per stream (including this node when placed here)
    #[arg(long, default_value_t = 3)]
    replication: usize,

    /// Events pooled before a miniblock is sealed
    #[arg(long, default_value_t = 16)]
    seal_size: usize,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    tracing::info!("runneld v{} starting...", env!("CARGO_PKG_VERSION"));

    let local_address = NodeAddress::from_hex(&args.address)
        .map_err(|e| anyhow::anyhow!("bad --address: {e}"))?;
    let peers = parse_peers(&args.peers)?;

    let config = NetworkConfig {
        minipool_seal_size: args.seal_size,
        ..NetworkConfig::default()
    };

    let mut all_nodes: Vec<NodeAddress> = peers.iter().map(|(addr, _)| *addr).collect();
    all_nodes.push(local_address);

    let storage = Arc::new(MemStorage::new());
    let placement = Arc::new(StaticPlacement::new(all_nodes, args.replication));
    let registry = Arc::new(NodeRegistry::new(local_address, config.clone(), peers));
    let cache = Arc::new(StreamCache::new(
        local_address,
        storage,
        placement.clone(),
    ));
    let core = ServiceCore::new(
        cache,
        registry,
        placement,
        Arc::new(OpenAuth),
        config,
    );

    let server = RpcServer::bind(core, args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;

    tracing::info!("Node: {}", &hex::encode(local_address.as_bytes())[..8]);
    tracing::info!("Daemon ready. Press Ctrl+C to stop.");

    server.serve_with_shutdown(shutdown_signal()).await?;

    tracing::info!("Daemon stopped");
    Ok(())
}

fn parse_peers(entries: &[String]) -> anyhow::Result<Vec<(NodeAddress, String)>> {
    entries
        .iter()
        .map(|entry| {
            let (addr, url) = entry
                .split_once('=')
                .with_context(|| format!("peer must be <hex-address>=<url>: {entry}"))?;
            let addr = NodeAddress::from_hex(addr)
                .map_err(|e| anyhow::anyhow!("bad peer address in {entry}: {e}"))?;
            Ok((addr, url.to_string()))
        })
        .collect()
}

fn init_tracing(verbosity: u8) {
    let mut filter = EnvFilter::from_default_env();

    // Only apply defaults if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        filter = filter.add_directive(level.parse().unwrap());
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
    }
}
