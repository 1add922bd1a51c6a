use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use murmur::config::{MurmurConfigBuilder, NetworkType};
use murmur::{EventDelegate, Murmur, Node, SharedValueDelegate};
use tokio::net::{lookup_host, TcpListener};
use tracing::{info, warn};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

mod http;

const DEFAULT_GOSSIP_PORT: u16 = 7946;
const NO_SEED: &str = "localhost";

#[derive(Parser, Debug)]
#[command(author, version, about = "Keeps one value in sync across a gossip cluster", long_about = None)]
struct Args {
    /// Unique node name, the host name when unset
    #[arg(long, env = "MURMUR_NAME")]
    name: Option<String>,

    /// Address gossip traffic (UDP and TCP) is bound to
    #[arg(long, env = "MURMUR_BIND", default_value = "0.0.0.0:7946")]
    bind: SocketAddr,

    /// Member to join, `localhost` starts a new cluster
    #[arg(long = "join", env = "NODE", default_value = NO_SEED)]
    seed: String,

    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:3333")]
    http_addr: SocketAddr,

    /// Higher means faster convergence and more traffic
    #[arg(long, env = "RETRANSMIT_MULT", default_value_t = 5)]
    retransmit_mult: u32,

    /// Seconds between member listings, 0 disables them
    #[arg(long, env = "MEMBER_LOG_INTERVAL", default_value_t = 60)]
    member_log_interval: u64,
}

type DispatchError = Box<dyn Error + Send + Sync>;

struct ClusterEvents;

#[async_trait]
impl EventDelegate for ClusterEvents {
    async fn notify_join(&self, node: &Node) -> Result<(), DispatchError> {
        info!("Node {} has joined the cluster", node.name);
        Ok(())
    }

    async fn notify_leave(&self, node: &Node) -> Result<(), DispatchError> {
        info!("Node {} is leaving the cluster", node.name);
        Ok(())
    }

    async fn notify_dead(&self, node: &Node) -> Result<(), DispatchError> {
        info!("Node {} detected as dead", node.name);
        Ok(())
    }
}

fn setup_tracing() {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_ansi(true)
        .with_level(true);

    let filter_layer = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

/// Resolves the seed, a bare host getting the default gossip port.
async fn resolve_seed(seed: &str) -> Result<Vec<SocketAddr>> {
    if seed.is_empty() || seed == NO_SEED {
        return Ok(Vec::new());
    }
    let addrs: Vec<SocketAddr> = if seed.contains(':') {
        lookup_host(seed).await?.collect()
    } else {
        lookup_host((seed, DEFAULT_GOSSIP_PORT)).await?.collect()
    };
    Ok(addrs)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("unable to listen for the shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Signal received, stopping murmur...");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_tracing();

    let mut builder = MurmurConfigBuilder::new()
        .with_addr(args.bind.ip())
        .with_port(args.bind.port())
        .with_retransmit_mult(args.retransmit_mult)
        .with_network_type(NetworkType::LAN)
        .with_member_log_interval((args.member_log_interval > 0).then(|| Duration::from_secs(args.member_log_interval)));
    if let Some(name) = &args.name {
        builder = builder.with_name(name);
    }
    let config = builder.build()?;

    let store = Arc::new(SharedValueDelegate::new(config.name(), config.retransmit_mult()));
    let murmur = Murmur::create(config, store.clone(), Arc::new(ClusterEvents))
        .await
        .context("failed to create murmur node")?;
    store.bind_member_count(murmur.member_counter());
    murmur.start().await?;

    let seeds = resolve_seed(&args.seed)
        .await
        .with_context(|| format!("unable to resolve seed {}", args.seed))?;
    if !seeds.is_empty() {
        info!("joining node {}", args.seed);
        let found = murmur.join(&seeds).await?;
        info!("found {} nodes", found);
    }

    let listener = TcpListener::bind(args.http_addr)
        .await
        .with_context(|| format!("unable to bind HTTP server on {}", args.http_addr))?;
    info!("HTTP server listening on {}", args.http_addr);

    let app = http::router(http::AppState { murmur: murmur.clone(), store });
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    murmur.shutdown().await?;
    info!("Node stopped. Goodbye!");
    Ok(())
}
