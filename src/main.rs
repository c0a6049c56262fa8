use anyhow::Context;
use clap::Parser;
use minecraft_relay::{server, ProxyBuilder, ProxyConfig};
use std::{net::SocketAddr, path::PathBuf};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Minecraft reverse proxy.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Path to the TOML configuration.
    #[arg(long, default_value = "relay.toml")]
    config: PathBuf,
    /// Overrides the configured listen address.
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut config = ProxyConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if config.try_servers.is_empty() {
        tracing::warn!("No servers in the try list; players will be disconnected after login");
    }

    let bind = config.bind;
    let ctx = ProxyBuilder::new(config).build()?;
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!("Started");

    server::run(ctx, listener).await
}
