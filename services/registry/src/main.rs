//! Serve a link-resolving OCI registry.

use std::net::SocketAddr;

use camino::Utf8PathBuf;
use clap::Parser;
use linked_registry::RegistryConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "registry-server", about = "OCI registry backed by content-addressed storage")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<Utf8PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RegistryConfig::load(path).await?,
        None => RegistryConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let registry = config.builder()?.build();
    registry.spawn_upload_sweeper(config.sweep_interval(), config.upload_ttl());

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    tracing::info!(
        listen = %config.listen,
        gateway = %registry.gateway().base(),
        resolvers = registry.resolver().len(),
        "registry listening"
    );
    axum::serve(listener, registry.router()).await?;

    Ok(())
}
