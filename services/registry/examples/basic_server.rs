//! Basic OCI registry server example
//!
//! Resolves images from link files under `./links` and pulls them through a
//! local gateway.
//!
//! Run with: cargo run -p linked-registry --example basic_server

use linked_registry::{FileResolver, RegistryBuilder};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let registry = RegistryBuilder::new()
        .gateway("http://127.0.0.1:8080/ipfs/".parse()?)
        .links("links")
        .resolver(FileResolver::new("links"))
        .build();

    let addr = "127.0.0.1:5000";
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("OCI Registry listening on http://{}", addr);
    tracing::info!("Try: curl http://{}/dig?q=library/app", addr);

    axum::serve(listener, registry.router()).await?;

    Ok(())
}
