//! # Linked OCI Registry
//!
//! This crate implements the server side of the
//! [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec),
//! backed by a content-addressed store instead of local disk.
//!
//! Images published to the backend are found through a chain of
//! [resolvers](resolver::Resolver), which turn a `(repository, reference)`
//! pair into a backend identifier. Identifiers are memoized in a
//! [`LinkCache`] and content is pulled through an HTTP gateway.
//! Pushed blobs and manifests are held in memory.
//!
//! ## Example
//!
//! ```no_run
//! use linked_registry::{FileResolver, RegistryBuilder};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = RegistryBuilder::new()
//!     .gateway("http://127.0.0.1:8080/ipfs/".parse()?)
//!     .links("/var/lib/registry/links")
//!     .resolver(FileResolver::new("/var/lib/registry/links"))
//!     .build();
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await?;
//! axum::serve(listener, registry.router()).await?;
//! # Ok(())
//! # }
//! ```

mod api;
mod blob;
pub mod config;
pub mod digest;
mod dispatch;
mod error;
pub mod fetch;
mod links;
mod manifest;
pub mod resolver;

use axum::http::HeaderName;

pub use api::{Registry, RegistryBuilder};
pub use blob::BlobStore;
pub use config::RegistryConfig;
pub use error::{RegistryError, RegistryResult};
pub use fetch::Gateway;
pub use links::{LinkCache, LinkError};
pub use manifest::{Manifest, ManifestStore};
pub use resolver::{FileResolver, ResolveError, Resolver, ResolverChain, StorageResolver};

pub(crate) const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
pub(crate) const DOCKER_CONTENT_ID: HeaderName = HeaderName::from_static("x-docker-content-id");
pub(crate) const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");
pub(crate) const DOCKER_API_VERSION: HeaderName =
    HeaderName::from_static("docker-distribution-api-version");
