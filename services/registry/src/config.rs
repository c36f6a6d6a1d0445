//! Registry configuration, as read from a TOML file.
//!
//! ```toml
//! listen = "0.0.0.0:5000"
//! gateway = "http://127.0.0.1:8080/ipfs/"
//! links = "/var/lib/registry/links"
//!
//! [storage]
//! kind = "http"
//! api = "http://127.0.0.1:5001/"
//!
//! [[resolvers]]
//! kind = "file"
//! root = "/var/lib/registry/links"
//!
//! [[resolvers]]
//! kind = "storage"
//! root = "bafyregistryroot"
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use axum::http::Uri;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use storage::{StorageConfig, StorageError};

use crate::api::{DEFAULT_GATEWAY, RegistryBuilder};
use crate::resolver::{FileResolver, StorageResolver};

/// Errors loading or applying configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading {path}: {source}")]
    Io {
        /// Configuration file.
        path: Utf8PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid configuration.
    #[error("parsing configuration: {0}")]
    Parse(#[from] toml_edit::de::Error),

    /// The gateway is not a valid URI.
    #[error("invalid gateway {gateway:?}")]
    Gateway {
        /// Configured value.
        gateway: String,
    },

    /// The idle session sweep period is zero.
    #[error("sweep-interval must be at least one second")]
    SweepInterval,

    /// A storage resolver was configured without a storage backend.
    #[error("storage resolver configured without [storage]")]
    MissingStorage,

    /// The storage backend could not be created.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One entry of the resolver chain.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum ResolverConfig {
    /// Link files beneath `root`.
    File {
        /// Root directory.
        root: Utf8PathBuf,
    },

    /// Directory listings of the storage backend.
    Storage {
        /// Identifier path repositories are listed beneath.
        #[serde(default)]
        root: Option<String>,
    },
}

/// Registry configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RegistryConfig {
    /// Address to serve on.
    pub listen: SocketAddr,

    /// Storage gateway root.
    pub gateway: String,

    /// Side store for resolved links.
    pub links: Option<Utf8PathBuf>,

    /// Gateway deadline, in seconds.
    pub fetch_timeout: u64,

    /// Upload sessions idle for this many seconds are dropped.
    pub upload_ttl: u64,

    /// Seconds between idle session sweeps.
    pub sweep_interval: u64,

    /// Maximum request body, in bytes.
    pub body_limit: Option<usize>,

    /// Storage backend used by storage resolvers.
    pub storage: Option<StorageConfig>,

    /// Resolver chain, most specific first.
    pub resolvers: Vec<ResolverConfig>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 5000)),
            gateway: DEFAULT_GATEWAY.to_string(),
            links: None,
            fetch_timeout: 30,
            upload_ttl: 3600,
            sweep_interval: 60,
            body_limit: None,
            storage: None,
            resolvers: Vec::new(),
        }
    }
}

impl RegistryConfig {
    /// Parse configuration from TOML.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml_edit::de::from_str(contents)?)
    }

    /// Read configuration from a file.
    pub async fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_owned(),
                source,
            })?;
        Self::from_toml(&contents)
    }

    /// Idle time after which upload sessions are dropped.
    pub fn upload_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_ttl)
    }

    /// Period of the idle session sweep.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }

    /// A builder with everything this configuration describes.
    pub fn builder(&self) -> Result<RegistryBuilder, ConfigError> {
        let gateway: Uri = self.gateway.parse().map_err(|_| ConfigError::Gateway {
            gateway: self.gateway.clone(),
        })?;

        if self.sweep_interval == 0 {
            return Err(ConfigError::SweepInterval);
        }

        let storage = self.storage.clone().map(StorageConfig::build).transpose()?;

        let mut builder = RegistryBuilder::new()
            .gateway(gateway)
            .fetch_timeout(Duration::from_secs(self.fetch_timeout))
            .body_limit(self.body_limit);

        if let Some(links) = &self.links {
            builder = builder.links(links.clone());
        }

        for resolver in &self.resolvers {
            builder = match resolver {
                ResolverConfig::File { root } => builder.resolver(FileResolver::new(root.clone())),
                ResolverConfig::Storage { root } => {
                    let storage = storage.clone().ok_or(ConfigError::MissingStorage)?;
                    builder.resolver(StorageResolver::new(storage, root.clone()))
                }
            };
        }

        Ok(builder)
    }
}
