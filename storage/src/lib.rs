//! # Storage backends
//!
//! The client side of the content-addressed storage a registry is published
//! into. Content lives under opaque identifiers; directories can be listed,
//! and identifier paths (`<id>/child/...`) address content beneath them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

mod api;
mod error;
mod memory;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[doc(inline)]
pub use api::HttpBackend;
#[doc(inline)]
pub use error::{StorageError, StorageErrorKind};
#[doc(inline)]
pub use memory::MemoryBackend;

/// What kind of node a directory entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A plain file.
    File,

    /// A directory which can itself be listed.
    Directory,

    /// Anything else the backend reports (symlinks, raw nodes).
    Other,
}

/// One child of a listed directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entry {
    /// Name of the entry within its parent.
    pub name: String,

    /// Size in bytes, as reported by the backend.
    pub size: u64,

    /// Node kind.
    pub kind: EntryKind,

    /// Backend identifier of the entry itself.
    pub id: String,
}

/// A storage backend, which can enumerate content by identifier.
#[async_trait::async_trait]
pub trait Backend: fmt::Debug {
    /// The name of the backend.
    fn name(&self) -> &'static str;

    /// List the children of a directory identifier (or identifier path).
    ///
    /// Listing a file yields no entries.
    async fn list(&self, identifier: &str) -> Result<Vec<Entry>, StorageError>;
}

pub(crate) type ArcBackend = Arc<dyn Backend + Send + Sync>;

/// A cloneable handle to a configured backend.
#[derive(Debug, Clone)]
pub struct Storage {
    backend: ArcBackend,
}

impl<D> From<D> for Storage
where
    D: Backend + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a backend.
    pub fn new<D: Backend + Send + Sync + 'static>(backend: D) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Name of the wrapped backend.
    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// List the children of an identifier.
    #[tracing::instrument(skip(self), fields(backend=self.backend.name()))]
    pub async fn list(&self, identifier: &str) -> Result<Vec<Entry>, StorageError> {
        let entries = self.backend.list(identifier).await?;
        tracing::trace!("Found {} entries", entries.len());
        Ok(entries)
    }
}

/// Backend selection, as found in configuration files.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum StorageConfig {
    /// An empty in-memory backend.
    Memory,

    /// A node HTTP API, e.g. `http://127.0.0.1:5001/`.
    Http {
        /// Base URI of the API.
        api: String,

        /// Per-call deadline in seconds.
        #[serde(default)]
        timeout: Option<u64>,
    },
}

impl StorageConfig {
    /// Construct the configured backend.
    #[tracing::instrument]
    pub fn build(self) -> Result<Storage, StorageError> {
        let storage: Storage = match self {
            StorageConfig::Memory => MemoryBackend::new().into(),
            StorageConfig::Http { api, timeout } => {
                let api = api
                    .parse()
                    .map_err(StorageError::with("http", StorageErrorKind::InvalidRequest))?;
                let mut backend = HttpBackend::new(api);
                if let Some(seconds) = timeout {
                    backend = backend.timeout(Duration::from_secs(seconds));
                }
                backend.into()
            }
        };
        Ok(storage)
    }
}
