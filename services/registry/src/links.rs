//! Link cache: memoized `(repository, reference)` to backend identifier.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::RwLock;

use crate::digest::is_digest;
use crate::resolver::{ResolveError, ResolverChain, link_path};

/// Failure writing a link to the side store.
#[derive(Debug, thiserror::Error)]
#[error("persisting link {path}: {source}")]
pub struct LinkError {
    path: Utf8PathBuf,
    #[source]
    source: io::Error,
}

impl LinkError {
    /// The file which could not be written.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

type Key = (String, String);

/// Memoizes resolved identifiers.
///
/// Entries are kept in memory, and when a side store root is configured,
/// also written to `<root>/<repository>/@<reference>`, the layout
/// [`FileResolver`](crate::FileResolver) reads. Digest references and
/// repositories which are their own identifier are kept in memory only.
#[derive(Debug, Clone, Default)]
pub struct LinkCache {
    entries: Arc<RwLock<HashMap<Key, String>>>,
    root: Option<Utf8PathBuf>,
}

impl LinkCache {
    /// A cache with no side store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache persisting links beneath `root`.
    pub fn persistent(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            entries: Default::default(),
            root: Some(root.into()),
        }
    }

    /// Side store root, if any.
    pub fn root(&self) -> Option<&Utf8Path> {
        self.root.as_deref()
    }

    fn path(&self, repository: &str, reference: &str) -> Option<Utf8PathBuf> {
        self.root
            .as_deref()
            .map(|root| link_path(root, repository, reference))
    }

    /// Look up an identifier, falling back to the side store.
    ///
    /// A side store hit is copied into memory.
    pub async fn get(&self, repository: &str, reference: &str) -> Option<String> {
        let key = (repository.to_owned(), reference.to_owned());
        if let Some(identifier) = self.entries.read().get(&key) {
            return Some(identifier.clone());
        }

        let path = self.path(repository, reference)?;
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(error) => {
                if error.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(%path, %error, "unreadable link");
                }
                return None;
            }
        };

        let identifier = contents.lines().next()?.trim().to_owned();
        if identifier.is_empty() {
            return None;
        }
        tracing::debug!(%path, "link loaded from side store");
        self.entries.write().insert(key, identifier.clone());
        Some(identifier)
    }

    /// Record an identifier.
    ///
    /// The in-memory entry is always written, even if persisting fails.
    pub async fn add(
        &self,
        repository: &str,
        reference: &str,
        identifier: &str,
    ) -> Result<(), LinkError> {
        self.entries.write().insert(
            (repository.to_owned(), reference.to_owned()),
            identifier.to_owned(),
        );

        if is_digest(reference) || repository == identifier {
            return Ok(());
        }
        let Some(path) = self.path(repository, reference) else {
            return Ok(());
        };

        let persist = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, format!("{identifier}\n")).await
        };
        persist.await.map_err(|source| LinkError {
            path: path.clone(),
            source,
        })?;
        tracing::trace!(%path, "link persisted");
        Ok(())
    }

    /// Find the identifier for `reference`, asking `resolver` on a miss and
    /// remembering the first answer.
    #[tracing::instrument(skip(self, resolver))]
    pub async fn locate(
        &self,
        resolver: &ResolverChain,
        repository: &str,
        reference: &str,
    ) -> Result<String, ResolveError> {
        if let Some(identifier) = self.get(repository, reference).await {
            tracing::debug!(%identifier, "link cache hit");
            return Ok(identifier);
        }

        let identifier = resolver
            .resolve(repository, reference)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ResolveError::Unresolvable {
                target: format!("{repository}:{reference}"),
            })?;

        tracing::debug!(%identifier, "link cache miss resolved");
        if let Err(error) = self.add(repository, reference, &identifier).await {
            tracing::warn!(%error, "failed to persist resolved link");
        }
        Ok(identifier)
    }
}
