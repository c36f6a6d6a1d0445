//! Resolving `(repository, reference)` pairs into backend identifiers.
//!
//! A [`Resolver`] answers with zero or more identifiers. Resolvers are
//! combined with a [`ResolverChain`]: a lookup for a specific reference takes
//! the first resolver with an answer, while a lookup with an empty reference
//! lists everything every resolver knows.

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use storage::{EntryKind, Storage, StorageError};

/// Errors raised while resolving.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No resolver produced an identifier.
    #[error("cannot resolve {target}")]
    Unresolvable {
        /// The `repository:reference` which was looked up.
        target: String,
    },

    /// Reading the resolver's files failed.
    #[error("reading {path}: {source}")]
    Io {
        /// The file or directory being read.
        path: Utf8PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The storage backend could not list a directory.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Source of backend identifiers for repository references.
#[async_trait::async_trait]
pub trait Resolver: fmt::Debug + Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Find identifiers for `reference` in `repository`.
    ///
    /// An empty `reference` asks for every identifier the resolver knows
    /// for the repository.
    async fn resolve(&self, repository: &str, reference: &str) -> Result<Vec<String>, ResolveError>;
}

/// Join repository segments onto `root`, skipping anything which would
/// escape it.
pub(crate) fn safe_join(root: &Utf8Path, segments: &[&str]) -> Utf8PathBuf {
    let mut path = root.to_path_buf();
    for part in segments.iter().flat_map(|segment| segment.split('/')) {
        if part.is_empty() || part == "." || part == ".." {
            continue;
        }
        path.push(part);
    }
    path
}

/// Location of the link file for `reference` in `repository`.
///
/// The leaf is prefixed with `@`, which no repository path component may
/// start with, so a repository and a tag of its parent never share a path.
pub(crate) fn link_path(root: &Utf8Path, repository: &str, reference: &str) -> Utf8PathBuf {
    safe_join(root, &[repository]).join(format!("{LINK_PREFIX}{}", reference.replace('/', "%2F")))
}

const LINK_PREFIX: char = '@';

/// Resolves from a directory tree of link files.
///
/// `<root>/<repository>/@<reference>` holds one identifier per line.
#[derive(Debug, Clone)]
pub struct FileResolver {
    root: Utf8PathBuf,
}

impl FileResolver {
    /// Resolve from files under `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_lines(path: &Utf8Path) -> Result<Vec<String>, ResolveError> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_owned)
                .collect()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(ResolveError::Io {
                path: path.to_owned(),
                source,
            }),
        }
    }

    async fn read_all(dir: &Utf8Path) -> Result<Vec<String>, ResolveError> {
        let io_error = |source| ResolveError::Io {
            path: dir.to_owned(),
            source,
        };

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(io_error(error)),
        };

        let mut identifiers = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            if !entry.file_type().await.map_err(io_error)?.is_file()
                || !entry.file_name().to_string_lossy().starts_with(LINK_PREFIX)
            {
                continue;
            }
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            identifiers.extend(Self::read_lines(&path).await?);
        }
        Ok(identifiers)
    }
}

#[async_trait::async_trait]
impl Resolver for FileResolver {
    fn name(&self) -> &'static str {
        "file"
    }

    #[tracing::instrument(skip(self), fields(root = %self.root))]
    async fn resolve(&self, repository: &str, reference: &str) -> Result<Vec<String>, ResolveError> {
        if reference.is_empty() {
            Self::read_all(&safe_join(&self.root, &[repository])).await
        } else {
            Self::read_lines(&link_path(&self.root, repository, reference)).await
        }
    }
}

/// Resolves by listing directories in the storage backend.
///
/// Images are published as directories named after their reference beneath
/// `{root}/{repository}`. A repository which is itself the identifier of a
/// published image resolves to itself.
#[derive(Debug, Clone)]
pub struct StorageResolver {
    storage: Storage,
    root: Option<String>,
}

impl StorageResolver {
    /// Resolve by listing `storage`, with repositories beneath `root`.
    pub fn new(storage: Storage, root: Option<String>) -> Self {
        Self { storage, root }
    }

    fn repository_path(&self, repository: &str) -> String {
        match &self.root {
            Some(root) => format!("{}/{}", root.trim_end_matches('/'), repository),
            None => repository.to_owned(),
        }
    }

    /// Whether `repository` names an image directory directly.
    async fn is_image(&self, repository: &str) -> bool {
        if repository.contains('/') {
            return false;
        }
        match self.storage.list(repository).await {
            Ok(entries) => entries
                .iter()
                .any(|entry| entry.name == "manifests" && entry.kind == EntryKind::Directory),
            Err(_) => false,
        }
    }
}

#[async_trait::async_trait]
impl Resolver for StorageResolver {
    fn name(&self) -> &'static str {
        "storage"
    }

    #[tracing::instrument(skip(self), fields(backend = self.storage.name()))]
    async fn resolve(&self, repository: &str, reference: &str) -> Result<Vec<String>, ResolveError> {
        if self.is_image(repository).await {
            return Ok(vec![repository.to_owned()]);
        }

        let entries = match self.storage.list(&self.repository_path(repository)).await {
            Ok(entries) => entries,
            Err(error) if error.is_not_found() => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        Ok(entries
            .into_iter()
            .filter(|entry| reference.is_empty() || entry.name == reference)
            .map(|entry| entry.id)
            .collect())
    }
}

/// An ordered list of resolvers, most specific first.
#[derive(Debug, Clone, Default)]
pub struct ResolverChain {
    resolvers: Vec<Arc<dyn Resolver>>,
}

impl ResolverChain {
    /// An empty chain, which resolves nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a resolver to the end of the chain.
    pub fn push<R: Resolver + 'static>(&mut self, resolver: R) {
        self.resolvers.push(Arc::new(resolver));
    }

    /// Append a resolver, builder style.
    pub fn with<R: Resolver + 'static>(mut self, resolver: R) -> Self {
        self.push(resolver);
        self
    }

    /// Number of resolvers in the chain.
    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    /// Whether the chain has no resolvers.
    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// Resolve `reference` in `repository`.
    ///
    /// With a reference, the first non-empty answer wins unmodified. With an
    /// empty reference, every answer is merged, deduplicated and sorted.
    /// Resolvers which fail are skipped.
    #[tracing::instrument(skip(self))]
    pub async fn resolve(&self, repository: &str, reference: &str) -> Result<Vec<String>, ResolveError> {
        let mut merged = BTreeSet::new();

        for resolver in &self.resolvers {
            let found = match resolver.resolve(repository, reference).await {
                Ok(found) => found,
                Err(error) => {
                    tracing::warn!(resolver = resolver.name(), %error, "resolver failed, skipping");
                    continue;
                }
            };

            if found.is_empty() {
                continue;
            }

            if !reference.is_empty() {
                tracing::debug!(resolver = resolver.name(), "resolved");
                return Ok(found);
            }
            merged.extend(found);
        }

        if merged.is_empty() {
            return Err(ResolveError::Unresolvable {
                target: format!("{repository}:{reference}"),
            });
        }
        Ok(merged.into_iter().collect())
    }
}
