use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::{Backend, Entry, EntryKind, StorageError, StorageErrorKind};

#[derive(Debug, Clone)]
enum Node {
    File(Bytes),
    Directory(BTreeMap<String, String>),
}

/// Backend that keeps a content-addressed tree in memory.
///
/// Files and directories are both addressed by the hex SHA-256 of their
/// canonical encoding, so inserting the same content twice yields the same
/// identifier. Identifier paths (`<id>/child/grandchild`) walk directories.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    nodes: RwLock<HashMap<String, Node>>,
}

fn not_found(identifier: &str, what: &str) -> StorageError {
    StorageError::new(
        "memory",
        StorageErrorKind::NotFound,
        std::io::Error::new(std::io::ErrorKind::NotFound, format!("{what} not found")),
    )
    .with_identifier(identifier)
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a file, returning its identifier.
    pub async fn insert_file(&self, data: impl Into<Bytes>) -> String {
        let data = data.into();
        let mut hasher = Sha256::new();
        hasher.update(b"file\0");
        hasher.update(&data);
        let id = hex::encode(hasher.finalize());

        self.nodes.write().await.insert(id.clone(), Node::File(data));
        id
    }

    /// Store a directory whose children are previously inserted identifiers.
    ///
    /// Returns the directory identifier. Children which do not exist are
    /// rejected, so every directory in the tree is fully listable.
    pub async fn insert_directory<I, N, C>(&self, children: I) -> Result<String, StorageError>
    where
        I: IntoIterator<Item = (N, C)>,
        N: Into<String>,
        C: Into<String>,
    {
        let children: BTreeMap<String, String> = children
            .into_iter()
            .map(|(name, id)| (name.into(), id.into()))
            .collect();

        let mut nodes = self.nodes.write().await;
        let mut hasher = Sha256::new();
        hasher.update(b"directory\0");
        for (name, id) in &children {
            if !nodes.contains_key(id) {
                return Err(not_found(id, "child"));
            }
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
            hasher.update(id.as_bytes());
            hasher.update(b"\n");
        }
        let id = hex::encode(hasher.finalize());
        nodes.insert(id.clone(), Node::Directory(children));
        Ok(id)
    }

    /// Read a file's bytes by identifier path.
    pub async fn read(&self, identifier: &str) -> Result<Bytes, StorageError> {
        let nodes = self.nodes.read().await;
        match walk(&nodes, identifier)? {
            Node::File(data) => Ok(data.clone()),
            Node::Directory(_) => Err(StorageError::new(
                "memory",
                StorageErrorKind::InvalidRequest,
                "cannot read a directory",
            )
            .with_identifier(identifier)),
        }
    }
}

fn walk<'n>(nodes: &'n HashMap<String, Node>, identifier: &str) -> Result<&'n Node, StorageError> {
    let mut segments = identifier.split('/').filter(|s| !s.is_empty());
    let root = segments
        .next()
        .ok_or_else(|| not_found(identifier, "identifier"))?;
    let mut node = nodes.get(root).ok_or_else(|| not_found(identifier, "identifier"))?;

    for segment in segments {
        let child = match node {
            Node::Directory(children) => children.get(segment),
            Node::File(_) => None,
        };
        node = child
            .and_then(|id| nodes.get(id))
            .ok_or_else(|| not_found(identifier, "path"))?;
    }

    Ok(node)
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list(&self, identifier: &str) -> Result<Vec<Entry>, StorageError> {
        tracing::trace!(%identifier, "list memory node");

        let nodes = self.nodes.read().await;
        let children = match walk(&nodes, identifier)? {
            Node::Directory(children) => children,
            Node::File(_) => return Ok(Vec::new()),
        };

        Ok(children
            .iter()
            .filter_map(|(name, id)| {
                nodes.get(id).map(|node| match node {
                    Node::File(data) => Entry {
                        name: name.clone(),
                        size: data.len() as u64,
                        kind: EntryKind::File,
                        id: id.clone(),
                    },
                    Node::Directory(_) => Entry {
                        name: name.clone(),
                        size: 0,
                        kind: EntryKind::Directory,
                        id: id.clone(),
                    },
                })
            })
            .collect())
    }
}
