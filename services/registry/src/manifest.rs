//! Manifest operations for the registry

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::api::Registry;
use crate::digest::{self, is_digest};
use crate::error::{RegistryError, RegistryResult};
use crate::fetch::FetchError;
use crate::{DOCKER_CONTENT_DIGEST, DOCKER_CONTENT_ID};

const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// A stored manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Exact bytes as received.
    pub body: Bytes,

    /// Media type, as pushed or detected.
    pub media_type: String,

    /// `sha256:` digest of `body`.
    pub digest: String,

    /// Backend identifier the manifest was pulled from, if it was pulled.
    pub origin: Option<String>,
}

impl Manifest {
    /// Wrap manifest bytes, detecting the media type when none is given.
    pub fn new(body: Bytes, media_type: Option<&str>, origin: Option<String>) -> Self {
        let media_type = media_type
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| detect_manifest_type(&body).to_owned());
        Self {
            digest: digest::sha256(&body),
            body,
            media_type,
            origin,
        }
    }

    /// Whether this is an image index or manifest list.
    pub fn is_index(&self) -> bool {
        is_index_type(&self.media_type)
    }
}

fn is_index_type(media_type: &str) -> bool {
    // Content-Type may carry parameters.
    let essence = media_type.split(';').next().unwrap_or_default().trim();
    essence == OCI_INDEX || essence == DOCKER_MANIFEST_LIST
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FsLayer {
    blob_sum: String,
}

/// The parts of a manifest document the registry looks at.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDocument {
    #[serde(default)]
    schema_version: Option<u64>,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
    #[serde(default)]
    fs_layers: Vec<FsLayer>,
}

impl ManifestDocument {
    /// Every digest the document points at.
    fn references(&self) -> impl Iterator<Item = &str> {
        self.config
            .iter()
            .chain(&self.layers)
            .chain(&self.manifests)
            .map(|descriptor| descriptor.digest.as_str())
            .chain(self.fs_layers.iter().map(|layer| layer.blob_sum.as_str()))
    }
}

/// Detect manifest type from content
fn detect_manifest_type(data: &[u8]) -> &'static str {
    let Ok(document) = serde_json::from_slice::<ManifestDocument>(data) else {
        return OCI_MANIFEST;
    };

    match document.media_type.as_deref() {
        Some(OCI_INDEX) => return OCI_INDEX,
        Some(DOCKER_MANIFEST_LIST) => return DOCKER_MANIFEST_LIST,
        Some(DOCKER_MANIFEST_V2) => return DOCKER_MANIFEST_V2,
        Some(DOCKER_MANIFEST_V1) => return DOCKER_MANIFEST_V1,
        _ => {}
    }

    match document.schema_version {
        Some(1) => DOCKER_MANIFEST_V1,
        Some(2) if !document.manifests.is_empty() => DOCKER_MANIFEST_LIST,
        Some(2) if document.media_type.is_none() => DOCKER_MANIFEST_V2,
        _ => OCI_MANIFEST,
    }
}

type Table = HashMap<String, HashMap<String, Arc<Manifest>>>;

/// In-memory manifests, keyed by repository then by tag and digest.
#[derive(Debug, Clone, Default)]
pub struct ManifestStore {
    repositories: Arc<Mutex<Table>>,
}

impl ManifestStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a manifest by tag or digest.
    pub fn get(&self, repository: &str, reference: &str) -> Option<Arc<Manifest>> {
        self.repositories
            .lock()
            .get(repository)
            .and_then(|references| references.get(reference))
            .cloned()
    }

    /// Whether a manifest is stored under `reference`.
    pub fn contains(&self, repository: &str, reference: &str) -> bool {
        self.get(repository, reference).is_some()
    }

    /// Store a manifest under `reference` and under its digest.
    pub fn insert(&self, repository: &str, reference: &str, manifest: Arc<Manifest>) {
        let mut repositories = self.repositories.lock();
        Self::insert_locked(&mut repositories, repository, reference, manifest);
    }

    fn insert_locked(table: &mut Table, repository: &str, reference: &str, manifest: Arc<Manifest>) {
        let references = table.entry(repository.to_string()).or_default();
        references.insert(manifest.digest.clone(), manifest.clone());
        references.insert(reference.to_string(), manifest);
    }

    /// Validate and store a pushed manifest.
    ///
    /// An index is only accepted once every manifest it lists is present in
    /// the repository. A missing child rejects the whole push.
    #[tracing::instrument(skip(self, body), fields(bytes = body.len()))]
    pub fn put(
        &self,
        repository: &str,
        reference: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> RegistryResult<Arc<Manifest>> {
        let manifest = Manifest::new(body, content_type, None);
        if is_digest(reference) && reference != manifest.digest {
            return Err(RegistryError::DigestMismatch {
                expected: reference.to_string(),
                actual: manifest.digest,
            });
        }

        let children: Vec<String> = if manifest.is_index() {
            let document: ManifestDocument = serde_json::from_slice(&manifest.body)
                .map_err(|err| RegistryError::InvalidManifest(err.to_string()))?;
            document.manifests.into_iter().map(|child| child.digest).collect()
        } else {
            Vec::new()
        };

        let manifest = Arc::new(manifest);
        let mut repositories = self.repositories.lock();
        if let Some(missing) = children.iter().find(|child| {
            !repositories
                .get(repository)
                .is_some_and(|references| references.contains_key(child.as_str()))
        }) {
            return Err(RegistryError::ManifestNotFound(missing.clone()));
        }

        Self::insert_locked(&mut repositories, repository, reference, manifest.clone());
        tracing::debug!(digest = %manifest.digest, "manifest stored");
        Ok(manifest)
    }
}

pub(crate) fn respond(method: &Method, manifest: &Manifest) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&manifest.media_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&manifest.digest) {
        headers.insert(DOCKER_CONTENT_DIGEST, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(manifest.body.len()));
    if let Some(value) = manifest
        .origin
        .as_deref()
        .and_then(|origin| HeaderValue::from_str(origin).ok())
    {
        headers.insert(DOCKER_CONTENT_ID, value);
    }

    let body = if method == Method::HEAD {
        Bytes::new()
    } else {
        manifest.body.clone()
    };
    (StatusCode::OK, headers, body).into_response()
}

/// Pull a manifest from the backend and cache it, registering links for
/// everything it references.
async fn pull(registry: &Registry, repository: &str, reference: &str) -> RegistryResult<Arc<Manifest>> {
    let identifier = registry
        .locate(repository, reference)
        .await
        .map_err(|_| RegistryError::ManifestNotFound(reference.to_string()))?;

    let body = match registry
        .gateway
        .get(&identifier, &format!("manifests/{reference}"))
        .await
    {
        Ok(body) => body,
        Err(FetchError::Status { status, .. }) => {
            tracing::debug!(%status, %identifier, "gateway has no such manifest");
            return Err(RegistryError::ManifestNotFound(reference.to_string()));
        }
        Err(error) => return Err(error.into()),
    };

    let manifest = Arc::new(Manifest::new(body, None, Some(identifier.clone())));
    match serde_json::from_slice::<ManifestDocument>(&manifest.body) {
        Ok(document) => {
            let targets = document
                .references()
                .chain(std::iter::once(manifest.digest.as_str()));
            for target in targets {
                if let Err(error) = registry.links.add(repository, target, &identifier).await {
                    tracing::warn!(%error, %target, "failed to pre-warm link");
                }
            }
        }
        Err(error) => tracing::warn!(%error, %identifier, "pulled manifest is not parseable"),
    }

    registry.manifests.insert(repository, reference, manifest.clone());
    Ok(manifest)
}

/// Serve a manifest, pulling it through the gateway on a miss.
#[tracing::instrument(skip(registry))]
pub(crate) async fn fetch(
    registry: &Registry,
    method: Method,
    repository: &str,
    reference: &str,
) -> RegistryResult<Response> {
    let manifest = match registry.manifests.get(repository, reference) {
        Some(manifest) => {
            tracing::debug!("manifest cache hit");
            manifest
        }
        None => pull(registry, repository, reference).await?,
    };
    Ok(respond(&method, &manifest))
}

/// Store a pushed manifest.
pub(crate) fn store(
    registry: &Registry,
    repository: &str,
    reference: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let manifest = registry.manifests.put(repository, reference, content_type, body)?;

    Ok((
        StatusCode::CREATED,
        [
            (
                header::LOCATION,
                format!("/v2/{repository}/manifests/{}", manifest.digest),
            ),
            (DOCKER_CONTENT_DIGEST, manifest.digest.clone()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response())
}
