//! Blob operations for the registry

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::api::Registry;
use crate::digest;
use crate::error::{RegistryError, RegistryResult};
use crate::{DOCKER_CONTENT_DIGEST, DOCKER_CONTENT_ID, DOCKER_UPLOAD_UUID};

#[derive(Debug)]
struct UploadSession {
    repository: String,
    buffer: BytesMut,
    touched: Instant,
}

#[derive(Debug, Default)]
struct BlobState {
    content: HashMap<String, Bytes>,
    sessions: HashMap<String, UploadSession>,
    layers: HashMap<String, BTreeSet<String>>,
}

impl BlobState {
    fn session(&mut self, repository: &str, id: &str) -> RegistryResult<&mut UploadSession> {
        match self.sessions.get_mut(id) {
            Some(session) if session.repository == repository => Ok(session),
            _ => Err(RegistryError::BlobUploadUnknown(id.to_string())),
        }
    }

    fn commit(&mut self, repository: &str, digest: &str, data: Bytes) {
        self.content.insert(digest.to_string(), data);
        self.layers
            .entry(repository.to_string())
            .or_default()
            .insert(digest.to_string());
    }
}

/// In-memory blob content and upload sessions.
///
/// All state sits behind one lock. Bodies arrive fully buffered, so the lock
/// is never held across an await point.
#[derive(Debug, Clone, Default)]
pub struct BlobStore {
    state: Arc<Mutex<BlobState>>,
}

impl BlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get committed blob content.
    pub fn get(&self, digest: &str) -> Option<Bytes> {
        self.state.lock().content.get(digest).cloned()
    }

    /// Store a complete blob, verifying it against `expected`.
    #[tracing::instrument(skip(self, data), fields(bytes = data.len()))]
    pub fn commit(&self, repository: &str, expected: &str, data: Bytes) -> RegistryResult<String> {
        digest::validate(expected)?;
        let actual = digest::sha256(&data);
        if actual != expected {
            return Err(RegistryError::DigestMismatch {
                expected: expected.to_string(),
                actual,
            });
        }

        self.state.lock().commit(repository, &actual, data);
        tracing::debug!(digest = %actual, "blob committed");
        Ok(actual)
    }

    /// Append a chunk to an upload session, returning the buffered length.
    ///
    /// The chunk must start exactly where the buffer ends. A chunk without a
    /// range is only accepted as the first write of a session.
    #[tracing::instrument(skip(self, chunk), fields(bytes = chunk.len()))]
    pub fn append(
        &self,
        repository: &str,
        id: &str,
        range: Option<(u64, u64)>,
        chunk: Bytes,
    ) -> RegistryResult<u64> {
        let mut state = self.state.lock();

        if !state.sessions.contains_key(id) {
            if let Some((start, end)) = range {
                if start != 0 {
                    return Err(RegistryError::RangeNotSatisfiable { length: 0, start });
                }
                check_chunk_length(id, start, end, &chunk)?;
            }
            let session = UploadSession {
                repository: repository.to_string(),
                buffer: BytesMut::from(&chunk[..]),
                touched: Instant::now(),
            };
            let length = session.buffer.len() as u64;
            state.sessions.insert(id.to_string(), session);
            return Ok(length);
        }

        let session = state.session(repository, id)?;
        let length = session.buffer.len() as u64;
        match range {
            None => {
                return Err(RegistryError::BlobUploadInvalid(format!(
                    "upload {id} already started, Content-Range required"
                )));
            }
            Some((start, _)) if start != length => {
                return Err(RegistryError::RangeNotSatisfiable { length, start });
            }
            Some((start, end)) => check_chunk_length(id, start, end, &chunk)?,
        }

        session.buffer.extend_from_slice(&chunk);
        session.touched = Instant::now();
        Ok(session.buffer.len() as u64)
    }

    /// Complete an upload with optional trailing bytes.
    ///
    /// On a digest mismatch nothing changes, so the client can retry. An
    /// upload which never received a chunk finalizes from `trailing` alone.
    #[tracing::instrument(skip(self, trailing), fields(bytes = trailing.len()))]
    pub fn finalize(
        &self,
        repository: &str,
        id: &str,
        expected: &str,
        trailing: Bytes,
    ) -> RegistryResult<String> {
        digest::validate(expected)?;
        let mut state = self.state.lock();

        let buffered: &[u8] = if state.sessions.contains_key(id) {
            &state.session(repository, id)?.buffer[..]
        } else {
            &[]
        };

        let actual = digest::sha256_chunks([buffered, &trailing[..]]);
        if actual != expected {
            return Err(RegistryError::DigestMismatch {
                expected: expected.to_string(),
                actual,
            });
        }

        let mut data = BytesMut::with_capacity(buffered.len() + trailing.len());
        data.extend_from_slice(buffered);
        data.extend_from_slice(&trailing);

        state.sessions.remove(id);
        state.commit(repository, &actual, data.freeze());
        tracing::debug!(digest = %actual, "upload finalized");
        Ok(actual)
    }

    /// Bytes buffered so far in an upload session.
    pub fn status(&self, repository: &str, id: &str) -> RegistryResult<u64> {
        let mut state = self.state.lock();
        Ok(state.session(repository, id)?.buffer.len() as u64)
    }

    /// Abandon an upload session.
    pub fn cancel(&self, repository: &str, id: &str) -> RegistryResult<()> {
        let mut state = self.state.lock();
        state.session(repository, id)?;
        state.sessions.remove(id);
        Ok(())
    }

    /// Digests committed under a repository.
    pub fn layers(&self, repository: &str) -> Vec<String> {
        self.state
            .lock()
            .layers
            .get(repository)
            .map(|layers| layers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget a repository's layers, dropping content no other repository
    /// has committed. Returns the number of blobs removed.
    #[tracing::instrument(skip(self))]
    pub fn remove(&self, repository: &str) -> usize {
        let mut state = self.state.lock();
        let Some(digests) = state.layers.remove(repository) else {
            return 0;
        };

        let mut removed = 0;
        for digest in digests {
            let shared = state.layers.values().any(|layers| layers.contains(&digest));
            if !shared && state.content.remove(&digest).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Drop upload sessions which have not been written for `max_idle`.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let mut state = self.state.lock();
        let before = state.sessions.len();
        state
            .sessions
            .retain(|_, session| session.touched.elapsed() < max_idle);
        let swept = before - state.sessions.len();
        if swept > 0 {
            tracing::info!(swept, "expired idle upload sessions");
        }
        swept
    }
}

/// Parse `Content-Range`, as either `start-end` or `bytes start-end[/total]`.
/// A `Content-Range` of `start-end` is inclusive and must cover the chunk exactly.
fn check_chunk_length(id: &str, start: u64, end: u64, chunk: &[u8]) -> RegistryResult<()> {
    if end.checked_sub(start).map(|span| span + 1) != Some(chunk.len() as u64) {
        return Err(RegistryError::BlobUploadInvalid(format!(
            "upload {id}: Content-Range {start}-{end} does not match a {} byte chunk",
            chunk.len()
        )));
    }
    Ok(())
}

pub(crate) fn parse_content_range(value: &str) -> RegistryResult<(u64, u64)> {
    let invalid = || RegistryError::BlobUploadInvalid(format!("malformed Content-Range: {value}"));

    let range = value.trim();
    let range = range.strip_prefix("bytes").map(str::trim_start).unwrap_or(range);
    let range = range.split_once('/').map(|(range, _)| range).unwrap_or(range);
    let (start, end) = range.split_once('-').ok_or_else(invalid)?;
    let start: u64 = start.trim().parse().map_err(|_| invalid())?;
    let end: u64 = end.trim().parse().map_err(|_| invalid())?;
    if end < start {
        return Err(invalid());
    }
    Ok((start, end))
}

fn range_header(length: u64) -> String {
    format!("0-{}", length.saturating_sub(1))
}

fn upload_location(repository: &str, id: &str) -> String {
    format!("/v2/{repository}/blobs/uploads/{id}")
}

fn upload_progress(status: StatusCode, repository: &str, id: &str, length: u64) -> Response {
    (
        status,
        [
            (header::LOCATION, upload_location(repository, id)),
            (header::RANGE, range_header(length)),
            (DOCKER_UPLOAD_UUID, id.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response()
}

fn created(repository: &str, digest: &str) -> Response {
    (
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/v2/{repository}/blobs/{digest}")),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response()
}

/// Serve a blob, from memory or through the gateway.
#[tracing::instrument(skip(registry))]
pub(crate) async fn fetch(
    registry: &Registry,
    method: Method,
    repository: &str,
    digest: &str,
) -> RegistryResult<Response> {
    if let Some(data) = registry.blobs.get(digest) {
        tracing::debug!("blob served from memory");
        let headers = [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, data.len().to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ];
        let body = if method == Method::HEAD { Bytes::new() } else { data };
        return Ok((StatusCode::OK, headers, body).into_response());
    }

    let identifier = registry
        .locate(repository, digest)
        .await
        .map_err(|_| RegistryError::BlobNotFound(digest.to_string()))?;

    let fetched = registry
        .gateway
        .fetch(method, &identifier, &format!("blobs/{digest}"))
        .await?;
    if !fetched.status.is_success() {
        tracing::debug!(status = %fetched.status, %identifier, "gateway has no such blob");
        return Err(RegistryError::BlobNotFound(digest.to_string()));
    }

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(fetched.content_length));
    if let Some(content_type) = fetched
        .content_type
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
    {
        headers.insert(header::CONTENT_TYPE, content_type);
    }
    if let Ok(value) = HeaderValue::from_str(digest) {
        headers.insert(DOCKER_CONTENT_DIGEST, value);
    }
    if let Ok(value) = HeaderValue::from_str(&identifier) {
        headers.insert(DOCKER_CONTENT_ID, value);
    }

    Ok((fetched.status, headers, fetched.body).into_response())
}

/// Start an upload, or store a whole blob when the digest is given up front.
pub(crate) fn initiate(
    registry: &Registry,
    repository: &str,
    digest: Option<&str>,
    body: Bytes,
) -> RegistryResult<Response> {
    if let Some(expected) = digest {
        let digest = registry.blobs.commit(repository, expected, body)?;
        return Ok(created(repository, &digest));
    }

    let id = uuid::Uuid::new_v4().to_string();
    tracing::debug!(%id, "upload initiated");
    Ok(upload_progress(StatusCode::ACCEPTED, repository, &id, 0))
}

/// Append a chunk to an upload.
pub(crate) fn patch(
    registry: &Registry,
    repository: &str,
    id: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let range = headers
        .get(header::CONTENT_RANGE)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| RegistryError::BlobUploadInvalid("Content-Range is not text".into()))
                .and_then(parse_content_range)
        })
        .transpose()?;

    let length = registry.blobs.append(repository, id, range, body)?;
    Ok(upload_progress(StatusCode::NO_CONTENT, repository, id, length))
}

/// Finalize an upload.
pub(crate) fn put(
    registry: &Registry,
    repository: &str,
    id: &str,
    digest: Option<&str>,
    body: Bytes,
) -> RegistryResult<Response> {
    let expected =
        digest.ok_or_else(|| RegistryError::InvalidDigest("missing digest parameter".into()))?;
    let digest = registry.blobs.finalize(repository, id, expected, body)?;
    Ok(created(repository, &digest))
}

/// Report upload progress.
pub(crate) fn status(registry: &Registry, repository: &str, id: &str) -> RegistryResult<Response> {
    let length = registry.blobs.status(repository, id)?;
    Ok(upload_progress(StatusCode::NO_CONTENT, repository, id, length))
}

/// Cancel an upload.
pub(crate) fn cancel(registry: &Registry, repository: &str, id: &str) -> RegistryResult<Response> {
    registry.blobs.cancel(repository, id)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
