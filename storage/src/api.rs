use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode, Uri};
use http_body_util::BodyExt as _;
use hyperdriver::Body;
use hyperdriver::client::SharedClientService;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use tower::ServiceExt as _;

use crate::{Backend, Entry, EntryKind, StorageError, StorageErrorKind};

const ENGINE: &str = "http";
const LS_ENDPOINT: &str = "api/v0/ls";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Characters left as-is inside the `arg` query parameter.
const ARG: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'/');

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LsResponse {
    #[serde(default)]
    objects: Vec<LsObject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LsObject {
    #[serde(default)]
    links: Vec<LsLink>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LsLink {
    name: String,
    hash: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "Type", default)]
    kind: u8,
}

impl From<LsLink> for Entry {
    fn from(link: LsLink) -> Self {
        let kind = match link.kind {
            1 => EntryKind::Directory,
            2 => EntryKind::File,
            _ => EntryKind::Other,
        };
        Entry {
            name: link.name,
            size: link.size,
            kind,
            id: link.hash,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

/// Backend reached through a content-addressed node's HTTP RPC API
/// (`POST {api}/api/v0/ls?arg=<identifier>`).
#[derive(Debug, Clone)]
pub struct HttpBackend {
    api: Uri,
    client: SharedClientService<Body, Body>,
    timeout: Duration,
}

impl HttpBackend {
    /// Create a backend talking to the node API at `api`.
    pub fn new(api: Uri) -> Self {
        Self::with_client(api, hyperdriver::Client::build_tcp_http().build_service())
    }

    /// Create a backend using an existing client service.
    pub fn with_client(api: Uri, client: SharedClientService<Body, Body>) -> Self {
        Self {
            api,
            client,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the per-call deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn ls_url(&self, identifier: &str) -> Result<Uri, StorageError> {
        let base = self.api.to_string();
        let url = format!(
            "{}/{LS_ENDPOINT}?arg={}",
            base.trim_end_matches('/'),
            utf8_percent_encode(identifier, ARG)
        );
        url.parse::<Uri>()
            .map_err(|err| StorageError::new(ENGINE, StorageErrorKind::InvalidRequest, err))
    }

    async fn post(&self, url: Uri) -> Result<(StatusCode, Bytes), StorageError> {
        let request = http::Request::builder()
            .method(Method::POST)
            .uri(url)
            .body(Body::empty())
            .map_err(StorageError::with(ENGINE, StorageErrorKind::InvalidRequest))?;

        let response = tokio::time::timeout(self.timeout, self.client.clone().oneshot(request))
            .await
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Timeout))?
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Io))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Io))?
            .to_bytes();

        Ok((status, body))
    }
}

fn classify_failure(status: StatusCode, body: &[u8]) -> (StorageErrorKind, String) {
    let message = serde_json::from_slice::<ApiErrorBody>(body)
        .map(|err| err.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());

    let lowered = message.to_lowercase();
    let kind = if status == StatusCode::NOT_FOUND
        || lowered.contains("not found")
        || lowered.contains("no link named")
    {
        StorageErrorKind::NotFound
    } else if status.is_server_error() {
        StorageErrorKind::ServiceUnavailable
    } else {
        StorageErrorKind::InvalidRequest
    };

    (kind, format!("HTTP {status}: {message}"))
}

#[async_trait::async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn list(&self, identifier: &str) -> Result<Vec<Entry>, StorageError> {
        let url = self.ls_url(identifier)?;
        tracing::trace!(%url, "POST ls");

        let (status, body) = self
            .post(url)
            .await
            .map_err(|err| err.with_identifier(identifier))?;

        if !status.is_success() {
            let (kind, message) = classify_failure(status, &body);
            return Err(StorageError::new(ENGINE, kind, message).with_identifier(identifier));
        }

        let listing: LsResponse = serde_json::from_slice(&body).map_err(|err| {
            StorageError::new(ENGINE, StorageErrorKind::SerializationError, err)
                .with_identifier(identifier)
        })?;

        Ok(listing
            .objects
            .into_iter()
            .flat_map(|object| object.links)
            .map(Entry::from)
            .collect())
    }
}
