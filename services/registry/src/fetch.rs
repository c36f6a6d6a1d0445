//! Fetching content from the storage gateway.
//!
//! Every backend read made by the registry goes through [`Gateway`], which
//! issues `GET` or `HEAD` requests for `{gateway}/{identifier}/{path}`.

use std::time::Duration;

use axum::http::{Method, StatusCode, Uri, header};
use bytes::Bytes;
use http_body_util::BodyExt as _;
use hyperdriver::Body;
use hyperdriver::client::SharedClientService;
use tower::ServiceExt as _;

/// Default gateway deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from a gateway call.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The gateway URL could not be built.
    #[error("invalid gateway url {url}")]
    Url {
        /// The rejected URL.
        url: String,
    },

    /// The request could not be built.
    #[error("building gateway request: {0}")]
    Request(#[from] axum::http::Error),

    /// The connection failed.
    #[error("gateway transport: {0}")]
    Transport(#[source] hyperdriver::client::Error),

    /// Reading the response body failed.
    #[error("reading gateway body: {0}")]
    Body(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The deadline passed before the gateway answered.
    #[error("gateway did not answer within {0:?}")]
    Timeout(Duration),

    /// The gateway answered with a non-success status.
    #[error("gateway returned {status} for {url}")]
    Status {
        /// Response status.
        status: StatusCode,
        /// Requested URL.
        url: String,
    },
}

/// A gateway response, fully buffered.
#[derive(Debug, Clone)]
pub struct Fetched {
    /// Response status.
    pub status: StatusCode,

    /// Declared `Content-Length`, falling back to the body length.
    pub content_length: u64,

    /// Declared `Content-Type`, if any.
    pub content_type: Option<String>,

    /// Response body (empty for `HEAD`).
    pub body: Bytes,
}

/// HTTP client for the storage gateway.
#[derive(Debug, Clone)]
pub struct Gateway {
    base: Uri,
    client: SharedClientService<Body, Body>,
    timeout: Duration,
}

impl Gateway {
    /// Create a gateway client rooted at `base`, e.g. `http://127.0.0.1:8080/ipfs/`.
    pub fn new(base: Uri) -> Self {
        Self::with_client(base, hyperdriver::Client::build_tcp_http().build_service())
    }

    /// Create a gateway client using an existing client service.
    pub fn with_client(base: Uri, client: SharedClientService<Body, Body>) -> Self {
        Self {
            base,
            client,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the per-call deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The gateway root.
    pub fn base(&self) -> &Uri {
        &self.base
    }

    /// Build the URL for `path` beneath `identifier`.
    pub fn url(&self, identifier: &str, path: &str) -> Result<Uri, FetchError> {
        let base = self.base.to_string();
        let mut url = format!("{}/{}", base.trim_end_matches('/'), identifier);
        if !path.is_empty() {
            url.push('/');
            url.push_str(path.trim_start_matches('/'));
        }
        url.parse().map_err(|_| FetchError::Url { url })
    }

    /// Issue `method` against `{identifier}/{path}`, relaying whatever status
    /// the gateway answers with.
    #[tracing::instrument(skip(self), fields(gateway = %self.base))]
    pub async fn fetch(
        &self,
        method: Method,
        identifier: &str,
        path: &str,
    ) -> Result<Fetched, FetchError> {
        let url = self.url(identifier, path)?;
        let request = axum::http::Request::builder()
            .method(method)
            .uri(url)
            .body(Body::empty())?;

        let response = tokio::time::timeout(self.timeout, self.client.clone().oneshot(request))
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))?
            .map_err(FetchError::Transport)?;

        let status = response.status();
        let declared_length = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let body = tokio::time::timeout(self.timeout, response.into_body().collect())
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))?
            .map_err(|err| FetchError::Body(err.into()))?
            .to_bytes();

        tracing::debug!(%status, bytes = body.len(), "gateway answered");

        Ok(Fetched {
            status,
            content_length: declared_length.unwrap_or(body.len() as u64),
            content_type,
            body,
        })
    }

    /// `GET` a path, requiring a success status.
    pub async fn get(&self, identifier: &str, path: &str) -> Result<Bytes, FetchError> {
        let fetched = self.fetch(Method::GET, identifier, path).await?;
        if !fetched.status.is_success() {
            return Err(FetchError::Status {
                status: fetched.status,
                url: self.url(identifier, path)?.to_string(),
            });
        }
        Ok(fetched.body)
    }
}
