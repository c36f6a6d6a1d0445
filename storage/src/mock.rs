//! A canned-response HTTP service, for testing code which talks to a gateway
//! or backend API through a hyperdriver client.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http::response;
use hyperdriver::client::SharedClientService;
use hyperdriver::service::SharedService;
use parking_lot::Mutex;

#[derive(Debug, Clone)]
struct MockResponse {
    status: http::StatusCode,
    headers: http::HeaderMap,
    body: Bytes,
}

/// Responds to requests by path (and query), recording every request it sees.
///
/// Paths with no configured response get an empty `404 Not Found`.
#[derive(Debug, Default, Clone)]
pub struct MockService {
    responses: HashMap<String, MockResponse>,
    requests: Arc<Mutex<Vec<(http::Method, String)>>>,
}

impl MockService {
    /// Create a mock with no configured responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the response for a path, e.g. `/ipfs/abc/blobs/sha256:...`.
    pub fn add(
        &mut self,
        path: &str,
        status: http::StatusCode,
        headers: http::HeaderMap,
        body: impl Into<Bytes>,
    ) {
        let response = MockResponse {
            status,
            headers,
            body: body.into(),
        };
        self.responses.insert(path.to_owned(), response);
    }

    /// Every request seen so far, as `(method, path-and-query)`.
    pub fn requests(&self) -> Vec<(http::Method, String)> {
        self.requests.lock().clone()
    }

    /// Wrap this mock so it can stand in for a hyperdriver client.
    pub fn into_client(self) -> SharedClientService<hyperdriver::Body, hyperdriver::Body> {
        SharedService::new(self)
    }
}

impl tower::Service<http::Request<hyperdriver::Body>> for MockService {
    type Response = http::Response<hyperdriver::Body>;
    type Error = hyperdriver::client::Error;
    type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<hyperdriver::Body>) -> Self::Future {
        let key = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| req.uri().path().to_owned());
        self.requests.lock().push((req.method().clone(), key.clone()));

        let (status, headers, body) = match self.responses.get(&key) {
            Some(response) => (
                response.status,
                response.headers.clone(),
                response.body.clone(),
            ),
            None => (http::StatusCode::NOT_FOUND, http::HeaderMap::new(), Bytes::new()),
        };

        let mut builder = response::Builder::new()
            .status(status)
            .version(http::Version::HTTP_11);

        if !headers.contains_key(http::header::CONTENT_LENGTH) {
            builder = builder.header(http::header::CONTENT_LENGTH, body.len());
        }

        for (key, value) in headers.iter() {
            builder = builder.header(key, value);
        }

        let body = if req.method() == http::Method::HEAD {
            Bytes::new()
        } else {
            body
        };

        let response = builder
            .body(hyperdriver::Body::from(body))
            .expect("mock response is well formed");

        std::future::ready(Ok(response))
    }
}

/// Accepts every request and never answers, for exercising deadlines.
#[derive(Debug, Default, Clone)]
pub struct StalledService {
    requests: Arc<Mutex<usize>>,
}

impl StalledService {
    /// Create a service which never responds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests received.
    pub fn requests(&self) -> usize {
        *self.requests.lock()
    }

    /// Wrap this service so it can stand in for a hyperdriver client.
    pub fn into_client(self) -> SharedClientService<hyperdriver::Body, hyperdriver::Body> {
        SharedService::new(self)
    }
}

impl tower::Service<http::Request<hyperdriver::Body>> for StalledService {
    type Response = http::Response<hyperdriver::Body>;
    type Error = hyperdriver::client::Error;
    type Future = std::future::Pending<Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: http::Request<hyperdriver::Body>) -> Self::Future {
        *self.requests.lock() += 1;
        std::future::pending()
    }
}
