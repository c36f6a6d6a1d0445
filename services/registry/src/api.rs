//! API server builder and router

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, StatusCode, Uri};
use axum::response::Json;
use axum::routing::{any, get};
use camino::Utf8PathBuf;
use hyperdriver::Body;
use hyperdriver::client::SharedClientService;
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::blob::BlobStore;
use crate::dispatch;
use crate::fetch::Gateway;
use crate::links::LinkCache;
use crate::manifest::ManifestStore;
use crate::resolver::{ResolveError, Resolver, ResolverChain};
use crate::DOCKER_API_VERSION;

/// Gateway used when none is configured.
pub const DEFAULT_GATEWAY: &str = "http://127.0.0.1:8080/ipfs/";

const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(1);

/// Registry builder for configuring and creating the OCI registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    gateway: Option<Uri>,
    client: Option<SharedClientService<Body, Body>>,
    links: Option<Utf8PathBuf>,
    resolvers: ResolverChain,
    fetch_timeout: Duration,
    body_limit: Option<usize>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self {
            gateway: None,
            client: None,
            links: None,
            resolvers: ResolverChain::new(),
            fetch_timeout: crate::fetch::DEFAULT_TIMEOUT,
            body_limit: None,
        }
    }

    /// Set the storage gateway root
    pub fn gateway(mut self, gateway: Uri) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Use an existing HTTP client for gateway requests
    pub fn client(mut self, client: SharedClientService<Body, Body>) -> Self {
        self.client = Some(client);
        self
    }

    /// Persist resolved links beneath `root`
    pub fn links(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.links = Some(root.into());
        self
    }

    /// Append a resolver to the chain. Earlier resolvers take precedence.
    pub fn resolver<R: Resolver + 'static>(mut self, resolver: R) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// Deadline for each gateway request
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Maximum request body size. Unlimited when unset.
    pub fn body_limit(mut self, limit: Option<usize>) -> Self {
        self.body_limit = limit;
        self
    }

    /// Build the registry service
    pub fn build(self) -> Registry {
        let base = self
            .gateway
            .unwrap_or_else(|| Uri::from_static(DEFAULT_GATEWAY));
        let gateway = match self.client {
            Some(client) => Gateway::with_client(base, client),
            None => Gateway::new(base),
        }
        .timeout(self.fetch_timeout);

        let links = match self.links {
            Some(root) => LinkCache::persistent(root),
            None => LinkCache::new(),
        };

        Registry {
            blobs: BlobStore::new(),
            manifests: ManifestStore::new(),
            links,
            resolver: Arc::new(self.resolvers),
            gateway,
            body_limit: self.body_limit,
        }
    }
}

/// A configured registry. Cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct Registry {
    pub(crate) blobs: BlobStore,
    pub(crate) manifests: ManifestStore,
    pub(crate) links: LinkCache,
    pub(crate) resolver: Arc<ResolverChain>,
    pub(crate) gateway: Gateway,
    body_limit: Option<usize>,
}

impl Registry {
    /// Start configuring a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Pushed blobs and upload sessions.
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Pushed and pulled manifests.
    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// Resolved identifiers.
    pub fn links(&self) -> &LinkCache {
        &self.links
    }

    /// The resolver chain.
    pub fn resolver(&self) -> &ResolverChain {
        &self.resolver
    }

    /// The storage gateway client.
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Find the backend identifier holding `reference`, consulting the link
    /// cache before the resolver chain.
    pub async fn locate(&self, repository: &str, reference: &str) -> Result<String, ResolveError> {
        self.links.locate(&self.resolver, repository, reference).await
    }

    /// Router serving the distribution API
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn router(&self) -> Router {
        let body_limit = match self.body_limit {
            Some(limit) => DefaultBodyLimit::max(limit),
            None => DefaultBodyLimit::disable(),
        };

        Router::new()
            .route("/v2", get(api_version_check))
            .route("/v2/", get(api_version_check))
            .route("/v2/{*path}", any(dispatch::dispatch))
            .route("/dig", get(dispatch::dig))
            .with_state(self.clone())
            .layer(body_limit)
            .layer(SetResponseHeaderLayer::overriding(
                DOCKER_API_VERSION,
                HeaderValue::from_static("registry/2.0"),
            ))
            .layer(TraceLayer::new_for_http())
    }

    /// Periodically drop upload sessions idle for longer than `max_idle`.
    ///
    /// A zero `period` is raised to one millisecond.
    pub fn spawn_upload_sweeper(
        &self,
        period: Duration,
        max_idle: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let blobs = self.blobs.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(MIN_SWEEP_PERIOD));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                blobs.sweep(max_idle);
            }
        })
    }
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}
