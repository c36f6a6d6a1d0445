//! Integration tests for the OCI registry

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, Response, StatusCode, header};
use bytes::Bytes;
use camino::Utf8PathBuf;
use linked_registry::{FileResolver, Registry, RegistryBuilder, digest};
use storage::mock::{MockService, StalledService};
use tower::ServiceExt;

const HELLO: &str = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

/// Helper to create a test registry with no resolvers and an empty gateway
fn test_registry() -> Registry {
    RegistryBuilder::new()
        .gateway("http://gateway.test/ipfs/".parse().unwrap())
        .client(MockService::new().into_client())
        .build()
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    headers: &[(&str, &str)],
    body: impl Into<Body>,
) -> Response<Body> {
    let mut request = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    app.clone()
        .oneshot(request.body(body.into()).unwrap())
        .await
        .unwrap()
}

async fn body_bytes(response: Response<Body>) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

async fn error_code(response: Response<Body>) -> String {
    let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    json["code"].as_str().unwrap().to_string()
}

fn header_str<'r>(response: &'r Response<Body>, name: &str) -> &'r str {
    response.headers().get(name).unwrap().to_str().unwrap()
}

#[tokio::test]
async fn test_api_version_check() {
    let app = test_registry().router();

    let response = send(&app, Method::GET, "/v2/", &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "docker-distribution-api-version"), "registry/2.0");

    let response = send(&app, Method::HEAD, "/v2/", &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_monolithic_upload_then_head() {
    let app = test_registry().router();

    let response = send(
        &app,
        Method::POST,
        &format!("/v2/repo/blobs/uploads/?digest={HELLO}"),
        &[],
        "hello",
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_str(&response, "docker-content-digest"), HELLO);
    assert_eq!(
        header_str(&response, "location"),
        format!("/v2/repo/blobs/{HELLO}")
    );

    let response = send(
        &app,
        Method::HEAD,
        &format!("/v2/repo/blobs/{HELLO}"),
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "content-length"), "5");
    assert_eq!(header_str(&response, "docker-content-digest"), HELLO);
}

#[tokio::test]
async fn test_monolithic_upload_digest_mismatch() {
    let app = test_registry().router();

    let response = send(
        &app,
        Method::POST,
        &format!("/v2/repo/blobs/uploads/?digest={HELLO}"),
        &[],
        "goodbye",
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");
}

#[tokio::test]
async fn test_chunked_upload() {
    let app = test_registry().router();

    let response = send(&app, Method::POST, "/v2/repo/blobs/uploads/", &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "0-0");
    let location = header_str(&response, "location").to_string();
    let uuid = header_str(&response, "docker-upload-uuid").to_string();
    assert!(location.ends_with(&uuid));

    let response = send(
        &app,
        Method::PATCH,
        &location,
        &[("content-range", "0-2")],
        "hel",
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header_str(&response, "range"), "0-2");

    // a chunk starting past the buffered length is refused
    let response = send(
        &app,
        Method::PATCH,
        &location,
        &[("content-range", "5-9")],
        "xxxxx",
    )
    .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_UNKNOWN");

    // the range must describe the chunk it arrives with
    let response = send(
        &app,
        Method::PATCH,
        &location,
        &[("content-range", "3-100")],
        "lo",
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_INVALID");

    let response = send(&app, Method::GET, &location, &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header_str(&response, "range"), "0-2");

    let response = send(
        &app,
        Method::PUT,
        &format!("{location}?digest={HELLO}"),
        &[],
        "lo",
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_str(&response, "docker-content-digest"), HELLO);

    let response = send(
        &app,
        Method::GET,
        &format!("/v2/repo/blobs/{HELLO}"),
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body_bytes(response).await[..], b"hello");

    // the session is gone once finalized
    let response = send(&app, Method::GET, &location, &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_finalize_mismatch_keeps_session() {
    let registry = test_registry();
    let app = registry.router();
    let location = "/v2/repo/blobs/uploads/retry";

    let response = send(&app, Method::PATCH, location, &[], "hel").await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = send(
        &app,
        Method::PUT,
        &format!("{location}?digest={HELLO}"),
        &[],
        "p!",
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");
    assert_eq!(registry.blobs().status("repo", "retry").unwrap(), 3);

    let response = send(
        &app,
        Method::PUT,
        &format!("{location}?digest={HELLO}"),
        &[],
        "lo",
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_upload_errors() {
    let app = test_registry().router();
    let location = "/v2/repo/blobs/uploads/abc";

    let response = send(&app, Method::PATCH, location, &[], "hel").await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // a second chunk needs a range
    let response = send(&app, Method::PATCH, location, &[], "lo").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_INVALID");

    // finalizing needs a digest
    let response = send(&app, Method::PUT, location, &[], "lo").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");

    // sessions do not cross repositories
    let response = send(
        &app,
        Method::GET,
        "/v2/other/blobs/uploads/abc",
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_UNKNOWN");

    let response = send(&app, Method::DELETE, location, &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = send(&app, Method::DELETE, location, &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_blob() {
    let app = test_registry().router();

    let response = send(
        &app,
        Method::GET,
        &format!("/v2/repo/blobs/{HELLO}"),
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UNKNOWN");
}

#[tokio::test]
async fn test_request_validation() {
    let app = test_registry().router();

    let response = send(
        &app,
        Method::GET,
        "/v2/a..b/blobs/sha256:abc",
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "NAME_INVALID");

    let response = send(&app, Method::GET, "/v2/repo/blobs/latest", &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");

    let response = send(
        &app,
        Method::DELETE,
        "/v2/repo/manifests/latest",
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(error_code(response).await, "METHOD_UNKNOWN");
}

#[tokio::test]
async fn test_body_limit() {
    let app = RegistryBuilder::new()
        .client(MockService::new().into_client())
        .body_limit(Some(4))
        .build()
        .router();

    let response = send(
        &app,
        Method::POST,
        &format!("/v2/repo/blobs/uploads/?digest={HELLO}"),
        &[],
        "hello",
    )
    .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

fn image_manifest(layers: &[&str]) -> Vec<u8> {
    let layers: Vec<_> = layers
        .iter()
        .map(|digest| {
            serde_json::json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "size": 5,
                "digest": digest,
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "size": 2,
            "digest": digest::sha256(b"{}"),
        },
        "layers": layers,
    }))
    .unwrap()
}

#[tokio::test]
async fn test_manifest_upload_and_download() {
    let app = test_registry().router();
    let manifest = image_manifest(&[HELLO]);

    let response = send(
        &app,
        Method::PUT,
        "/v2/test-repo/manifests/latest",
        &[(
            "content-type",
            "application/vnd.oci.image.manifest.v1+json",
        )],
        manifest.clone(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let digest = header_str(&response, "docker-content-digest").to_string();
    assert_eq!(digest, digest::sha256(&manifest));

    for reference in ["latest", digest.as_str()] {
        let response = send(
            &app,
            Method::GET,
            &format!("/v2/test-repo/manifests/{reference}"),
            &[],
            Body::empty(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            header_str(&response, "content-type"),
            "application/vnd.oci.image.manifest.v1+json"
        );
        assert_eq!(&body_bytes(response).await[..], &manifest[..]);
    }

    let response = send(
        &app,
        Method::HEAD,
        "/v2/test-repo/manifests/latest",
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "content-length"), manifest.len().to_string());
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn test_index_requires_children() {
    let app = test_registry().router();
    let child = image_manifest(&[]);
    let child_digest = digest::sha256(&child);
    let missing = digest::sha256(b"absent");

    let index = |children: &[&str]| {
        let manifests: Vec<_> = children
            .iter()
            .map(|digest| serde_json::json!({"digest": digest, "size": 1}))
            .collect();
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": manifests,
        }))
        .unwrap()
    };
    let index_type = ("content-type", "application/vnd.oci.image.index.v1+json");

    let response = send(
        &app,
        Method::PUT,
        &format!("/v2/repo/manifests/{child_digest}"),
        &[],
        child,
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(
        &app,
        Method::PUT,
        "/v2/repo/manifests/multi",
        &[index_type],
        index(&[&child_digest, &missing]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["code"], "MANIFEST_UNKNOWN");
    assert!(body["message"].as_str().unwrap().contains(&missing));

    let response = send(&app, Method::GET, "/v2/repo/manifests/multi", &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(
        &app,
        Method::PUT,
        "/v2/repo/manifests/multi",
        &[index_type],
        index(&[&child_digest]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

struct Linked {
    registry: Registry,
    mock: MockService,
    layer: String,
    manifest: Vec<u8>,
    _links: tempfile::TempDir,
}

/// Link files for `library/app`: `v1` is `bafyapp`, `v2` is `bafyother`.
async fn link_files() -> (tempfile::TempDir, Utf8PathBuf) {
    let links = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(links.path().to_path_buf()).unwrap();
    tokio::fs::create_dir_all(root.join("library/app")).await.unwrap();
    tokio::fs::write(root.join("library/app/@v1"), "bafyapp\n")
        .await
        .unwrap();
    tokio::fs::write(root.join("library/app/@v2"), "bafyother\n")
        .await
        .unwrap();
    (links, root)
}

/// A registry whose file resolver knows `library/app:v1` as `bafyapp`, with
/// the gateway serving its manifest and one layer.
async fn linked_registry() -> Linked {
    linked_registry_with(RegistryBuilder::new()).await
}

async fn linked_registry_with(builder: RegistryBuilder) -> Linked {
    let (links, root) = link_files().await;

    let layer = digest::sha256(b"layer");
    let manifest = image_manifest(&[&layer]);

    let mut mock = MockService::new();
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "application/octet-stream".parse().unwrap());
    mock.add(
        "/ipfs/bafyapp/manifests/v1",
        StatusCode::OK,
        HeaderMap::new(),
        manifest.clone(),
    );
    mock.add(
        &format!("/ipfs/bafyapp/blobs/{layer}"),
        StatusCode::OK,
        headers,
        &b"layer"[..],
    );

    let registry = builder
        .gateway("http://gateway.test/ipfs/".parse().unwrap())
        .client(mock.clone().into_client())
        .resolver(FileResolver::new(root))
        .build();

    Linked {
        registry,
        mock,
        layer,
        manifest,
        _links: links,
    }
}

#[tokio::test]
async fn test_pull_through_gateway() {
    let linked = linked_registry().await;
    let app = linked.registry.router();

    let response = send(
        &app,
        Method::GET,
        "/v2/library/app/manifests/v1",
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "x-docker-content-id"), "bafyapp");
    assert_eq!(
        header_str(&response, "docker-content-digest"),
        digest::sha256(&linked.manifest)
    );
    assert_eq!(&body_bytes(response).await[..], &linked.manifest[..]);

    // layers were linked to the image while pulling the manifest
    assert_eq!(
        linked
            .registry
            .links()
            .get("library/app", &linked.layer)
            .await
            .as_deref(),
        Some("bafyapp")
    );

    let response = send(
        &app,
        Method::GET,
        &format!("/v2/library/app/blobs/{}", linked.layer),
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "x-docker-content-id"), "bafyapp");
    assert_eq!(header_str(&response, "content-length"), "5");
    assert_eq!(&body_bytes(response).await[..], b"layer");

    // the second pull is served from the manifest cache
    let response = send(
        &app,
        Method::HEAD,
        "/v2/library/app/manifests/v1",
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let manifest_fetches = linked
        .mock
        .requests()
        .into_iter()
        .filter(|(_, path)| path == "/ipfs/bafyapp/manifests/v1")
        .count();
    assert_eq!(manifest_fetches, 1);
}

#[tokio::test]
async fn test_missing_remote_content() {
    let linked = linked_registry().await;
    let app = linked.registry.router();

    // resolvable, but the gateway has nothing there
    let response = send(
        &app,
        Method::GET,
        "/v2/library/app/manifests/v2",
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "MANIFEST_UNKNOWN");

    linked
        .registry
        .links()
        .add("library/app", HELLO, "bafyapp")
        .await
        .unwrap();
    let response = send(
        &app,
        Method::HEAD,
        &format!("/v2/library/app/blobs/{HELLO}"),
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // not resolvable at all
    let response = send(
        &app,
        Method::GET,
        "/v2/library/app/manifests/v9",
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "MANIFEST_UNKNOWN");
}

#[tokio::test]
async fn test_unwritable_link_store() {
    // the side store root is a regular file, so no link can be persisted
    let blocker = tempfile::NamedTempFile::new().unwrap();
    let blocked = Utf8PathBuf::from_path_buf(blocker.path().to_path_buf()).unwrap();
    let linked = linked_registry_with(RegistryBuilder::new().links(blocked.clone())).await;
    let app = linked.registry.router();

    let response = send(
        &app,
        Method::GET,
        "/v2/library/app/manifests/v1",
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body_bytes(response).await[..], &linked.manifest[..]);

    // links are still remembered in memory
    assert_eq!(
        linked.registry.links().get("library/app", "v1").await.as_deref(),
        Some("bafyapp")
    );
    assert_eq!(
        linked
            .registry
            .links()
            .get("library/app", &linked.layer)
            .await
            .as_deref(),
        Some("bafyapp")
    );
    assert!(blocked.is_file());

    let response = send(
        &app,
        Method::GET,
        &format!("/v2/library/app/blobs/{}", linked.layer),
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_gateway_timeout() {
    let (_links, root) = link_files().await;
    let stalled = StalledService::new();
    let registry = RegistryBuilder::new()
        .gateway("http://gateway.test/ipfs/".parse().unwrap())
        .client(stalled.clone().into_client())
        .fetch_timeout(Duration::from_millis(10))
        .resolver(FileResolver::new(root))
        .build();
    let app = registry.router();

    let response = send(
        &app,
        Method::GET,
        "/v2/library/app/manifests/v1",
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(error_code(response).await, "UNKNOWN");
    assert_eq!(stalled.requests(), 1);
    assert!(!registry.manifests().contains("library/app", "v1"));
}

#[tokio::test]
async fn test_dig() {
    let linked = linked_registry().await;
    let app = linked.registry.router();

    let response = send(&app, Method::GET, "/dig?q=library/app", &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body_bytes(response).await[..], b"bafyapp\nbafyother\n");

    let response = send(
        &app,
        Method::GET,
        "/dig?q=library/app:v1&short=true",
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(&body_bytes(response).await[..], b"bafyapp\n");

    let response = send(&app, Method::GET, "/dig?q=library/app:v1", &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body_bytes(response).await[..], &linked.manifest[..]);

    // dig does not populate the caches
    assert!(!linked.registry.manifests().contains("library/app", "v1"));

    let response = send(&app, Method::GET, "/dig?q=library/none", &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "NAME_UNKNOWN");
}
