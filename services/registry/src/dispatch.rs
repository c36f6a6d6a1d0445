//! Request routing for `/v2/*` paths and the resolution debug endpoint.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;

use crate::api::Registry;
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::{self, Manifest};
use crate::{blob, digest};

/// What a `/v2/` path addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route<'a> {
    Manifest {
        repository: &'a str,
        reference: &'a str,
    },
    Blob {
        repository: &'a str,
        digest: &'a str,
    },
    UploadStart {
        repository: &'a str,
    },
    Upload {
        repository: &'a str,
        id: &'a str,
    },
}

/// Split `name/.../{blobs,manifests}/...` into its route.
///
/// Repository names may contain `/`, so the last marker segment wins.
pub(crate) fn classify(path: &str) -> Option<Route<'_>> {
    let path = path.trim_start_matches('/');

    if let Some((repository, rest)) = path.rsplit_once("/blobs/uploads") {
        if rest.is_empty() || rest == "/" {
            return Some(Route::UploadStart { repository });
        }
        if let Some(id) = rest.strip_prefix('/') {
            let id = id.trim_end_matches('/');
            if !id.is_empty() && !id.contains('/') {
                return Some(Route::Upload { repository, id });
            }
        }
    }

    if let Some((repository, reference)) = path.rsplit_once("/manifests/") {
        if !reference.is_empty() && !reference.contains('/') {
            return Some(Route::Manifest {
                repository,
                reference,
            });
        }
    }

    if let Some((repository, digest)) = path.rsplit_once("/blobs/") {
        if !digest.is_empty() && !digest.contains('/') {
            return Some(Route::Blob { repository, digest });
        }
    }

    None
}

/// Validate repository name
fn validate_repository(name: &str) -> RegistryResult<()> {
    if name.is_empty() || name.contains("..") {
        return Err(RegistryError::InvalidRepository(name.to_string()));
    }
    Ok(())
}

fn validate_reference(reference: &str) -> RegistryResult<()> {
    if reference.contains(':') {
        digest::validate(reference)
    } else if reference.is_empty() {
        Err(RegistryError::ManifestNotFound(reference.to_string()))
    } else {
        Ok(())
    }
}

/// Query parameters of upload requests.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct UploadQuery {
    digest: Option<String>,
}

async fn route(
    registry: &Registry,
    method: Method,
    path: &str,
    expected: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let route = classify(path).ok_or_else(|| RegistryError::RepositoryUnknown(path.to_string()))?;

    match route {
        Route::Manifest {
            repository,
            reference,
        } => {
            validate_repository(repository)?;
            validate_reference(reference)?;
            match method {
                Method::GET | Method::HEAD => {
                    manifest::fetch(registry, method, repository, reference).await
                }
                Method::PUT => manifest::store(registry, repository, reference, headers, body),
                other => Err(RegistryError::MethodUnknown(other)),
            }
        }
        Route::Blob {
            repository,
            digest,
        } => {
            validate_repository(repository)?;
            digest::validate(digest)?;
            match method {
                Method::GET | Method::HEAD => blob::fetch(registry, method, repository, digest).await,
                other => Err(RegistryError::MethodUnknown(other)),
            }
        }
        Route::UploadStart { repository } => {
            validate_repository(repository)?;
            match method {
                Method::POST => blob::initiate(registry, repository, expected, body),
                other => Err(RegistryError::MethodUnknown(other)),
            }
        }
        Route::Upload { repository, id } => {
            validate_repository(repository)?;
            match method {
                Method::PATCH => blob::patch(registry, repository, id, headers, body),
                Method::PUT => blob::put(registry, repository, id, expected, body),
                Method::GET => blob::status(registry, repository, id),
                Method::DELETE => blob::cancel(registry, repository, id),
                other => Err(RegistryError::MethodUnknown(other)),
            }
        }
    }
}

/// Handle any request beneath `/v2/`.
pub(crate) async fn dispatch(
    State(registry): State<Registry>,
    method: Method,
    Path(path): Path<String>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_method = method.clone();
    match route(&registry, method, &path, query.digest.as_deref(), &headers, body).await {
        Ok(response) => {
            tracing::debug!(method = %request_method, %path, status = %response.status(), "handled");
            response
        }
        Err(error) => {
            let status = error.status_code();
            if status.is_server_error() {
                tracing::error!(method = %request_method, %path, %status, %error, "request failed");
            } else {
                tracing::info!(method = %request_method, %path, %status, %error, "request rejected");
            }
            error.into_response()
        }
    }
}

/// Query parameters of the debug endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct DigQuery {
    /// `repository` or `repository:reference`.
    q: String,

    /// Print identifiers rather than manifest bytes.
    #[serde(default)]
    short: bool,
}

/// Run the resolver chain directly.
///
/// Lists identifiers when `short` is set or no reference is given, otherwise
/// fetches the manifest from the first identifier. Nothing is cached.
pub(crate) async fn dig(
    State(registry): State<Registry>,
    Query(query): Query<DigQuery>,
) -> RegistryResult<Response> {
    let (repository, reference) = query.q.split_once(':').unwrap_or((query.q.as_str(), ""));
    validate_repository(repository)?;
    tracing::debug!(%repository, %reference, short = query.short, "dig");

    let identifiers = registry.resolver.resolve(repository, reference).await?;
    if query.short || reference.is_empty() {
        let mut listing = identifiers.join("\n");
        listing.push('\n');
        return Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], listing).into_response());
    }

    let identifier = identifiers
        .into_iter()
        .next()
        .ok_or_else(|| RegistryError::RepositoryUnknown(query.q.clone()))?;
    let body = registry
        .gateway
        .get(&identifier, &format!("manifests/{reference}"))
        .await?;
    let manifest = Manifest::new(body, None, Some(identifier));
    Ok(manifest::respond(&Method::GET, &manifest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_paths() {
        assert_eq!(
            classify("library/nginx/manifests/latest"),
            Some(Route::Manifest {
                repository: "library/nginx",
                reference: "latest"
            })
        );
        assert_eq!(
            classify("library/nginx/blobs/sha256:abc"),
            Some(Route::Blob {
                repository: "library/nginx",
                digest: "sha256:abc"
            })
        );
        assert_eq!(
            classify("library/nginx/blobs/uploads/"),
            Some(Route::UploadStart {
                repository: "library/nginx"
            })
        );
        assert_eq!(
            classify("library/nginx/blobs/uploads"),
            Some(Route::UploadStart {
                repository: "library/nginx"
            })
        );
        assert_eq!(
            classify("app/blobs/uploads/1234"),
            Some(Route::Upload {
                repository: "app",
                id: "1234"
            })
        );
    }

    #[test]
    fn classify_uses_last_marker() {
        assert_eq!(
            classify("blobs/manifests/tools/blobs/sha256:abc"),
            Some(Route::Blob {
                repository: "blobs/manifests/tools",
                digest: "sha256:abc"
            })
        );
        assert_eq!(
            classify("app/blobs/uploadsx"),
            Some(Route::Blob {
                repository: "app",
                digest: "uploadsx"
            })
        );
    }

    #[test]
    fn classify_rejects_unknown_shapes() {
        assert_eq!(classify("app/tags/list"), None);
        assert_eq!(classify("app/manifests/"), None);
        assert_eq!(classify("app"), None);
    }

    #[test]
    fn repository_validation() {
        assert!(validate_repository("library/nginx").is_ok());
        assert!(validate_repository("").is_err());
        assert!(validate_repository("../etc").is_err());
    }

    #[test]
    fn reference_validation() {
        assert!(validate_reference("latest").is_ok());
        assert!(validate_reference("sha256:abc").is_ok());
        assert_eq!(
            validate_reference("sha256:").unwrap_err().error_code(),
            "DIGEST_INVALID"
        );
    }
}
