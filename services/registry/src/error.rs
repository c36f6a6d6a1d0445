//! Error types for the registry

use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::fetch::FetchError;
use crate::links::LinkError;
use crate::resolver::ResolveError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// No resolver knows the repository
    #[error("repository unknown: {0}")]
    RepositoryUnknown(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Digest mismatch
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },

    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Manifest not found
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Blob upload invalid
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// Blob upload unknown
    #[error("blob upload unknown: {0}")]
    BlobUploadUnknown(String),

    /// A chunk did not start where the upload left off
    #[error("range not satisfiable: upload holds {length} bytes, chunk starts at {start}")]
    RangeNotSatisfiable {
        /// Bytes currently buffered in the session
        length: u64,
        /// Declared start of the rejected chunk
        start: u64,
    },

    /// Method not supported on this route
    #[error("method not allowed: {0}")]
    MethodUnknown(Method),

    /// The gateway could not be reached
    #[error(transparent)]
    Gateway(#[from] FetchError),

    /// The link side store could not be written
    #[error(transparent)]
    Links(#[from] LinkError),
}

impl From<ResolveError> for RegistryError {
    fn from(error: ResolveError) -> Self {
        RegistryError::RepositoryUnknown(error.to_string())
    }
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BlobNotFound(_)
            | RegistryError::ManifestNotFound(_)
            | RegistryError::RepositoryUnknown(_)
            | RegistryError::BlobUploadUnknown(_) => StatusCode::NOT_FOUND,
            RegistryError::InvalidDigest(_)
            | RegistryError::InvalidManifest(_)
            | RegistryError::InvalidRepository(_)
            | RegistryError::DigestMismatch { .. }
            | RegistryError::BlobUploadInvalid(_) => StatusCode::BAD_REQUEST,
            RegistryError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            RegistryError::MethodUnknown(_) => StatusCode::METHOD_NOT_ALLOWED,
            RegistryError::Gateway(_) => StatusCode::BAD_GATEWAY,
            RegistryError::Links(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::InvalidRepository(_) => "NAME_INVALID",
            RegistryError::RepositoryUnknown(_) => "NAME_UNKNOWN",
            RegistryError::InvalidDigest(_) | RegistryError::DigestMismatch { .. } => {
                "DIGEST_INVALID"
            }
            RegistryError::BlobNotFound(_) => "BLOB_UNKNOWN",
            RegistryError::ManifestNotFound(_) => "MANIFEST_UNKNOWN",
            RegistryError::InvalidManifest(_) => "MANIFEST_INVALID",
            RegistryError::BlobUploadInvalid(_) => "BLOB_UPLOAD_INVALID",
            RegistryError::BlobUploadUnknown(_) | RegistryError::RangeNotSatisfiable { .. } => {
                "BLOB_UPLOAD_UNKNOWN"
            }
            RegistryError::MethodUnknown(_) => "METHOD_UNKNOWN",
            RegistryError::Gateway(_) | RegistryError::Links(_) => "UNKNOWN",
        }
    }
}

/// Error response body.
///
/// Carries the flat `code`/`status`/`message` triple, plus the `errors`
/// array which OCI clients look for.
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    code: &'static str,
    status: u16,
    message: String,
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        let body = ErrorResponse {
            code,
            status: status.as_u16(),
            errors: vec![ErrorDetail {
                code,
                message: message.clone(),
            }],
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}
