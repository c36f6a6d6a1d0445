use std::error::Error as StdError;
use std::fmt;

use tracing_error::SpanTrace;

/// Categorizes backend errors by their semantic meaning, independent of
/// the backend implementation which produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The requested identifier (or a path beneath it) does not exist.
    ///
    /// **Retryable:** No - the content isn't there.
    NotFound,

    /// The backend could not be reached, or the transfer failed midway.
    ///
    /// **Retryable:** Maybe - depends on whether the I/O issue is transient.
    Io,

    /// The backend is reachable but reported a server-side failure.
    ///
    /// **Retryable:** Yes - the service should recover.
    ServiceUnavailable,

    /// The backend did not answer within the configured deadline.
    ///
    /// **Retryable:** Yes.
    Timeout,

    /// The request was malformed (bad identifier, bad URI).
    ///
    /// **Retryable:** No - the request itself is invalid.
    InvalidRequest,

    /// The backend answered with a document we could not decode.
    ///
    /// **Retryable:** No - indicates a protocol mismatch.
    SerializationError,

    /// An unexpected or uncategorized error occurred.
    Other,
}

impl StorageErrorKind {
    /// Returns whether this error kind typically indicates a retryable condition.
    ///
    /// This is advisory only: nothing in this workspace retries automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::ServiceUnavailable | StorageErrorKind::Timeout | StorageErrorKind::Io
        )
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::ServiceUnavailable => write!(f, "service unavailable"),
            StorageErrorKind::Timeout => write!(f, "timed out"),
            StorageErrorKind::InvalidRequest => write!(f, "invalid request"),
            StorageErrorKind::SerializationError => write!(f, "serialization error"),
            StorageErrorKind::Other => write!(f, "other error"),
        }
    }
}

/// Error produced by a storage backend.
///
/// Carries:
/// - **Semantic categorization** via [`StorageErrorKind`]
/// - **Operation context** (engine and the identifier being addressed)
/// - **Error chain preservation** via `Box<dyn Error + Send + Sync>`
/// - **Spantrace support** via `tracing_error::SpanTrace`
///
/// # Example
///
/// ```rust
/// use storage::{StorageError, StorageErrorKind};
///
/// let error = StorageError::new(
///     "memory",
///     StorageErrorKind::NotFound,
///     std::io::Error::new(std::io::ErrorKind::NotFound, "no such node"),
/// )
/// .with_identifier("bafy/manifests/latest");
///
/// assert!(error.is_not_found());
/// assert_eq!(error.identifier(), Some("bafy/manifests/latest"));
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    identifier: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    span_trace: Box<SpanTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a new storage error.
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            kind,
            engine,
            identifier: None,
            source: error.into(),
            span_trace: Box::new(SpanTrace::capture()),
        }
    }

    /// Returns a boxed closure that creates a storage error from a downstream error.
    ///
    /// Useful with `.map_err()`:
    ///
    /// ```rust
    /// use storage::{StorageError, StorageErrorKind};
    ///
    /// fn parse(input: &str) -> Result<u64, StorageError> {
    ///     input
    ///         .parse::<u64>()
    ///         .map_err(StorageError::with("http", StorageErrorKind::SerializationError))
    /// }
    ///
    /// assert!(parse("twelve").is_err());
    /// ```
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> Box<dyn FnOnce(E) -> StorageError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| StorageError::new(engine, kind, error))
    }

    /// Attach the identifier (or identifier path) the failed operation addressed.
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Returns the storage engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the identifier, if available.
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// Whether the backend reported the content as missing.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// Returns whether this error is likely retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns the span trace captured when this error was created.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(identifier) = &self.identifier {
            write!(f, " (identifier: {})", identifier)?;
        }

        write!(f, ": {}", self.source)
    }
}
