//! Unified error types for webcache.
//!
//! Validation failures raised by `Cache::put` each get their own variant so
//! callers can tell them apart. Not-found outcomes are never errors: they are
//! reported as `false`, `None` or an empty list.

use tokio_rusqlite::rusqlite;

/// Unified error type shared by the cache engine and its persistence backends.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request URL could not be parsed.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// Only `http` and `https` requests can be cached.
    #[error("INVALID_SCHEME: {0}")]
    InvalidScheme(String),

    /// Only `GET` requests can be cached.
    #[error("INVALID_METHOD: {0}")]
    InvalidMethod(String),

    /// Partial content responses cannot be cached.
    #[error("PARTIAL_CONTENT: 206 responses cannot be cached")]
    PartialContent,

    /// Responses varying on every header cannot be matched.
    #[error("VARY_WILDCARD: responses with `Vary: *` cannot be cached")]
    VaryWildcard,

    /// The response body was read before it reached the cache.
    #[error("BODY_USED: response body has already been consumed")]
    BodyUsed,

    /// A fetched response did not have a 2xx status.
    #[error("BAD_RESPONSE: {0}")]
    BadResponse(String),

    /// The fetcher failed to produce a response.
    #[error("FETCH_FAILED: {0}")]
    Fetch(String),

    /// Database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("CACHE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// A stored record could not be serialized or parsed.
    #[error("CODEC_ERROR: {0}")]
    Codec(String),

    /// An index update kept losing its compare-and-swap race.
    #[error("CONFLICT: index {0} changed concurrently")]
    Conflict(String),

    /// Failure reported by an out-of-crate backend (e.g. Redis).
    #[error("BACKEND_ERROR: {0}")]
    Backend(Box<dyn std::error::Error + Send + Sync>),

    /// The cache or backend was already disposed.
    #[error("DISPOSED: {0}")]
    Disposed(String),

    /// The operation queue stopped before the operation completed.
    #[error("QUEUE_CLOSED")]
    QueueClosed,
}

impl Error {
    /// Wrap a backend-specific failure.
    pub fn backend(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Backend(err.into())
    }

    /// True for the put-time validation failures.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidUrl(_)
                | Error::InvalidScheme(_)
                | Error::InvalidMethod(_)
                | Error::PartialContent
                | Error::VaryWildcard
                | Error::BodyUsed
        )
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Codec(err.to_string())
    }
}
