//! Error types for the Redis backend.

use deadpool_redis::{CreatePoolError, PoolError, redis};
use thiserror::Error;

/// Failures talking to Redis.
///
/// Surfaced to cache callers as [`webcache_core::Error::Backend`].
#[derive(Debug, Error)]
pub enum RedisError {
    #[error("failed to build connection pool: {0}")]
    CreatePool(#[from] CreatePoolError),

    #[error("connection pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("redis command failed: {0}")]
    Command(#[from] redis::RedisError),

    #[error("redis persistence for namespace {0} is disposed")]
    Disposed(String),
}

impl From<RedisError> for webcache_core::Error {
    fn from(err: RedisError) -> Self {
        match err {
            RedisError::Disposed(what) => webcache_core::Error::Disposed(what),
            other => webcache_core::Error::backend(other),
        }
    }
}
