//! Core types and shared functionality for webcache.
//!
//! This crate provides:
//! - The `Cache` matching engine and the `CacheStorage` registry
//! - The persistence contract with volatile and SQLite backends
//! - Record codec, key derivation and expiration policy shared by backends
//! - Unified error types
//! - Configuration structures

pub mod cache;
pub mod config;
pub mod error;
pub mod expiry;
pub mod fetch;
pub mod key;
pub mod matching;
pub mod message;
pub mod persistence;
pub mod queue;
pub mod record;
pub mod storage;

pub use cache::Cache;
pub use config::{Backend, CacheConfig, ConfigError};
pub use error::Error;
pub use fetch::{FetchConfig, Fetcher, HttpFetcher};
pub use key::PersistenceKey;
pub use matching::{HeaderNormalizer, MatchOptions};
pub use message::{Body, IntoCacheRequest, ReasonPhrase, RecordId};
pub use persistence::{Persistence, PersistenceFactory, RecordStream};
pub use record::{Codec, PlainReqRes, PlainRequest, PlainResponse};
pub use storage::CacheStorage;
