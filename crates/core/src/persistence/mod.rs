//! Persistence backend contract.
//!
//! A backend stores [`PlainReqRes`] records under record keys and keeps, for
//! every index key, the ordered set of record keys belonging to it. All
//! backends must behave identically:
//!
//! - `put` refuses stale responses (TTL of zero) by returning `false`;
//!   otherwise the record blob and its index entry are written atomically and
//!   the index outlives every member.
//! - `delete` without a record id removes every record of the request's index;
//!   with an id it removes only that record. Empty indexes are removed.
//! - `get` yields the records of one index newest-first; `iter` yields every
//!   record of a cache oldest-first. Neither ever yields an expired record.
//! - `dispose` releases pooled connections and timers but keeps the data.
//!
//! Records that are missing or fail to parse are treated as absent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, stream};
use uuid::Uuid;

use crate::Error;
use crate::expiry;
use crate::record::{Created, PlainReqRes, PlainReqResMeta, PlainRequest, PlainResponse};

pub mod memory;
pub mod sqlite;

#[cfg(test)]
pub(crate) mod conformance;

pub use memory::{MemoryFactory, MemoryPersistence};
pub use sqlite::{SqliteFactory, SqlitePersistence};

/// Finite, pull-based sequence of stored records. Not restartable: call the
/// producing method again to re-read.
pub type RecordStream = BoxStream<'static, Result<PlainReqRes, Error>>;

/// Storage capability consumed by [`Cache`](crate::Cache).
#[async_trait]
pub trait Persistence: Send + Sync + std::fmt::Debug {
    /// First part of every key this backend writes.
    fn namespace(&self) -> &str;

    /// Names of caches currently holding at least one record.
    async fn keys(&self) -> Result<Vec<String>, Error>;

    /// Store a response for `request`. Returns `false` when the response is already stale.
    async fn put(&self, cache_name: &str, request: &PlainRequest, response: &PlainResponse) -> Result<bool, Error>;

    /// Delete one record (`record_id`) or every record stored for `request`.
    async fn delete(&self, cache_name: &str, request: &PlainRequest, record_id: Option<&str>) -> Result<bool, Error>;

    /// Records stored for `request`, newest first.
    fn get(&self, cache_name: &str, request: &PlainRequest) -> RecordStream;

    /// Every record of the cache, oldest first.
    fn iter(&self, cache_name: &str) -> RecordStream;

    /// Release pooled resources. Stored data is kept.
    async fn dispose(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Creates backend instances for [`CacheStorage`](crate::CacheStorage).
#[async_trait]
pub trait PersistenceFactory: Send + Sync {
    async fn create(&self, cache_name: &str) -> Result<Arc<dyn Persistence>, Error>;

    /// Cache names known to the backend, including ones created elsewhere.
    async fn discover(&self) -> Result<Vec<String>, Error> {
        let handle = self.create("").await?;
        let names = handle.keys().await;
        handle.dispose().await?;
        names
    }
}

/// A record ready to be written, with its time-to-live.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub record: PlainReqRes,
    pub created: Created,
    pub ttl: Duration,
}

impl NewRecord {
    /// Epoch milliseconds at which the record expires.
    pub fn expires_at(&self) -> i64 {
        self.created.millis + ttl_millis(self.ttl)
    }
}

/// Assign id, creation stamp and expiry to a request/response pair.
///
/// Returns `None` when the response is already stale.
pub fn new_record(request: &PlainRequest, response: &PlainResponse, max_ttl: Duration) -> Option<NewRecord> {
    let ttl = expiry::expires_in(&response.headers, chrono::Utc::now(), max_ttl);
    if ttl.is_zero() {
        return None;
    }
    let created = Created::now();
    let meta = PlainReqResMeta {
        id: Uuid::now_v7().simple().to_string(),
        expires: (created.millis + ttl_millis(ttl)).to_string(),
        created: created.to_string(),
    };
    Some(NewRecord { record: PlainReqRes::new(request.clone(), response.clone(), meta), created, ttl })
}

pub fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A stream holding a single error, for failures detected before any I/O.
pub fn failed_stream(err: Error) -> RecordStream {
    stream::once(async move { Err(err) }).boxed()
}
