//! SQLite-backed persistence over a versioned key-value table.
//!
//! Records and indexes are rows of one `kv` table keyed by their encoded
//! [`PersistenceKey`]. Index rows are updated by compare-and-swap (see
//! [`index`]), so concurrent writers never lose each other's members. Reads
//! skip expired rows; dangling or unreadable members met while reading are
//! removed from their index. [`SqlitePersistence::purge_expired`] physically
//! deletes expired rows.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt, future, stream};

use super::{Persistence, PersistenceFactory, RecordStream, failed_stream, new_record, now_millis};
use crate::Error;
use crate::expiry::MAX_TTL;
use crate::key::{DEFAULT_NAMESPACE, PersistenceKey};
use crate::record::{Codec, PlainReqRes, PlainRequest, PlainResponse};

pub mod connection;
pub mod index;
pub mod kv;
pub mod migrations;

pub use connection::KvDb;
pub use index::IndexMember;
pub use kv::{AtomicWrite, KvEntry};

/// [`Persistence`] on an embedded SQLite database.
#[derive(Debug)]
pub struct SqlitePersistence {
    db: KvDb,
    namespace: String,
    max_ttl: Duration,
    codec: Codec,
    disposed: AtomicBool,
}

impl SqlitePersistence {
    pub fn new(db: KvDb, namespace: &str, max_ttl: Duration, codec: Codec) -> Self {
        Self { db, namespace: namespace.to_string(), max_ttl, codec, disposed: AtomicBool::new(false) }
    }

    /// Open (or create) a database file with default settings.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Ok(Self::new(KvDb::open(path).await?, DEFAULT_NAMESPACE, MAX_TTL, Codec::default()))
    }

    /// Private in-memory database with default settings.
    pub async fn open_in_memory() -> Result<Self, Error> {
        Ok(Self::new(KvDb::open_in_memory().await?, DEFAULT_NAMESPACE, MAX_TTL, Codec::default()))
    }

    pub fn db(&self) -> &KvDb {
        &self.db
    }

    /// Physically delete every expired row. Returns the number of rows removed.
    pub async fn purge_expired(&self) -> Result<u64, Error> {
        let purged = self.db.purge_expired(now_millis()).await?;
        tracing::debug!(purged, "purged expired rows");
        Ok(purged)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed("sqlite persistence".into()));
        }
        Ok(())
    }

    /// Stream the members' records, dropping members whose record is gone or unreadable.
    fn stream_members(db: KvDb, codec: Codec, members: Vec<(String, IndexMember)>) -> RecordStream {
        stream::iter(members)
            .then(move |(index_key, member)| {
                let db = db.clone();
                async move { fetch_member(&db, codec, &index_key, &member).await }
            })
            .try_filter_map(future::ok)
            .boxed()
    }
}

async fn fetch_member(db: &KvDb, codec: Codec, index_key: &str, member: &IndexMember) -> Result<Option<PlainReqRes>, Error> {
    let now = now_millis();
    if member.expires <= now {
        return Ok(None);
    }

    let record = match db.get(&member.key, now).await? {
        Some(entry) => match codec.decode(&entry.value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(key = %member.key, error = %e, "dropping unreadable record");
                None
            }
        },
        None => None,
    };

    match record {
        Some(record) if record.is_expired(now) => Ok(None),
        Some(record) => Ok(Some(record)),
        None => {
            let reaped = index::remove(db, index_key, |m| m.key == member.key, now).await?;
            tracing::debug!(key = %member.key, reaped, "removed dangling index member");
            Ok(None)
        }
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn keys(&self) -> Result<Vec<String>, Error> {
        let prefix = format!("{}:", self.namespace);
        let keys = self.db.scan_keys(&prefix, now_millis()).await?;
        let names: BTreeSet<String> = keys
            .iter()
            .filter_map(|k| PersistenceKey::decode(k))
            .filter(PersistenceKey::is_index)
            .map(|k| k.cache_name().to_string())
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn put(&self, cache_name: &str, request: &PlainRequest, response: &PlainResponse) -> Result<bool, Error> {
        self.ensure_open()?;
        let Some(new) = new_record(request, response, self.max_ttl) else {
            tracing::debug!(cache = cache_name, url = %request.url, "refusing to store stale response");
            return Ok(false);
        };
        let key = PersistenceKey::for_record(&self.namespace, cache_name, &new.record)?;
        let member = IndexMember { key: key.encode(), created: new.created, expires: new.expires_at() };
        let blob = self.codec.encode(&new.record)?;

        index::insert(&self.db, &key.index_key().encode(), member, blob, now_millis()).await?;
        tracing::debug!(cache = cache_name, key = %key, ttl_ms = new.ttl.as_millis() as u64, "stored record");
        Ok(true)
    }

    async fn delete(&self, cache_name: &str, request: &PlainRequest, record_id: Option<&str>) -> Result<bool, Error> {
        self.ensure_open()?;
        let index_key = PersistenceKey::index(&self.namespace, cache_name, &request.url)?;
        let encoded = index_key.encode();

        let removed = match record_id {
            Some(id) => {
                let target = index_key.with_id(id).encode();
                index::remove(&self.db, &encoded, |m| m.key == target, now_millis()).await?
            }
            None => index::remove(&self.db, &encoded, |_| true, now_millis()).await?,
        };

        tracing::debug!(cache = cache_name, url = %request.url, removed, "deleted records");
        Ok(removed > 0)
    }

    fn get(&self, cache_name: &str, request: &PlainRequest) -> RecordStream {
        let index_key = match PersistenceKey::index(&self.namespace, cache_name, &request.url) {
            Ok(key) => key.encode(),
            Err(e) => return failed_stream(e),
        };
        let db = self.db.clone();
        let codec = self.codec;

        stream::once(async move {
            let index = index::load(&db, &index_key, now_millis()).await?;
            let members = index.live(now_millis()).into_iter().rev().map(|m| (index_key.clone(), m)).collect();
            Ok::<_, Error>(Self::stream_members(db, codec, members))
        })
        .try_flatten()
        .boxed()
    }

    fn iter(&self, cache_name: &str) -> RecordStream {
        let prefix = PersistenceKey::cache_prefix(&self.namespace, cache_name);
        let db = self.db.clone();
        let codec = self.codec;

        stream::once(async move {
            let now = now_millis();
            let mut members = Vec::new();
            for key in db.scan_keys(&prefix, now).await? {
                if !PersistenceKey::decode(&key).is_some_and(|k| k.is_index()) {
                    continue;
                }
                let index = index::load(&db, &key, now).await?;
                members.extend(index.live(now).into_iter().map(|m| (key.clone(), m)));
            }
            members.sort_by_key(|(_, m)| m.created);
            Ok::<_, Error>(Self::stream_members(db, codec, members))
        })
        .try_flatten()
        .boxed()
    }

    async fn dispose(&self) -> Result<(), Error> {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            tracing::debug!(namespace = %self.namespace, "sqlite persistence disposed");
        }
        Ok(())
    }
}

/// Hands out [`SqlitePersistence`] handles sharing one database connection.
#[derive(Debug, Clone)]
pub struct SqliteFactory {
    db: KvDb,
    namespace: String,
    max_ttl: Duration,
    codec: Codec,
}

impl SqliteFactory {
    pub fn new(db: KvDb, namespace: &str, max_ttl: Duration, codec: Codec) -> Self {
        Self { db, namespace: namespace.to_string(), max_ttl, codec }
    }

    pub async fn open(path: impl AsRef<Path>, namespace: &str, max_ttl: Duration, codec: Codec) -> Result<Self, Error> {
        Ok(Self::new(KvDb::open(path).await?, namespace, max_ttl, codec))
    }

    pub async fn open_in_memory() -> Result<Self, Error> {
        Ok(Self::new(KvDb::open_in_memory().await?, DEFAULT_NAMESPACE, MAX_TTL, Codec::default()))
    }
}

#[async_trait]
impl PersistenceFactory for SqliteFactory {
    async fn create(&self, _cache_name: &str) -> Result<Arc<dyn Persistence>, Error> {
        Ok(Arc::new(SqlitePersistence::new(self.db.clone(), &self.namespace, self.max_ttl, self.codec)))
    }
}
