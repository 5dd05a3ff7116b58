//! Redis persistence backend for webcache.
//!
//! Every record is a string key holding the encoded [`PlainReqRes`] with a
//! server-side TTL. Every index is a sorted set of record keys scored by
//! creation stamp; its expiry is extended to cover its longest-lived member.
//! Writes and deletes run as server-side scripts so blob and index change
//! together. Reads pull members in windows of `page_size` and fetch blobs with
//! one `MGET` per window; members whose blob is gone or unreadable are removed
//! from their index as they are met.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool, redis};
use futures_util::{StreamExt, TryStreamExt, stream};
use webcache_core::key::SEPARATOR;
use webcache_core::persistence::{failed_stream, new_record, now_millis, ttl_millis};
use webcache_core::{
    Backend, CacheConfig, CacheStorage, Codec, Error, Persistence, PersistenceFactory, PersistenceKey, PlainReqRes,
    PlainRequest, PlainResponse, RecordStream,
};

pub mod error;
pub mod pool;
mod scripts;

pub use error::RedisError;

/// Keys requested per `SCAN` round trip.
const SCAN_COUNT: usize = 200;

/// Per-instance settings shared with the streams an instance hands out.
#[derive(Debug, Clone)]
struct Settings {
    namespace: String,
    max_ttl: Duration,
    codec: Codec,
    page_size: usize,
}

impl Settings {
    fn from_config(config: &CacheConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            max_ttl: config.max_ttl(),
            codec: config.codec,
            page_size: config.page_size.max(1),
        }
    }
}

/// [`Persistence`] on a Redis server.
pub struct RedisPersistence {
    pool: Pool,
    settings: Settings,
    owns_pool: bool,
    disposed: AtomicBool,
}

impl std::fmt::Debug for RedisPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPersistence")
            .field("namespace", &self.settings.namespace)
            .field("page_size", &self.settings.page_size)
            .field("owns_pool", &self.owns_pool)
            .finish_non_exhaustive()
    }
}

impl RedisPersistence {
    /// Connect with a pool of its own, opening `pool_min` connections up front.
    ///
    /// The pool is closed by [`dispose`](Persistence::dispose).
    pub async fn connect(config: &CacheConfig) -> Result<Self, Error> {
        let pool = pool::build(config)?;
        pool::warm(&pool, config.pool_min).await?;
        Ok(Self::with_pool(pool, Settings::from_config(config), true))
    }

    fn with_pool(pool: Pool, settings: Settings, owns_pool: bool) -> Self {
        Self { pool, settings, owns_pool, disposed: AtomicBool::new(false) }
    }

    fn ensure_open(&self) -> Result<(), RedisError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(RedisError::Disposed(self.settings.namespace.clone()));
        }
        Ok(())
    }

    async fn connection(&self) -> Result<Connection, RedisError> {
        self.ensure_open()?;
        Ok(self.pool.get().await?)
    }
}

/// Escape glob metacharacters so `text` matches itself in `SCAN MATCH`.
fn glob_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Every sorted-set key matching `pattern`.
async fn scan_indexes(pool: &Pool, pattern: &str) -> Result<Vec<String>, RedisError> {
    let mut conn = pool.get().await?;
    let mut cursor: u64 = 0;
    let mut keys = BTreeSet::new();
    loop {
        let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .arg("TYPE")
            .arg("zset")
            .query_async(&mut conn)
            .await?;
        keys.extend(batch.into_iter().filter(|k| PersistenceKey::decode(k).is_some_and(|k| k.is_index())));
        if next == 0 {
            break;
        }
        cursor = next;
    }
    Ok(keys.into_iter().collect())
}

/// Up to `page` members of `index` with a score strictly below `max`, newest first.
async fn newest_members(pool: &Pool, index: &str, max: &str, page: usize) -> Result<Vec<(String, f64)>, RedisError> {
    let mut conn = pool.get().await?;
    let members = redis::cmd("ZREVRANGEBYSCORE")
        .arg(index)
        .arg(max)
        .arg("-inf")
        .arg("WITHSCORES")
        .arg("LIMIT")
        .arg(0)
        .arg(page)
        .query_async(&mut conn)
        .await?;
    Ok(members)
}

/// Every member of `index`, oldest first, pulled `page` at a time.
async fn all_members(pool: &Pool, index: &str, page: usize) -> Result<Vec<(String, f64)>, RedisError> {
    let mut members: Vec<(String, f64)> = Vec::new();
    let mut min = "-inf".to_string();
    loop {
        let mut conn = pool.get().await?;
        let window: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(index)
            .arg(&min)
            .arg("+inf")
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(page)
            .query_async(&mut conn)
            .await?;
        let full = window.len() == page;
        if let Some((_, last)) = window.last() {
            min = format!("({last}");
        }
        members.extend(window);
        if !full {
            return Ok(members);
        }
    }
}

/// Fetch and decode the blobs behind `keys`, keeping their order.
///
/// Expired records are skipped. Missing or unreadable ones are removed from
/// their index.
async fn load_records(pool: &Pool, codec: Codec, keys: &[String]) -> Result<Vec<PlainReqRes>, RedisError> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let mut conn = pool.get().await?;
    let blobs: Vec<Option<Vec<u8>>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;

    let now = now_millis();
    let mut records = Vec::with_capacity(keys.len());
    let mut dangling = Vec::new();
    for (key, blob) in keys.iter().zip(blobs) {
        match blob.map(|bytes| codec.decode(&bytes)) {
            Some(Ok(record)) if record.is_expired(now) => {}
            Some(Ok(record)) => records.push(record),
            Some(Err(e)) => {
                tracing::warn!(key = %key, error = %e, "dropping unreadable record");
                dangling.push(key);
            }
            None => dangling.push(key),
        }
    }

    for key in dangling {
        let Some(index) = PersistenceKey::decode(key).map(|k| k.index_key().encode()) else {
            continue;
        };
        let reaped: i64 = scripts::DELETE.key(&index).key(key).invoke_async(&mut conn).await?;
        tracing::debug!(key = %key, reaped, "removed dangling index member");
    }
    Ok(records)
}

fn flatten(batches: impl futures_util::Stream<Item = Result<Vec<PlainReqRes>, Error>> + Send + 'static) -> RecordStream {
    batches
        .map_ok(|records| stream::iter(records.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
}

#[async_trait]
impl Persistence for RedisPersistence {
    fn namespace(&self) -> &str {
        &self.settings.namespace
    }

    async fn keys(&self) -> Result<Vec<String>, Error> {
        let pattern = format!("{}{SEPARATOR}*", glob_escape(&self.settings.namespace));
        let indexes = scan_indexes(&self.pool, &pattern).await?;
        let names: BTreeSet<String> = indexes
            .iter()
            .filter_map(|k| PersistenceKey::decode(k))
            .filter(|k| k.namespace() == self.settings.namespace)
            .map(|k| k.cache_name().to_string())
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn put(&self, cache_name: &str, request: &PlainRequest, response: &PlainResponse) -> Result<bool, Error> {
        self.ensure_open()?;
        let Some(new) = new_record(request, response, self.settings.max_ttl) else {
            tracing::debug!(cache = cache_name, url = %request.url, "refusing to store stale response");
            return Ok(false);
        };
        let key = PersistenceKey::for_record(&self.settings.namespace, cache_name, &new.record)?;
        let blob = self.settings.codec.encode(&new.record)?;

        let mut conn = self.connection().await?;
        let _: i64 = scripts::PUT
            .key(key.encode())
            .key(key.index_key().encode())
            .arg(blob)
            .arg(ttl_millis(new.ttl))
            .arg(new.created.score())
            .invoke_async(&mut conn)
            .await
            .map_err(RedisError::from)?;

        tracing::debug!(cache = cache_name, key = %key, ttl_ms = new.ttl.as_millis() as u64, "stored record");
        Ok(true)
    }

    async fn delete(&self, cache_name: &str, request: &PlainRequest, record_id: Option<&str>) -> Result<bool, Error> {
        let index_key = PersistenceKey::index(&self.settings.namespace, cache_name, &request.url)?;
        let index = index_key.encode();

        let mut conn = self.connection().await?;
        let removed: i64 = match record_id {
            Some(id) => {
                let target = index_key.with_id(id).encode();
                scripts::DELETE.key(&index).key(target).invoke_async(&mut conn).await
            }
            None => scripts::DELETE_ALL.key(&index).invoke_async(&mut conn).await,
        }
        .map_err(RedisError::from)?;

        tracing::debug!(cache = cache_name, url = %request.url, removed, "deleted records");
        Ok(removed > 0)
    }

    fn get(&self, cache_name: &str, request: &PlainRequest) -> RecordStream {
        let index = match PersistenceKey::index(&self.settings.namespace, cache_name, &request.url) {
            Ok(key) => key.encode(),
            Err(e) => return failed_stream(e),
        };
        let pool = self.pool.clone();
        let Settings { codec, page_size, .. } = self.settings.clone();

        // The cursor is the exclusive upper score bound of the next window.
        let windows = stream::unfold(Some("+inf".to_string()), move |cursor| {
            let pool = pool.clone();
            let index = index.clone();
            async move {
                let max = cursor?;
                let window = async {
                    let members = newest_members(&pool, &index, &max, page_size).await?;
                    let next = match members.last() {
                        Some((_, last)) if members.len() == page_size => Some(format!("({last}")),
                        _ => None,
                    };
                    let keys: Vec<String> = members.into_iter().map(|(key, _)| key).collect();
                    Ok::<_, Error>((load_records(&pool, codec, &keys).await?, next))
                };
                match window.await {
                    Ok((records, next)) => Some((Ok(records), next)),
                    Err(e) => Some((Err(e), None)),
                }
            }
        });
        flatten(windows)
    }

    fn iter(&self, cache_name: &str) -> RecordStream {
        let pattern =
            format!("{}*", glob_escape(&PersistenceKey::cache_prefix(&self.settings.namespace, cache_name)));
        let pool = self.pool.clone();
        let Settings { codec, page_size, .. } = self.settings.clone();

        stream::once(async move {
            let mut members = Vec::new();
            for index in scan_indexes(&pool, &pattern).await? {
                members.extend(all_members(&pool, &index, page_size).await?);
            }
            members.sort_by(|a, b| a.1.total_cmp(&b.1));

            let windows: Vec<Vec<String>> = members
                .into_iter()
                .map(|(key, _)| key)
                .collect::<Vec<_>>()
                .chunks(page_size)
                .map(<[String]>::to_vec)
                .collect();
            let batches = stream::iter(windows).then(move |keys| {
                let pool = pool.clone();
                async move { Ok::<_, Error>(load_records(&pool, codec, &keys).await?) }
            });
            Ok::<_, Error>(flatten(batches))
        })
        .try_flatten()
        .boxed()
    }

    async fn dispose(&self) -> Result<(), Error> {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            if self.owns_pool {
                self.pool.close();
            }
            tracing::debug!(namespace = %self.settings.namespace, closed_pool = self.owns_pool, "redis persistence disposed");
        }
        Ok(())
    }
}

/// Hands out [`RedisPersistence`] handles sharing one connection pool.
///
/// Disposing a handle leaves the pool open; [`close`](Self::close) shuts it.
#[derive(Clone)]
pub struct RedisFactory {
    pool: Pool,
    settings: Settings,
}

impl std::fmt::Debug for RedisFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisFactory").field("settings", &self.settings).finish_non_exhaustive()
    }
}

impl RedisFactory {
    pub async fn connect(config: &CacheConfig) -> Result<Self, Error> {
        let pool = pool::build(config)?;
        pool::warm(&pool, config.pool_min).await?;
        tracing::info!(url = %config.redis_url, namespace = %config.namespace, "connected to redis");
        Ok(Self { pool, settings: Settings::from_config(config) })
    }

    pub fn close(&self) {
        self.pool.close();
    }
}

#[async_trait]
impl PersistenceFactory for RedisFactory {
    async fn create(&self, _cache_name: &str) -> Result<Arc<dyn Persistence>, Error> {
        Ok(Arc::new(RedisPersistence::with_pool(self.pool.clone(), self.settings.clone(), false)))
    }
}

/// A [`CacheStorage`] for `config`, on whichever backend it selects.
pub async fn open_storage(config: &CacheConfig) -> Result<CacheStorage, Error> {
    let factory: Arc<dyn PersistenceFactory> = match config.backend {
        Backend::Redis => Arc::new(RedisFactory::connect(config).await?),
        _ => config.factory().await?,
    };
    Ok(config.storage(factory))
}
