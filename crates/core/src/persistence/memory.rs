//! Volatile in-process backend.
//!
//! Records live in a map shared by every handle created from one
//! [`MemoryFactory`]. Each index is an ordered set keyed by creation stamp.
//! Every stored record arms a timer that removes it when its TTL elapses;
//! `dispose` cancels the timers armed by that handle. Expired records left
//! behind by a disposed handle are removed by the next read that meets them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use tokio::sync::RwLock;
use tokio::task::AbortHandle;

use super::{NewRecord, Persistence, PersistenceFactory, RecordStream, failed_stream, new_record, now_millis};
use crate::Error;
use crate::expiry::MAX_TTL;
use crate::key::{DEFAULT_NAMESPACE, PersistenceKey};
use crate::record::{Created, PlainReqRes, PlainRequest, PlainResponse};

#[derive(Debug, Default)]
struct Store {
    records: HashMap<PersistenceKey, PlainReqRes>,
    indexes: HashMap<PersistenceKey, BTreeMap<Created, PersistenceKey>>,
}

impl Store {
    fn insert(&mut self, key: PersistenceKey, new: NewRecord) {
        self.indexes.entry(key.index_key()).or_default().insert(new.created, key.clone());
        self.records.insert(key, new.record);
    }

    /// Remove one record and its index entry, dropping the index once empty.
    fn remove(&mut self, key: &PersistenceKey) -> bool {
        let Some(record) = self.records.remove(key) else {
            return false;
        };
        let index_key = key.index_key();
        if let Some(index) = self.indexes.get_mut(&index_key) {
            match record.created_stamp() {
                Ok(created) => {
                    index.remove(&created);
                }
                Err(_) => index.retain(|_, member| member != key),
            }
            if index.is_empty() {
                self.indexes.remove(&index_key);
            }
        }
        true
    }

    fn live(&self, key: &PersistenceKey, now: i64) -> Option<PlainReqRes> {
        self.records.get(key).filter(|r| !r.is_expired(now)).cloned()
    }

    /// Remove every expired record whose key passes `select`.
    fn reap(&mut self, now: i64, select: impl Fn(&PersistenceKey) -> bool) -> Vec<PersistenceKey> {
        let expired: Vec<PersistenceKey> = self
            .records
            .iter()
            .filter(|(key, record)| record.is_expired(now) && select(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired
    }
}

type Timers = Arc<Mutex<HashMap<PersistenceKey, AbortHandle>>>;

fn cancel_timers(timers: &Timers, keys: &[PersistenceKey]) {
    let mut timers = timers.lock().unwrap_or_else(PoisonError::into_inner);
    for key in keys {
        if let Some(handle) = timers.remove(key) {
            handle.abort();
        }
    }
}

/// Reap expired records passing `select`, then return the keys `list` picks from the store.
async fn reap_then_list(
    store: &RwLock<Store>, timers: &Timers, select: impl Fn(&PersistenceKey) -> bool,
    list: impl FnOnce(&Store) -> Vec<PersistenceKey>,
) -> Vec<PersistenceKey> {
    let mut guard = store.write().await;
    let reaped = guard.reap(now_millis(), select);
    if !reaped.is_empty() {
        cancel_timers(timers, &reaped);
        tracing::debug!(reaped = reaped.len(), "removed expired records on read");
    }
    list(&guard)
}

/// In-memory [`Persistence`] with per-record expiry timers.
#[derive(Debug)]
pub struct MemoryPersistence {
    namespace: String,
    max_ttl: Duration,
    store: Arc<RwLock<Store>>,
    timers: Timers,
    disposed: AtomicBool,
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE, MAX_TTL)
    }
}

impl MemoryPersistence {
    /// A backend with its own private store.
    pub fn new(namespace: &str, max_ttl: Duration) -> Self {
        Self::with_store(namespace, max_ttl, Arc::default())
    }

    fn with_store(namespace: &str, max_ttl: Duration, store: Arc<RwLock<Store>>) -> Self {
        Self {
            namespace: namespace.to_string(),
            max_ttl,
            store,
            timers: Arc::default(),
            disposed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed("memory persistence".into()));
        }
        Ok(())
    }

    fn arm_timer(&self, key: PersistenceKey, ttl: Duration) {
        let store = Arc::clone(&self.store);
        let timers = Arc::clone(&self.timers);
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let removed = store.write().await.remove(&timer_key);
            timers.lock().unwrap_or_else(PoisonError::into_inner).remove(&timer_key);
            if removed {
                tracing::debug!(key = %timer_key, "expired record removed");
            }
        });
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, handle.abort_handle());
    }

    fn cancel_timer(&self, key: &PersistenceKey) {
        cancel_timers(&self.timers, std::slice::from_ref(key));
    }

    /// Stream the given record keys, skipping any that vanished or expired.
    fn stream_keys(store: Arc<RwLock<Store>>, keys: Vec<PersistenceKey>) -> impl futures_util::Stream<Item = Result<PlainReqRes, Error>> {
        stream::iter(keys).filter_map(move |key| {
            let store = Arc::clone(&store);
            async move { store.read().await.live(&key, now_millis()).map(Ok) }
        })
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn keys(&self) -> Result<Vec<String>, Error> {
        let namespace = self.namespace.as_str();
        let indexes = reap_then_list(
            &self.store,
            &self.timers,
            |k| k.namespace() == namespace,
            |store| store.indexes.keys().filter(|k| k.namespace() == namespace).cloned().collect(),
        )
        .await;
        let names: BTreeSet<&str> = indexes.iter().map(PersistenceKey::cache_name).collect();
        Ok(names.into_iter().map(str::to_string).collect())
    }

    async fn put(&self, cache_name: &str, request: &PlainRequest, response: &PlainResponse) -> Result<bool, Error> {
        self.ensure_open()?;
        let Some(new) = new_record(request, response, self.max_ttl) else {
            tracing::debug!(cache = cache_name, url = %request.url, "refusing to store stale response");
            return Ok(false);
        };
        let key = PersistenceKey::for_record(&self.namespace, cache_name, &new.record)?;
        let ttl = new.ttl;

        self.store.write().await.insert(key.clone(), new);
        tracing::debug!(cache = cache_name, key = %key, ttl_ms = ttl.as_millis() as u64, "stored record");
        self.arm_timer(key, ttl);
        Ok(true)
    }

    async fn delete(&self, cache_name: &str, request: &PlainRequest, record_id: Option<&str>) -> Result<bool, Error> {
        self.ensure_open()?;
        let index_key = PersistenceKey::index(&self.namespace, cache_name, &request.url)?;

        let targets: Vec<PersistenceKey> = match record_id {
            Some(id) => vec![index_key.with_id(id)],
            None => {
                let store = self.store.read().await;
                store.indexes.get(&index_key).map(|m| m.values().cloned().collect()).unwrap_or_default()
            }
        };

        let mut removed = 0usize;
        {
            let mut store = self.store.write().await;
            for key in &targets {
                if store.remove(key) {
                    removed += 1;
                }
            }
        }
        for key in &targets {
            self.cancel_timer(key);
        }

        tracing::debug!(cache = cache_name, url = %request.url, removed, "deleted records");
        Ok(removed > 0)
    }

    fn get(&self, cache_name: &str, request: &PlainRequest) -> RecordStream {
        let index_key = match PersistenceKey::index(&self.namespace, cache_name, &request.url) {
            Ok(key) => key,
            Err(e) => return failed_stream(e),
        };
        let store = Arc::clone(&self.store);
        let timers = Arc::clone(&self.timers);

        stream::once(async move {
            let members = reap_then_list(
                &store,
                &timers,
                |k| k.index_key() == index_key,
                |store| store.indexes.get(&index_key).map(|m| m.values().rev().cloned().collect()).unwrap_or_default(),
            )
            .await;
            Self::stream_keys(store, members)
        })
        .flatten()
        .boxed()
    }

    fn iter(&self, cache_name: &str) -> RecordStream {
        let namespace = self.namespace.clone();
        let cache_name = cache_name.to_string();
        let store = Arc::clone(&self.store);
        let timers = Arc::clone(&self.timers);

        stream::once(async move {
            let in_cache = |k: &PersistenceKey| k.namespace() == namespace && k.cache_name() == cache_name;
            let members = reap_then_list(&store, &timers, in_cache, |store| {
                let ordered: BTreeMap<Created, PersistenceKey> = store
                    .indexes
                    .iter()
                    .filter(|(k, _)| in_cache(*k))
                    .flat_map(|(_, members)| members.iter().map(|(c, k)| (*c, k.clone())))
                    .collect();
                ordered.into_values().collect()
            })
            .await;
            Self::stream_keys(store, members)
        })
        .flatten()
        .boxed()
    }

    async fn dispose(&self) -> Result<(), Error> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let timers: Vec<AbortHandle> = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &timers {
            handle.abort();
        }
        tracing::debug!(timers = timers.len(), "memory persistence disposed");
        Ok(())
    }
}

/// Hands out [`MemoryPersistence`] handles over one shared store, so every
/// cache opened through it is visible to `keys()`.
#[derive(Debug, Clone)]
pub struct MemoryFactory {
    namespace: String,
    max_ttl: Duration,
    store: Arc<RwLock<Store>>,
}

impl Default for MemoryFactory {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE, MAX_TTL)
    }
}

impl MemoryFactory {
    pub fn new(namespace: &str, max_ttl: Duration) -> Self {
        Self { namespace: namespace.to_string(), max_ttl, store: Arc::default() }
    }
}

#[async_trait]
impl PersistenceFactory for MemoryFactory {
    async fn create(&self, _cache_name: &str) -> Result<Arc<dyn Persistence>, Error> {
        Ok(Arc::new(MemoryPersistence::with_store(&self.namespace, self.max_ttl, Arc::clone(&self.store))))
    }
}
