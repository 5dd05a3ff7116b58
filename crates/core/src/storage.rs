//! Registry of named caches.

use std::sync::Arc;

use futures_util::TryStreamExt;
use tokio::sync::Mutex;

use crate::Error;
use crate::cache::Cache;
use crate::fetch::Fetcher;
use crate::matching::{HeaderNormalizer, MatchOptions};
use crate::message::{Body, IntoCacheRequest};
use crate::persistence::PersistenceFactory;
use crate::record::PlainReqRes;

/// Opens, lists and deletes [`Cache`]s backed by one [`PersistenceFactory`].
///
/// `open` is idempotent: a name opened twice yields the same cache. With
/// discovery enabled, names reported by the backend (for example caches
/// written by another process) are merged into `has` and `keys`.
pub struct CacheStorage {
    factory: Arc<dyn PersistenceFactory>,
    caches: Mutex<Vec<(String, Arc<Cache>)>>,
    normalizer: Option<HeaderNormalizer>,
    fetcher: Option<Arc<dyn Fetcher>>,
    serialize_ops: bool,
    discover_remote_names: bool,
}

impl std::fmt::Debug for CacheStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStorage")
            .field("serialize_ops", &self.serialize_ops)
            .field("discover_remote_names", &self.discover_remote_names)
            .finish_non_exhaustive()
    }
}

impl CacheStorage {
    pub fn new(factory: Arc<dyn PersistenceFactory>) -> Self {
        Self {
            factory,
            caches: Mutex::new(Vec::new()),
            normalizer: None,
            fetcher: None,
            serialize_ops: true,
            discover_remote_names: false,
        }
    }

    /// Header normalizer handed to every cache opened from now on.
    pub fn with_normalizer(mut self, normalizer: HeaderNormalizer) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_serialized_ops(mut self, serialized: bool) -> Self {
        self.serialize_ops = serialized;
        self
    }

    /// Merge backend-reported cache names into `has` and `keys`.
    pub fn with_discovery(mut self, discover: bool) -> Self {
        self.discover_remote_names = discover;
        self
    }

    async fn discovered(&self) -> Result<Vec<String>, Error> {
        if !self.discover_remote_names {
            return Ok(Vec::new());
        }
        self.factory.discover().await
    }

    /// The cache named `name`, created on first use.
    pub async fn open(&self, name: &str) -> Result<Arc<Cache>, Error> {
        let mut caches = self.caches.lock().await;
        if let Some((_, cache)) = caches.iter().find(|(n, _)| n == name) {
            return Ok(Arc::clone(cache));
        }

        let persistence = self.factory.create(name).await?;
        let mut cache = Cache::new(name, persistence).with_serialized_ops(self.serialize_ops);
        if let Some(normalizer) = &self.normalizer {
            cache = cache.with_normalizer(Arc::clone(normalizer));
        }
        if let Some(fetcher) = &self.fetcher {
            cache = cache.with_fetcher(Arc::clone(fetcher));
        }

        let cache = Arc::new(cache);
        caches.push((name.to_string(), Arc::clone(&cache)));
        tracing::debug!(cache = name, "opened cache");
        Ok(cache)
    }

    pub async fn has(&self, name: &str) -> Result<bool, Error> {
        if self.caches.lock().await.iter().any(|(n, _)| n == name) {
            return Ok(true);
        }
        Ok(self.discovered().await?.iter().any(|n| n == name))
    }

    /// Delete every record of the cache named `name` and forget it.
    ///
    /// Returns whether the cache existed.
    pub async fn delete(&self, name: &str) -> Result<bool, Error> {
        let opened = {
            let mut caches = self.caches.lock().await;
            caches.iter().position(|(n, _)| n == name).map(|i| caches.remove(i).1)
        };
        let cache = match opened {
            Some(cache) => cache,
            None => {
                if !self.discovered().await?.iter().any(|n| n == name) {
                    return Ok(false);
                }
                Arc::new(Cache::new(name, self.factory.create(name).await?).with_serialized_ops(false))
            }
        };

        cache.drain_queue().await;
        let persistence = cache.persistence();
        let records: Vec<PlainReqRes> = persistence.iter(name).try_collect().await?;
        let mut removed = 0usize;
        for record in &records {
            if persistence.delete(name, &record.request(), Some(&record.id)).await? {
                removed += 1;
            }
        }
        cache.dispose().await?;

        tracing::debug!(cache = name, removed, "deleted cache");
        Ok(true)
    }

    /// Names of opened caches in opening order, followed by discovered ones.
    pub async fn keys(&self) -> Result<Vec<String>, Error> {
        let mut names: Vec<String> = self.caches.lock().await.iter().map(|(n, _)| n.clone()).collect();
        for name in self.discovered().await? {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// First match for `request` across every cache, in [`keys`](Self::keys) order.
    pub async fn match_request(
        &self, request: impl IntoCacheRequest, options: MatchOptions,
    ) -> Result<Option<http::Response<Body>>, Error> {
        let request = request.into_cache_request()?;
        for name in self.keys().await? {
            let cache = self.open(&name).await?;
            if let Some(response) = cache.match_request(&request, options).await? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    /// Dispose every opened cache and empty the registry.
    pub async fn dispose(&self) -> Result<(), Error> {
        let caches: Vec<(String, Arc<Cache>)> = std::mem::take(&mut *self.caches.lock().await);
        let mut first_error = None;
        for (name, cache) in caches {
            if let Err(e) = cache.dispose().await {
                tracing::warn!(cache = %name, error = %e, "failed to dispose cache");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
