//! The cache matching engine.
//!
//! A [`Cache`] validates and stores live responses through a [`Persistence`]
//! backend and answers queries by running every stored record of the query's
//! index through [`matches`](crate::matching::matches). Every response for a
//! request is kept; the newest matching one wins.
//!
//! With serialized operations on (the default), `put` and `delete` run one at
//! a time through an [`OpQueue`], in call order. Call [`Cache::dispose`] when
//! done: it drains the queue and releases the backend's pooled resources.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{StreamExt, TryStreamExt, future};
use http::{Method, Request, Response, StatusCode};

use crate::Error;
use crate::fetch::Fetcher;
use crate::key::PersistenceKey;
use crate::matching::{HeaderNormalizer, MatchOptions, identity_normalizer, matches_record};
use crate::message::{Body, IntoCacheRequest};
use crate::persistence::{Persistence, RecordStream, now_millis};
use crate::queue::OpQueue;
use crate::record::{PlainReqRes, PlainRequest, PlainResponse};

/// A named cache of request/response pairs.
pub struct Cache {
    name: String,
    persistence: Arc<dyn Persistence>,
    normalizer: HeaderNormalizer,
    queue: Option<OpQueue>,
    fetcher: Option<Arc<dyn Fetcher>>,
    disposed: AtomicBool,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("persistence", &self.persistence)
            .field("serialized", &self.queue.is_some())
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn validate(request: &Request<()>, response: &Response<Body>) -> Result<(), Error> {
    match request.uri().scheme_str() {
        Some("http" | "https") => {}
        Some(other) => return Err(Error::InvalidScheme(other.to_string())),
        None => return Err(Error::InvalidUrl(request.uri().to_string())),
    }
    if request.method() != Method::GET {
        return Err(Error::InvalidMethod(request.method().to_string()));
    }
    if response.status() == StatusCode::PARTIAL_CONTENT {
        return Err(Error::PartialContent);
    }
    let wildcard = response
        .headers()
        .get_all(http::header::VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|field| field.trim() == "*");
    if wildcard {
        return Err(Error::VaryWildcard);
    }
    if response.body().is_used() {
        return Err(Error::BodyUsed);
    }
    Ok(())
}

fn live_responses(records: Vec<PlainReqRes>) -> Result<Vec<Response<Body>>, Error> {
    let now = now_millis();
    records.iter().map(|r| r.to_live_response(now)).collect()
}

fn stored_requests(records: Vec<PlainReqRes>) -> Result<Vec<Request<()>>, Error> {
    records.iter().map(|r| r.request().to_http()).collect()
}

impl Cache {
    /// A cache named `name` on `persistence`, with serialized operations and
    /// the identity header normalizer.
    pub fn new(name: &str, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            name: name.to_string(),
            persistence,
            normalizer: identity_normalizer(),
            queue: Some(OpQueue::new()),
            fetcher: None,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn with_normalizer(mut self, normalizer: HeaderNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Run `put`/`delete` through the operation queue (`true`) or directly.
    pub fn with_serialized_ops(mut self, serialized: bool) -> Self {
        self.queue = serialized.then(OpQueue::new);
        self
    }

    /// Fetcher used by [`add`](Self::add) and [`add_all`](Self::add_all).
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed(format!("cache {}", self.name)));
        }
        Ok(())
    }

    /// Store `response` for `request`.
    ///
    /// Returns `false` when the response was already stale and nothing was stored.
    ///
    /// # Errors
    ///
    /// Validation failures, in this order: `InvalidUrl`/`InvalidScheme` for
    /// non-http(s) requests, `InvalidMethod` for non-GET requests,
    /// `PartialContent` for 206 responses, `VaryWildcard` for `Vary: *`, and
    /// `BodyUsed` when the body was already read. Nothing is stored on error.
    pub async fn put(&self, request: impl IntoCacheRequest, mut response: Response<Body>) -> Result<bool, Error> {
        self.ensure_open()?;
        let request = request.into_cache_request()?;
        validate(&request, &response)?;

        let plain_request = PlainRequest::from_http(&request)?;
        let plain_response = PlainResponse::from_http(&mut response)?;

        let persistence = Arc::clone(&self.persistence);
        let name = self.name.clone();
        let op = async move { persistence.put(&name, &plain_request, &plain_response).await };
        match &self.queue {
            Some(queue) => queue.submit("put", op).await,
            None => op.await,
        }
    }

    /// Delete every stored response matching `request`.
    ///
    /// Returns whether anything was deleted. A non-GET request deletes nothing
    /// unless `ignore_method` is set.
    pub async fn delete(&self, request: impl IntoCacheRequest, options: MatchOptions) -> Result<bool, Error> {
        self.ensure_open()?;
        let request = request.into_cache_request()?;
        if Self::skips_method(&request, options) {
            return Ok(false);
        }
        let query = PlainRequest::from_http(&request)?;

        let persistence = Arc::clone(&self.persistence);
        let normalizer = Arc::clone(&self.normalizer);
        let name = self.name.clone();
        let op = async move {
            let ids: Vec<String> = persistence
                .get(&name, &query)
                .try_filter(|record| future::ready(matches_record(&query, record, options, &normalizer)))
                .map_ok(|record| record.id)
                .try_collect()
                .await?;

            let mut deleted = false;
            for id in &ids {
                deleted |= persistence.delete(&name, &query, Some(id)).await?;
            }
            tracing::debug!(cache = %name, url = %query.url, matched = ids.len(), deleted, "delete");
            Ok::<_, Error>(deleted)
        };
        match &self.queue {
            Some(queue) => queue.submit("delete", op).await,
            None => op.await,
        }
    }

    /// Delete what `response` was served from.
    ///
    /// A response returned by this cache carries its [`RecordId`](crate::RecordId) and deletes
    /// only that record. Any other response deletes every record stored for
    /// `request`. Returns whether anything was deleted.
    pub async fn delete_response(&self, request: impl IntoCacheRequest, response: &Response<Body>) -> Result<bool, Error> {
        self.ensure_open()?;
        let request = request.into_cache_request()?;
        let query = PlainRequest::from_http(&request)?;
        let key = PersistenceKey::for_response(self.persistence.namespace(), &self.name, &query.url, response)?;

        let persistence = Arc::clone(&self.persistence);
        let name = self.name.clone();
        let op = async move {
            let deleted = persistence.delete(&name, &query, key.id()).await?;
            tracing::debug!(cache = %name, key = %key, deleted, "delete response");
            Ok::<_, Error>(deleted)
        };
        match &self.queue {
            Some(queue) => queue.submit("delete", op).await,
            None => op.await,
        }
    }

    /// Records of `request`'s index passing the matching predicate, newest first.
    fn matching(&self, request: &Request<()>, options: MatchOptions) -> Result<RecordStream, Error> {
        let query = PlainRequest::from_http(request)?;
        let normalizer = Arc::clone(&self.normalizer);
        let records = self.persistence.get(&self.name, &query);
        Ok(records
            .try_filter(move |record| future::ready(matches_record(&query, record, options, &normalizer)))
            .boxed())
    }

    fn skips_method(request: &Request<()>, options: MatchOptions) -> bool {
        request.method() != Method::GET && !options.ignore_method
    }

    /// The newest stored response matching `request`.
    pub async fn match_request(
        &self, request: impl IntoCacheRequest, options: MatchOptions,
    ) -> Result<Option<Response<Body>>, Error> {
        self.ensure_open()?;
        let request = request.into_cache_request()?;
        if Self::skips_method(&request, options) {
            return Ok(None);
        }
        let mut matching = self.matching(&request, options)?;
        match matching.try_next().await? {
            Some(record) => Ok(Some(record.to_live_response(now_millis())?)),
            None => Ok(None),
        }
    }

    /// Every stored response matching `request`, newest first.
    pub async fn match_all(&self, request: impl IntoCacheRequest, options: MatchOptions) -> Result<Vec<Response<Body>>, Error> {
        self.ensure_open()?;
        let request = request.into_cache_request()?;
        if Self::skips_method(&request, options) {
            return Ok(Vec::new());
        }
        let records: Vec<PlainReqRes> = self.matching(&request, options)?.try_collect().await?;
        live_responses(records)
    }

    /// Every stored response in the cache, oldest first.
    pub async fn responses(&self) -> Result<Vec<Response<Body>>, Error> {
        self.ensure_open()?;
        let records: Vec<PlainReqRes> = self.persistence.iter(&self.name).try_collect().await?;
        live_responses(records)
    }

    /// Stored requests whose record matches `request`, newest first.
    pub async fn keys(&self, request: impl IntoCacheRequest, options: MatchOptions) -> Result<Vec<Request<()>>, Error> {
        self.ensure_open()?;
        let request = request.into_cache_request()?;
        if Self::skips_method(&request, options) {
            return Ok(Vec::new());
        }
        let records: Vec<PlainReqRes> = self.matching(&request, options)?.try_collect().await?;
        stored_requests(records)
    }

    /// Every stored request in the cache, in insertion order.
    pub async fn requests(&self) -> Result<Vec<Request<()>>, Error> {
        self.ensure_open()?;
        let records: Vec<PlainReqRes> = self.persistence.iter(&self.name).try_collect().await?;
        stored_requests(records)
    }

    fn fetcher(&self) -> Result<&Arc<dyn Fetcher>, Error> {
        self.fetcher.as_ref().ok_or_else(|| Error::Fetch("no fetcher configured".into()))
    }

    async fn fetch_ok(fetcher: &dyn Fetcher, request: &Request<()>) -> Result<Response<Body>, Error> {
        let response = fetcher.fetch(request).await?;
        if !response.status().is_success() {
            return Err(Error::BadResponse(format!("{} for {}", response.status(), request.uri())));
        }
        Ok(response)
    }

    /// Fetch `request` and store the response.
    ///
    /// # Errors
    ///
    /// Returns `Error::BadResponse` for a non-2xx response, plus any error of
    /// the fetch itself or of [`put`](Self::put).
    pub async fn add(&self, request: impl IntoCacheRequest) -> Result<(), Error> {
        self.ensure_open()?;
        let request = request.into_cache_request()?;
        let response = Self::fetch_ok(self.fetcher()?.as_ref(), &request).await?;
        self.put(request, response).await?;
        Ok(())
    }

    /// Fetch every request, then store the responses once all fetches succeeded.
    ///
    /// Nothing is stored if any fetch fails or returns a non-2xx status. A
    /// failing `put` after that point does not undo the earlier ones.
    pub async fn add_all<R: IntoCacheRequest>(&self, requests: impl IntoIterator<Item = R>) -> Result<(), Error> {
        self.ensure_open()?;
        let requests = requests.into_iter().map(IntoCacheRequest::into_cache_request).collect::<Result<Vec<_>, _>>()?;
        let fetcher = self.fetcher()?.as_ref();

        let responses = future::try_join_all(requests.iter().map(|r| Self::fetch_ok(fetcher, r))).await?;
        for (request, response) in requests.into_iter().zip(responses) {
            self.put(request, response).await?;
        }
        Ok(())
    }

    /// Wait for queued operations and stop accepting new ones. The backend stays usable.
    pub(crate) async fn drain_queue(&self) {
        if let Some(queue) = &self.queue {
            queue.drain().await;
        }
    }

    /// Drain pending operations and release the backend. Stored data is kept.
    pub async fn dispose(&self) -> Result<(), Error> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.drain_queue().await;
        self.persistence.dispose().await?;
        tracing::debug!(cache = %self.name, "cache disposed");
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    fn cache() -> Cache {
        Cache::new("v1", Arc::new(MemoryPersistence::default()))
    }

    fn response(body: &'static str, headers: &[(&str, &str)]) -> Response<Body> {
        let mut builder = Response::builder();
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn request(url: &str, headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().uri(url);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    fn text(mut response: Response<Body>) -> String {
        response.body_mut().text().unwrap()
    }

    #[tokio::test]
    async fn test_put_then_match() {
        let cache = cache();
        assert!(cache.put("http://h/x", response("A", &[("cache-control", "max-age=60")])).await.unwrap());

        let hit = cache.match_request("http://h/x", MatchOptions::default()).await.unwrap().unwrap();
        assert!(hit.extensions().get::<crate::RecordId>().is_some());
        assert_eq!(text(hit), "A");
        assert!(cache.match_request("http://h/y", MatchOptions::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fragment_irrelevance() {
        let cache = cache();
        cache.put("http://h/x#one", response("A", &[])).await.unwrap();

        let hit = cache.match_request("http://h/x#two", MatchOptions::default()).await.unwrap();
        assert_eq!(text(hit.unwrap()), "A");
        assert_eq!(cache.match_all("http://h/x", MatchOptions::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_search_sensitivity() {
        let cache = cache();
        cache.put("http://h/x", response("A", &[])).await.unwrap();

        assert!(cache.match_request("http://h/x?a=1", MatchOptions::default()).await.unwrap().is_none());
        let hit = cache.match_request("http://h/x?a=1", MatchOptions::default().ignore_search()).await.unwrap();
        assert_eq!(text(hit.unwrap()), "A");
    }

    #[tokio::test]
    async fn test_vary_correctness() {
        let cache = cache();
        let stored = request("http://h/x", &[("x-lang", "en")]);
        cache.put(stored, response("EN", &[("vary", "x-lang")])).await.unwrap();

        let other = request("http://h/x", &[("x-lang", "fr")]);
        assert!(cache.match_request(&other, MatchOptions::default()).await.unwrap().is_none());
        assert!(cache.match_request(&other, MatchOptions::default().ignore_vary()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_normalizer_collapses_variants() {
        let normalizer: HeaderNormalizer = Arc::new(|name: &str, value: Option<&str>| {
            if name.eq_ignore_ascii_case("user-agent") {
                Some(if value.is_some_and(|v| v.contains("Mobile")) { "mobile" } else { "desktop" }.to_string())
            } else {
                value.map(str::to_string)
            }
        });
        let cache = cache().with_normalizer(normalizer);
        let stored = request("http://h/x", &[("user-agent", "Firefox Mobile")]);
        cache.put(stored, response("M", &[("vary", "User-Agent")])).await.unwrap();

        let phone = request("http://h/x", &[("user-agent", "Safari Mobile")]);
        let desktop = request("http://h/x", &[("user-agent", "Safari")]);
        assert_eq!(text(cache.match_request(&phone, MatchOptions::default()).await.unwrap().unwrap()), "M");
        assert!(cache.match_request(&desktop, MatchOptions::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_multi_response_ordering() {
        let cache = cache();
        cache.put("http://h/x", response("first", &[])).await.unwrap();
        cache.put("http://h/y", response("other", &[])).await.unwrap();
        cache.put("http://h/x", response("second", &[])).await.unwrap();

        let all = cache.match_all("http://h/x", MatchOptions::default()).await.unwrap();
        assert_eq!(all.into_iter().map(text).collect::<Vec<_>>(), vec!["second", "first"]);

        let urls: Vec<String> = cache.requests().await.unwrap().iter().map(|r| r.uri().to_string()).collect();
        assert_eq!(urls, vec!["http://h/x", "http://h/y", "http://h/x"]);

        let everything = cache.responses().await.unwrap();
        assert_eq!(everything.into_iter().map(text).collect::<Vec<_>>(), vec!["first", "other", "second"]);

        let keys = cache.keys("http://h/x", MatchOptions::default()).await.unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_puts_rejected() {
        let cache = cache();

        let post = Request::builder().method("POST").uri("http://h/x").body(()).unwrap();
        assert!(matches!(cache.put(post, response("A", &[])).await, Err(Error::InvalidMethod(_))));

        let partial = Response::builder().status(206).body(Body::from("A")).unwrap();
        assert!(matches!(cache.put("http://h/x", partial).await, Err(Error::PartialContent)));

        let wildcard = response("A", &[("vary", "accept, *")]);
        assert!(matches!(cache.put("http://h/x", wildcard).await, Err(Error::VaryWildcard)));

        assert!(matches!(cache.put("ftp://h/x", response("A", &[])).await, Err(Error::InvalidScheme(_))));

        let mut used = response("A", &[]);
        used.body_mut().take().unwrap();
        assert!(matches!(cache.put("http://h/x", used).await, Err(Error::BodyUsed)));

        assert!(cache.match_request("http://h/x", MatchOptions::default()).await.unwrap().is_none());
        assert!(cache.requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_validation_order() {
        let cache = cache();
        let post = Request::builder().method("POST").uri("ftp://h/x").body(()).unwrap();
        let partial = Response::builder().status(206).header("vary", "*").body(Body::from("A")).unwrap();
        assert!(matches!(cache.put(post, partial).await, Err(Error::InvalidScheme(_))));
    }

    #[tokio::test]
    async fn test_entry_expires() {
        let cache = cache();
        cache.put("http://h/x", response("A", &[("cache-control", "max-age=1")])).await.unwrap();
        let hit = cache.match_request("http://h/x", MatchOptions::default()).await.unwrap();
        assert_eq!(text(hit.unwrap()), "A");

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(cache.match_request("http://h/x", MatchOptions::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_response_not_stored() {
        let cache = cache();
        assert!(!cache.put("http://h/x", response("A", &[("cache-control", "max-age=0")])).await.unwrap());
        assert!(cache.match_request("http://h/x", MatchOptions::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_accept_encoding_variants() {
        let cache = cache();
        let gzip = request("http://h/x", &[("accept-encoding", "gzip")]);
        let deflate = request("http://h/x", &[("accept-encoding", "deflate")]);
        cache.put(&gzip, response("gz", &[("vary", "accept-encoding")])).await.unwrap();
        cache.put(&deflate, response("df", &[("vary", "accept-encoding")])).await.unwrap();

        let hits = cache.match_all(&gzip, MatchOptions::default()).await.unwrap();
        assert_eq!(hits.into_iter().map(text).collect::<Vec<_>>(), vec!["gz"]);
        let hits = cache.match_all(&deflate, MatchOptions::default()).await.unwrap();
        assert_eq!(hits.into_iter().map(text).collect::<Vec<_>>(), vec!["df"]);
    }

    #[tokio::test]
    async fn test_age_header() {
        let cache = cache();
        cache.put("http://h/x", response("A", &[("age", "7")])).await.unwrap();
        let hit = cache.match_request("http://h/x", MatchOptions::default()).await.unwrap().unwrap();
        let age: u64 = hit.headers()["age"].to_str().unwrap().parse().unwrap();
        assert!((7..=8).contains(&age));
    }

    #[tokio::test]
    async fn test_reason_phrase_survives() {
        let cache = cache();
        let mut custom = response("A", &[]);
        custom.extensions_mut().insert(crate::ReasonPhrase("Fine Thanks".into()));
        cache.put("http://h/x", custom).await.unwrap();

        let hit = cache.match_request("http://h/x", MatchOptions::default()).await.unwrap().unwrap();
        assert_eq!(crate::message::status_text(&hit), "Fine Thanks");
    }

    #[tokio::test]
    async fn test_delete() {
        let cache = cache();
        cache.put("http://h/x", response("A", &[])).await.unwrap();
        cache.put("http://h/x?page=2", response("B", &[])).await.unwrap();

        assert!(!cache.delete("http://h/missing", MatchOptions::default()).await.unwrap());
        assert!(cache.delete("http://h/x", MatchOptions::default()).await.unwrap());
        assert!(cache.match_request("http://h/x", MatchOptions::default()).await.unwrap().is_none());
        assert!(cache.match_request("http://h/x?page=2", MatchOptions::default()).await.unwrap().is_some());

        assert!(cache.delete("http://h/x", MatchOptions::default().ignore_search()).await.unwrap());
        assert!(cache.requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_served_response_removes_only_its_record() {
        let cache = cache();
        cache.put("http://h/x", response("old", &[])).await.unwrap();
        cache.put("http://h/x", response("new", &[])).await.unwrap();

        let served = cache.match_request("http://h/x", MatchOptions::default()).await.unwrap().unwrap();
        assert!(served.extensions().get::<crate::RecordId>().is_some());
        assert!(cache.delete_response("http://h/x", &served).await.unwrap());
        assert!(!cache.delete_response("http://h/x", &served).await.unwrap());

        let left = cache.match_all("http://h/x", MatchOptions::default()).await.unwrap();
        assert_eq!(left.into_iter().map(text).collect::<Vec<_>>(), vec!["old"]);
    }

    #[tokio::test]
    async fn test_delete_foreign_response_removes_whole_request() {
        let cache = cache();
        cache.put("http://h/x", response("a", &[])).await.unwrap();
        cache.put("http://h/x", response("b", &[])).await.unwrap();
        cache.put("http://h/y", response("kept", &[])).await.unwrap();

        let fresh = response("from the network", &[]);
        assert!(cache.delete_response("http://h/x", &fresh).await.unwrap());
        assert!(cache.match_request("http://h/x", MatchOptions::default()).await.unwrap().is_none());
        assert_eq!(cache.requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_non_get_queries() {
        let cache = cache();
        cache.put("http://h/x", response("A", &[])).await.unwrap();
        let post = Request::builder().method("POST").uri("http://h/x").body(()).unwrap();

        assert!(!cache.delete(&post, MatchOptions::default()).await.unwrap());
        assert!(cache.match_all(&post, MatchOptions::default()).await.unwrap().is_empty());
        assert_eq!(cache.match_all(&post, MatchOptions::default().ignore_method()).await.unwrap().len(), 1);
        assert!(cache.delete(&post, MatchOptions::default().ignore_method()).await.unwrap());
    }

    #[tokio::test]
    async fn test_serialized_puts_keep_call_order() {
        let cache = cache();
        let puts = (0..10).map(|i| cache.put(format!("http://h/{i}"), response("x", &[])));
        for result in futures_util::future::join_all(puts).await {
            result.unwrap();
        }

        let urls: Vec<String> = cache.requests().await.unwrap().iter().map(|r| r.uri().to_string()).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("http://h/{i}")).collect();
        assert_eq!(urls, expected);
    }

    #[tokio::test]
    async fn test_unserialized_cache_works() {
        let cache = cache().with_serialized_ops(false);
        cache.put("http://h/x", response("A", &[])).await.unwrap();
        assert!(cache.delete("http://h/x", MatchOptions::default()).await.unwrap());
    }

    #[tokio::test]
    async fn test_dispose() {
        let cache = cache();
        cache.put("http://h/x", response("A", &[])).await.unwrap();
        cache.dispose().await.unwrap();
        cache.dispose().await.unwrap();

        assert!(cache.is_disposed());
        assert!(matches!(cache.put("http://h/x", response("A", &[])).await, Err(Error::Disposed(_))));
        assert!(matches!(cache.match_request("http://h/x", MatchOptions::default()).await, Err(Error::Disposed(_))));
    }

    #[derive(Debug, Default)]
    struct StubFetcher {
        routes: HashMap<String, (u16, &'static str)>,
    }

    impl StubFetcher {
        fn route(mut self, url: &str, status: u16, body: &'static str) -> Self {
            self.routes.insert(url.to_string(), (status, body));
            self
        }
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, request: &Request<()>) -> Result<Response<Body>, Error> {
            let (status, body) = self
                .routes
                .get(&request.uri().to_string())
                .ok_or_else(|| Error::Fetch(format!("no route for {}", request.uri())))?;
            Ok(Response::builder().status(*status).body(Body::from(*body)).unwrap())
        }
    }

    #[tokio::test]
    async fn test_add() {
        let fetcher = StubFetcher::default().route("http://h/ok", 200, "fetched").route("http://h/bad", 404, "nope");
        let cache = cache().with_fetcher(Arc::new(fetcher));

        cache.add("http://h/ok").await.unwrap();
        let hit = cache.match_request("http://h/ok", MatchOptions::default()).await.unwrap();
        assert_eq!(text(hit.unwrap()), "fetched");

        assert!(matches!(cache.add("http://h/bad").await, Err(Error::BadResponse(_))));
        assert!(cache.match_request("http://h/bad", MatchOptions::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_all_is_all_or_nothing() {
        let fetcher = StubFetcher::default()
            .route("http://h/a", 200, "a")
            .route("http://h/b", 200, "b")
            .route("http://h/c", 500, "c");
        let cache = cache().with_fetcher(Arc::new(fetcher));

        assert!(matches!(cache.add_all(["http://h/a", "http://h/c"]).await, Err(Error::BadResponse(_))));
        assert!(cache.requests().await.unwrap().is_empty());

        cache.add_all(["http://h/a", "http://h/b"]).await.unwrap();
        assert_eq!(cache.requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_add_without_fetcher() {
        assert!(matches!(cache().add("http://h/x").await, Err(Error::Fetch(_))));
    }
}
