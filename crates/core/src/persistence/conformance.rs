//! Contract checks shared by the backend test suites.

use std::sync::Arc;
use std::time::Duration;

use futures_util::TryStreamExt;

use super::{Persistence, PersistenceFactory};
use crate::record::{PlainReqRes, PlainRequest, PlainResponse};

/// Route test logs through the test harness; `RUST_LOG` picks the level.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn pair(url: &str, cache_control: &str, body: &str) -> (PlainRequest, PlainResponse) {
    (
        PlainRequest { url: url.to_string(), method: "GET".into(), headers: vec![] },
        PlainResponse {
            headers: vec![("cache-control".into(), cache_control.to_string())],
            status: "200".into(),
            status_text: "OK".into(),
            body: Some(body.as_bytes().to_vec()),
        },
    )
}

fn bodies(records: &[PlainReqRes]) -> Vec<String> {
    records
        .iter()
        .map(|r| String::from_utf8_lossy(r.res_body.as_deref().unwrap_or_default()).into_owned())
        .collect()
}

pub(crate) async fn get_is_newest_first(backend: Arc<dyn Persistence>) {
    for body in ["one", "two", "three"] {
        let (req, res) = pair("http://h/x", "max-age=60", body);
        assert!(backend.put("v1", &req, &res).await.unwrap());
    }
    let (other_req, other_res) = pair("http://h/other", "max-age=60", "other");
    backend.put("v1", &other_req, &other_res).await.unwrap();

    let (query, _) = pair("http://h/x?ignored=1", "", "");
    let records: Vec<PlainReqRes> = backend.get("v1", &query).try_collect().await.unwrap();
    assert_eq!(bodies(&records), vec!["three", "two", "one"]);
}

pub(crate) async fn iter_is_oldest_first(backend: Arc<dyn Persistence>) {
    for (url, body) in [("http://h/a", "a1"), ("http://h/b", "b1"), ("http://h/a", "a2"), ("http://h/c", "c1")] {
        let (req, res) = pair(url, "max-age=60", body);
        backend.put("v1", &req, &res).await.unwrap();
    }
    let (req, res) = pair("http://h/a", "max-age=60", "elsewhere");
    backend.put("v2", &req, &res).await.unwrap();

    let records: Vec<PlainReqRes> = backend.iter("v1").try_collect().await.unwrap();
    assert_eq!(bodies(&records), vec!["a1", "b1", "a2", "c1"]);
}

pub(crate) async fn delete_one_keeps_siblings(backend: Arc<dyn Persistence>) {
    let (req, res) = pair("http://h/x", "max-age=60", "first");
    backend.put("v1", &req, &res).await.unwrap();
    let (_, res2) = pair("http://h/x", "max-age=60", "second");
    backend.put("v1", &req, &res2).await.unwrap();

    let records: Vec<PlainReqRes> = backend.get("v1", &req).try_collect().await.unwrap();
    let newest = &records[0];
    assert!(backend.delete("v1", &req, Some(&newest.id)).await.unwrap());
    assert!(!backend.delete("v1", &req, Some(&newest.id)).await.unwrap());

    let remaining: Vec<PlainReqRes> = backend.get("v1", &req).try_collect().await.unwrap();
    assert_eq!(bodies(&remaining), vec!["first"]);
    assert_eq!(backend.keys().await.unwrap(), vec!["v1".to_string()]);
}

pub(crate) async fn delete_all_removes_index(backend: Arc<dyn Persistence>) {
    for body in ["one", "two"] {
        let (req, res) = pair("http://h/x", "max-age=60", body);
        backend.put("v1", &req, &res).await.unwrap();
    }
    let (req, _) = pair("http://h/x", "", "");
    assert!(backend.delete("v1", &req, None).await.unwrap());
    assert!(!backend.delete("v1", &req, None).await.unwrap());

    let remaining: Vec<PlainReqRes> = backend.iter("v1").try_collect().await.unwrap();
    assert!(remaining.is_empty());
    assert!(backend.keys().await.unwrap().is_empty());
}

pub(crate) async fn stale_response_refused(backend: Arc<dyn Persistence>) {
    let (req, res) = pair("http://h/x", "max-age=0", "stale");
    assert!(!backend.put("v1", &req, &res).await.unwrap());
    let records: Vec<PlainReqRes> = backend.get("v1", &req).try_collect().await.unwrap();
    assert!(records.is_empty());
    assert!(backend.keys().await.unwrap().is_empty());
}

pub(crate) async fn expired_records_hidden(backend: Arc<dyn Persistence>) {
    let (req, short) = pair("http://h/x", "max-age=1", "short");
    backend.put("v1", &req, &short).await.unwrap();
    let (_, long) = pair("http://h/x", "max-age=60", "long");
    backend.put("v1", &req, &long).await.unwrap();

    let records: Vec<PlainReqRes> = backend.get("v1", &req).try_collect().await.unwrap();
    assert_eq!(records.len(), 2);

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let records: Vec<PlainReqRes> = backend.get("v1", &req).try_collect().await.unwrap();
    assert_eq!(bodies(&records), vec!["long"]);
    let records: Vec<PlainReqRes> = backend.iter("v1").try_collect().await.unwrap();
    assert_eq!(bodies(&records), vec!["long"]);
}

pub(crate) async fn keys_lists_caches(backend: Arc<dyn Persistence>) {
    assert!(backend.keys().await.unwrap().is_empty());
    for cache in ["beta", "alpha", "with:colon"] {
        let (req, res) = pair("http://h/x", "max-age=60", cache);
        backend.put(cache, &req, &res).await.unwrap();
    }
    let mut names = backend.keys().await.unwrap();
    names.sort();
    assert_eq!(names, vec!["alpha".to_string(), "beta".to_string(), "with:colon".to_string()]);
}

/// A cache whose records all expired after its handle was disposed is gone
/// from the factory's view and from a fresh handle's reads.
pub(crate) async fn expired_cache_forgotten_after_dispose(factory: Arc<dyn PersistenceFactory>) {
    let writer = factory.create("short").await.unwrap();
    let (req, res) = pair("http://h/x", "max-age=1", "short");
    assert!(writer.put("short", &req, &res).await.unwrap());
    writer.dispose().await.unwrap();
    assert_eq!(factory.discover().await.unwrap(), vec!["short".to_string()]);

    tokio::time::sleep(Duration::from_millis(1300)).await;

    assert!(factory.discover().await.unwrap().is_empty());
    let reader = factory.create("short").await.unwrap();
    assert_eq!(reader.iter("short").try_collect::<Vec<_>>().await.unwrap().len(), 0);
    assert!(reader.keys().await.unwrap().is_empty());
}
