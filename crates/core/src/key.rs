//! Persistence key derivation.
//!
//! Keys come in three shapes:
//!
//! - `[namespace, cache]` names a whole cache;
//! - `[namespace, cache, urlHash]` is the index key shared by every response
//!   stored for one request;
//! - `[namespace, cache, urlHash, id]` is the record key of one stored response.
//!
//! The url hash covers the request URL with its query string and fragment
//! cleared, so `?a=1` and `?a=2` land in the same index and are told apart by
//! the matching predicate.

use std::fmt;

use http::Response;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use sha2::{Digest, Sha256};
use url::Url;

use crate::Error;
use crate::message::{Body, RecordId};
use crate::record::PlainReqRes;

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "webcache";

/// Separator between encoded key parts.
pub const SEPARATOR: char = ':';

/// Characters escaped inside an encoded cache name: the separator, the escape
/// character itself, and glob metacharacters so encoded prefixes are safe in
/// pattern scans.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b':')
    .add(b'%')
    .add(b'*')
    .add(b'?')
    .add(b'[')
    .add(b']')
    .add(b'\\')
    .add(b' ');

/// Strip fragment and query string from a URL.
pub fn normalize_url(url: &str) -> Result<Url, Error> {
    let mut parsed = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
    parsed.set_fragment(None);
    parsed.set_query(None);
    Ok(parsed)
}

/// 64-bit content hash of the normalized URL, hex encoded.
pub fn url_hash(url: &str) -> Result<String, Error> {
    let normalized = normalize_url(url)?;
    let digest = Sha256::digest(normalized.as_str().as_bytes());
    Ok(hex::encode(&digest[..8]))
}

/// A 2-, 3- or 4-part persistence key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PersistenceKey {
    namespace: String,
    cache_name: String,
    url_hash: Option<String>,
    id: Option<String>,
}

impl PersistenceKey {
    /// Cache-level key.
    pub fn cache(namespace: &str, cache_name: &str) -> Self {
        Self { namespace: namespace.to_string(), cache_name: cache_name.to_string(), url_hash: None, id: None }
    }

    /// Index key for every response stored under `url`.
    pub fn index(namespace: &str, cache_name: &str, url: &str) -> Result<Self, Error> {
        Ok(Self { url_hash: Some(url_hash(url)?), ..Self::cache(namespace, cache_name) })
    }

    /// Record key for one specific stored response.
    pub fn record(namespace: &str, cache_name: &str, url: &str, id: &str) -> Result<Self, Error> {
        Ok(Self::index(namespace, cache_name, url)?.with_id(id))
    }

    /// Record key of an already stored record.
    pub fn for_record(namespace: &str, cache_name: &str, record: &PlainReqRes) -> Result<Self, Error> {
        Self::record(namespace, cache_name, &record.req_url, &record.id)
    }

    /// Key for a live request, narrowed to one record when the response was
    /// served from the cache and still carries its [`RecordId`].
    pub fn for_response(namespace: &str, cache_name: &str, url: &str, response: &Response<Body>) -> Result<Self, Error> {
        let key = Self::index(namespace, cache_name, url)?;
        Ok(match response.extensions().get::<RecordId>() {
            Some(RecordId(id)) => key.with_id(id),
            None => key,
        })
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// The 3-part index key this key belongs to.
    pub fn index_key(&self) -> Self {
        Self { id: None, ..self.clone() }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn url_hash(&self) -> Option<&str> {
        self.url_hash.as_deref()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Key parts in order.
    pub fn parts(&self) -> Vec<&str> {
        let mut parts = vec![self.namespace.as_str(), self.cache_name.as_str()];
        parts.extend(self.url_hash.as_deref());
        parts.extend(self.id.as_deref());
        parts
    }

    pub fn is_index(&self) -> bool {
        self.url_hash.is_some() && self.id.is_none()
    }

    pub fn is_record(&self) -> bool {
        self.id.is_some()
    }

    /// Text form used by string-keyed stores; the cache name is escaped so the
    /// separator only ever appears between parts.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Prefix shared by every index and record key of one cache.
    pub fn cache_prefix(namespace: &str, cache_name: &str) -> String {
        format!("{}{SEPARATOR}", Self::cache(namespace, cache_name).encode())
    }

    /// Parse a key produced by [`encode`](Self::encode).
    pub fn decode(encoded: &str) -> Option<Self> {
        let mut parts = encoded.split(SEPARATOR);
        let namespace = parts.next()?.to_string();
        let cache_name = percent_decode_str(parts.next()?).decode_utf8().ok()?.into_owned();
        let url_hash = parts.next().map(str::to_string);
        let id = parts.next().map(str::to_string);
        if parts.next().is_some() || (url_hash.is_none() && id.is_some()) {
            return None;
        }
        Some(Self { namespace, cache_name, url_hash, id })
    }
}

impl fmt::Display for PersistenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.namespace, utf8_percent_encode(&self.cache_name, SEGMENT))?;
        if let Some(hash) = &self.url_hash {
            write!(f, "{SEPARATOR}{hash}")?;
        }
        if let Some(id) = &self.id {
            write!(f, "{SEPARATOR}{id}")?;
        }
        Ok(())
    }
}
