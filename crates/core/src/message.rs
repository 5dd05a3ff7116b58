//! Live request/response values exchanged with the cache.
//!
//! Requests are plain `http::Request<()>` values. Responses carry a [`Body`]
//! that can be read exactly once, mirroring a streamed body: a response whose
//! body was already taken cannot be stored.

use bytes::Bytes;
use http::{Method, Request, Response};
use url::Url;

use crate::Error;

/// Response body that remembers whether it has been read.
#[derive(Debug, Default)]
pub struct Body {
    bytes: Option<Bytes>,
    used: bool,
}

impl Body {
    /// An empty body.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the body has already been consumed.
    pub fn is_used(&self) -> bool {
        self.used
    }

    /// Whether the body carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.as_ref().is_none_or(Bytes::is_empty)
    }

    /// Take the body bytes, marking the body as used.
    ///
    /// # Errors
    ///
    /// Returns `Error::BodyUsed` if the body was already taken.
    pub fn take(&mut self) -> Result<Bytes, Error> {
        if self.used {
            return Err(Error::BodyUsed);
        }
        self.used = true;
        Ok(self.bytes.take().unwrap_or_default())
    }

    /// Take the body and decode it as UTF-8 (lossy).
    pub fn text(&mut self) -> Result<String, Error> {
        let bytes = self.take()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self { bytes: Some(bytes), used: false }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Bytes::from(text).into()
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Bytes::from_static(text.as_bytes()).into()
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Self {
        Bytes::from_static(bytes).into()
    }
}

/// Id of the stored record a response was served from.
///
/// Attached as a response extension by `Cache::match_request` and friends so
/// the exact record can be addressed again later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordId(pub String);

/// Status text that differs from the canonical reason phrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonPhrase(pub String);

/// Status text for a response: the [`ReasonPhrase`] extension when present,
/// otherwise the canonical reason.
pub fn status_text(response: &Response<Body>) -> String {
    response
        .extensions()
        .get::<ReasonPhrase>()
        .map(|r| r.0.clone())
        .or_else(|| response.status().canonical_reason().map(str::to_string))
        .unwrap_or_default()
}

/// Conversion into a cache request.
///
/// Strings and URLs become `GET` requests; URL fragments are always dropped.
pub trait IntoCacheRequest {
    fn into_cache_request(self) -> Result<Request<()>, Error>;
}

impl IntoCacheRequest for Url {
    fn into_cache_request(mut self) -> Result<Request<()>, Error> {
        self.set_fragment(None);
        Request::builder()
            .method(Method::GET)
            .uri(self.as_str())
            .body(())
            .map_err(|e| Error::InvalidUrl(e.to_string()))
    }
}

impl IntoCacheRequest for &Url {
    fn into_cache_request(self) -> Result<Request<()>, Error> {
        self.clone().into_cache_request()
    }
}

impl IntoCacheRequest for &str {
    fn into_cache_request(self) -> Result<Request<()>, Error> {
        let url = Url::parse(self.trim()).map_err(|e| Error::InvalidUrl(format!("{self}: {e}")))?;
        url.into_cache_request()
    }
}

impl IntoCacheRequest for String {
    fn into_cache_request(self) -> Result<Request<()>, Error> {
        self.as_str().into_cache_request()
    }
}

impl IntoCacheRequest for &String {
    fn into_cache_request(self) -> Result<Request<()>, Error> {
        self.as_str().into_cache_request()
    }
}

impl IntoCacheRequest for Request<()> {
    fn into_cache_request(self) -> Result<Request<()>, Error> {
        Ok(self)
    }
}

impl IntoCacheRequest for &Request<()> {
    fn into_cache_request(self) -> Result<Request<()>, Error> {
        let mut builder = Request::builder().method(self.method().clone()).uri(self.uri().clone());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(self.headers().iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        builder.body(()).map_err(|e| Error::InvalidUrl(e.to_string()))
    }
}
