//! Plain record codec.
//!
//! Converts live requests and responses into flat, serializable records and
//! back. A [`PlainReqRes`] is the unit of storage shared by every backend; its
//! field names are the stored wire format.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::Error;
use crate::message::{Body, ReasonPhrase, RecordId, status_text};

/// Ordered `(name, value)` header pairs; repeated names are kept as separate entries.
pub type HeaderList = Vec<(String, String)>;

/// Look up a header by case-insensitive name, joining repeated values with `", "`.
pub fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    let values: Vec<&str> = headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
        .collect();
    if values.is_empty() { None } else { Some(values.join(", ")) }
}

fn header_list(headers: &HeaderMap) -> HeaderList {
    headers
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
        .collect()
}

fn header_map(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => tracing::debug!(header = %name, "skipping header that is not valid in a live message"),
        }
    }
    map
}

/// Request half of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlainRequest {
    pub url: String,
    pub method: String,
    pub headers: HeaderList,
}

impl PlainRequest {
    /// Capture a live request, stripping the URL fragment.
    pub fn from_http(request: &Request<()>) -> Result<Self, Error> {
        let raw = request.uri().to_string();
        let mut url = Url::parse(&raw).map_err(|e| Error::InvalidUrl(format!("{raw}: {e}")))?;
        url.set_fragment(None);
        Ok(Self { url: url.into(), method: request.method().as_str().to_string(), headers: header_list(request.headers()) })
    }

    /// Rebuild a live request.
    pub fn to_http(&self) -> Result<Request<()>, Error> {
        let mut builder = Request::builder().method(self.method.as_str()).uri(self.url.as_str());
        if let Some(headers) = builder.headers_mut() {
            *headers = header_map(&self.headers);
        }
        builder.body(()).map_err(|e| Error::InvalidUrl(e.to_string()))
    }

    pub fn header(&self, name: &str) -> Option<String> {
        header_value(&self.headers, name)
    }
}

/// Response half of a stored record. `body` is `None` when empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlainResponse {
    pub headers: HeaderList,
    pub status: String,
    pub status_text: String,
    pub body: Option<Vec<u8>>,
}

impl PlainResponse {
    /// Capture a live response, reading its whole body.
    ///
    /// # Errors
    ///
    /// Returns `Error::BodyUsed` if the body was already consumed.
    pub fn from_http(response: &mut Response<Body>) -> Result<Self, Error> {
        let status_text = status_text(response);
        let bytes = response.body_mut().take()?;
        Ok(Self {
            headers: header_list(response.headers()),
            status: response.status().as_u16().to_string(),
            status_text,
            body: if bytes.is_empty() { None } else { Some(bytes.to_vec()) },
        })
    }

    /// Rebuild a live response with a fresh, unread body.
    pub fn to_http(&self) -> Result<Response<Body>, Error> {
        let status: u16 = self
            .status
            .parse()
            .map_err(|_| Error::Codec(format!("invalid stored status: {}", self.status)))?;
        let status = StatusCode::from_u16(status).map_err(|e| Error::Codec(e.to_string()))?;

        let body = self.body.clone().map(Body::from).unwrap_or_default();
        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = header_map(&self.headers);
        if status.canonical_reason() != Some(self.status_text.as_str()) && !self.status_text.is_empty() {
            response.extensions_mut().insert(ReasonPhrase(self.status_text.clone()));
        }
        Ok(response)
    }

    pub fn header(&self, name: &str) -> Option<String> {
        header_value(&self.headers, name)
    }
}

/// Bookkeeping fields of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlainReqResMeta {
    pub id: String,
    /// Epoch milliseconds, as a decimal string.
    pub expires: String,
    /// A [`Created`] stamp.
    pub created: String,
}

/// Creation stamp `"<epochMillis>-<counter>"`.
///
/// The counter disambiguates records created within the same millisecond so
/// stamps from one process are totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Created {
    pub millis: i64,
    pub seq: u32,
}

/// Counter values per millisecond before the clock borrows from the next one.
const SEQ_PER_MILLI: u32 = 1000;

static CLOCK: Mutex<(i64, u32)> = Mutex::new((0, 0));

impl Created {
    /// Next stamp from the process-wide clock. Never repeats and never goes backwards.
    pub fn now() -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let mut clock = CLOCK.lock().unwrap_or_else(PoisonError::into_inner);
        if now > clock.0 {
            *clock = (now, 0);
        } else {
            clock.1 += 1;
            if clock.1 >= SEQ_PER_MILLI {
                *clock = (clock.0 + 1, 0);
            }
        }
        Self { millis: clock.0, seq: clock.1 }
    }

    /// Numeric encoding preserving the stamp order; used as a sorted-set score.
    pub fn score(&self) -> f64 {
        self.millis as f64 * f64::from(SEQ_PER_MILLI) + f64::from(self.seq)
    }
}

impl fmt::Display for Created {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for Created {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Codec(format!("invalid created stamp: {s}"));
        let (millis, seq) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self { millis: millis.parse().map_err(|_| invalid())?, seq: seq.parse().map_err(|_| invalid())? })
    }
}

/// One stored request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainReqRes {
    pub req_url: String,
    pub req_method: String,
    pub req_headers: HeaderList,
    pub res_headers: HeaderList,
    pub res_status: String,
    pub res_status_text: String,
    pub res_body: Option<Vec<u8>>,
    pub id: String,
    pub created: String,
    pub expires: String,
}

impl PlainReqRes {
    pub fn new(request: PlainRequest, response: PlainResponse, meta: PlainReqResMeta) -> Self {
        Self {
            req_url: request.url,
            req_method: request.method,
            req_headers: request.headers,
            res_headers: response.headers,
            res_status: response.status,
            res_status_text: response.status_text,
            res_body: response.body,
            id: meta.id,
            created: meta.created,
            expires: meta.expires,
        }
    }

    pub fn request(&self) -> PlainRequest {
        PlainRequest { url: self.req_url.clone(), method: self.req_method.clone(), headers: self.req_headers.clone() }
    }

    pub fn response(&self) -> PlainResponse {
        PlainResponse {
            headers: self.res_headers.clone(),
            status: self.res_status.clone(),
            status_text: self.res_status_text.clone(),
            body: self.res_body.clone(),
        }
    }

    pub fn meta(&self) -> PlainReqResMeta {
        PlainReqResMeta { id: self.id.clone(), expires: self.expires.clone(), created: self.created.clone() }
    }

    pub fn created_stamp(&self) -> Result<Created, Error> {
        self.created.parse()
    }

    /// Expiry in epoch milliseconds; an unreadable value counts as already expired.
    pub fn expires_at(&self) -> i64 {
        self.expires.parse().unwrap_or(0)
    }

    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expires_at() <= now_millis
    }

    /// Live response for this record, tagged with its [`RecordId`] and with an
    /// `Age` header covering time spent in the cache plus any upstream age.
    pub fn to_live_response(&self, now_millis: i64) -> Result<Response<Body>, Error> {
        let mut response = self.response().to_http()?;
        let upstream_age: u64 = header_value(&self.res_headers, "age")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        let stored_at = self.created_stamp().map(|c| c.millis).unwrap_or(now_millis);
        let in_cache = u64::try_from((now_millis - stored_at).max(0) / 1000).unwrap_or(0);
        response.headers_mut().insert(http::header::AGE, HeaderValue::from(upstream_age + in_cache));
        response.extensions_mut().insert(RecordId(self.id.clone()));
        Ok(response)
    }
}

/// Storage representation of a [`PlainReqRes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Human-readable JSON text.
    Json,
    /// Compact binary encoding.
    #[default]
    Binary,
}

impl Codec {
    pub fn encode(&self, record: &PlainReqRes) -> Result<Vec<u8>, Error> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(record)?),
            Codec::Binary => Ok(bincode::serialize(record)?),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<PlainReqRes, Error> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::Binary => Ok(bincode::deserialize(bytes)?),
        }
    }
}
