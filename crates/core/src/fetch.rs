//! Network fetching for `Cache::add` and `Cache::add_all`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::{Request, Response};
use reqwest::Client;

use crate::Error;
use crate::message::Body;

/// Produces a live response for a request.
#[async_trait]
pub trait Fetcher: Send + Sync + std::fmt::Debug {
    async fn fetch(&self, request: &Request<()>) -> Result<Response<Body>, Error>;
}

/// Configuration for [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// User agent string (default: "webcache/0.1")
    pub user_agent: String,

    /// Maximum response body size in bytes (default: 5MB)
    pub max_bytes: usize,

    /// Request timeout (default: 20s)
    pub timeout: Duration,

    /// Maximum number of redirects to follow (default: 5)
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "webcache/0.1".to_string(),
            max_bytes: 5 * 1024 * 1024,
            timeout: Duration::from_millis(20000),
            max_redirects: 5,
        }
    }
}

/// [`Fetcher`] over a reqwest client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    http: Client,
    config: FetchConfig,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| Error::Fetch(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request<()>) -> Result<Response<Body>, Error> {
        let start = Instant::now();
        let url = request.uri().to_string();

        let response = self
            .http
            .request(request.method().clone(), &url)
            .headers(request.headers().clone())
            .send()
            .await
            .map_err(|e| Error::Fetch(format!("network error: {}", e)))?;

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_bytes
        {
            return Err(Error::Fetch(format!("{} bytes exceeds {}", len, self.config.max_bytes)));
        }

        let status = response.status();
        let version = response.version();
        let headers = response.headers().clone();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Fetch(format!("failed to read response: {}", e)))?;

        if bytes.len() > self.config.max_bytes {
            return Err(Error::Fetch(format!("{} bytes exceeds {}", bytes.len(), self.config.max_bytes)));
        }

        let fetch_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(url = %url, status = status.as_u16(), bytes = bytes.len(), fetch_ms, "fetched");

        let mut live = Response::new(Body::from(bytes));
        *live.status_mut() = status;
        *live.version_mut() = version;
        *live.headers_mut() = headers;
        Ok(live)
    }
}
