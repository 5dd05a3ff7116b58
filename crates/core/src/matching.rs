//! Matching a query request against a stored request/response pair.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::record::{PlainReqRes, PlainRequest, PlainResponse, header_value};

/// Options recognized by the query methods of [`Cache`](crate::Cache).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOptions {
    /// Match stored requests regardless of their method.
    #[serde(default)]
    pub ignore_method: bool,
    /// Compare URLs without their query string.
    #[serde(default)]
    pub ignore_search: bool,
    /// Skip `Vary` header comparison.
    #[serde(default)]
    pub ignore_vary: bool,
}

impl MatchOptions {
    pub fn ignore_method(mut self) -> Self {
        self.ignore_method = true;
        self
    }

    pub fn ignore_search(mut self) -> Self {
        self.ignore_search = true;
        self
    }

    pub fn ignore_vary(mut self) -> Self {
        self.ignore_vary = true;
        self
    }
}

/// Reduces a header value to a coarser bucket before `Vary` comparison.
///
/// Called with the header name and its value (`None` when absent). Two values
/// that normalize to the same result are considered equal.
pub type HeaderNormalizer = Arc<dyn Fn(&str, Option<&str>) -> Option<String> + Send + Sync>;

/// Normalizer that keeps every value as is.
pub fn identity_normalizer() -> HeaderNormalizer {
    Arc::new(|_: &str, value: Option<&str>| value.map(str::to_string))
}

fn comparison_url(url: &str, ignore_search: bool) -> Option<String> {
    let mut parsed = Url::parse(url).ok()?;
    parsed.set_fragment(None);
    if ignore_search {
        parsed.set_query(None);
    }
    Some(parsed.into())
}

/// Whether the stored pair answers `query`.
///
/// The stored request must be a `GET` (unless `ignore_method`), its URL must
/// equal the query URL with fragments dropped (and query strings too with
/// `ignore_search`), and every header named in the stored response's `Vary`
/// must normalize to the same value on both requests (unless `ignore_vary`).
pub fn matches(
    query: &PlainRequest, stored_request: &PlainRequest, stored_response: Option<&PlainResponse>, options: MatchOptions,
    normalize: &HeaderNormalizer,
) -> bool {
    if !options.ignore_method && !stored_request.method.eq_ignore_ascii_case("GET") {
        return false;
    }

    let (Some(query_url), Some(stored_url)) = (
        comparison_url(&query.url, options.ignore_search),
        comparison_url(&stored_request.url, options.ignore_search),
    ) else {
        return false;
    };
    if query_url != stored_url {
        return false;
    }

    let Some(response) = stored_response else {
        return true;
    };
    if options.ignore_vary {
        return true;
    }
    let Some(vary) = header_value(&response.headers, "vary") else {
        return true;
    };

    vary.split(',').map(str::trim).filter(|f| !f.is_empty()).all(|field| {
        if field == "*" {
            return false;
        }
        let stored = normalize(field, stored_request.header(field).as_deref());
        let queried = normalize(field, query.header(field).as_deref());
        stored == queried
    })
}

/// [`matches`] against a stored record.
pub fn matches_record(query: &PlainRequest, record: &PlainReqRes, options: MatchOptions, normalize: &HeaderNormalizer) -> bool {
    let headers_only = PlainResponse {
        headers: record.res_headers.clone(),
        status: record.res_status.clone(),
        status_text: record.res_status_text.clone(),
        body: None,
    };
    matches(query, &record.request(), Some(&headers_only), options, normalize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str, method: &str, headers: &[(&str, &str)]) -> PlainRequest {
        PlainRequest {
            url: url.to_string(),
            method: method.to_string(),
            headers: headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    fn response(vary: Option<&str>) -> PlainResponse {
        PlainResponse {
            headers: vary.map(|v| vec![("vary".to_string(), v.to_string())]).unwrap_or_default(),
            status: "200".into(),
            status_text: "OK".into(),
            body: None,
        }
    }

    fn check(query: &PlainRequest, stored: &PlainRequest, res: Option<&PlainResponse>, options: MatchOptions) -> bool {
        matches(query, stored, res, options, &identity_normalizer())
    }

    #[test]
    fn test_fragment_is_ignored() {
        let stored = request("http://h/x", "GET", &[]);
        assert!(check(&request("http://h/x#frag", "GET", &[]), &stored, None, MatchOptions::default()));
    }

    #[test]
    fn test_search_sensitivity() {
        let stored = request("http://h/x", "GET", &[]);
        let query = request("http://h/x?a=1", "GET", &[]);
        assert!(!check(&query, &stored, None, MatchOptions::default()));
        assert!(check(&query, &stored, None, MatchOptions::default().ignore_search()));
    }

    #[test]
    fn test_stored_method_must_be_get() {
        let stored = request("http://h/x", "POST", &[]);
        let query = request("http://h/x", "GET", &[]);
        assert!(!check(&query, &stored, None, MatchOptions::default()));
        assert!(check(&query, &stored, None, MatchOptions::default().ignore_method()));
    }

    #[test]
    fn test_vary_compares_headers() {
        let stored = request("http://h/x", "GET", &[("accept-encoding", "gzip")]);
        let res = response(Some("Accept-Encoding"));
        let gzip = request("http://h/x", "GET", &[("Accept-Encoding", "gzip")]);
        let deflate = request("http://h/x", "GET", &[("accept-encoding", "deflate")]);
        let absent = request("http://h/x", "GET", &[]);

        assert!(check(&gzip, &stored, Some(&res), MatchOptions::default()));
        assert!(!check(&deflate, &stored, Some(&res), MatchOptions::default()));
        assert!(!check(&absent, &stored, Some(&res), MatchOptions::default()));
        assert!(check(&deflate, &stored, Some(&res), MatchOptions::default().ignore_vary()));
    }

    #[test]
    fn test_vary_lists_every_field() {
        let stored = request("http://h/x", "GET", &[("a", "1"), ("b", "2")]);
        let res = response(Some("a, b"));
        assert!(check(&request("http://h/x", "GET", &[("a", "1"), ("b", "2")]), &stored, Some(&res), MatchOptions::default()));
        assert!(!check(&request("http://h/x", "GET", &[("a", "1"), ("b", "3")]), &stored, Some(&res), MatchOptions::default()));
    }

    #[test]
    fn test_vary_wildcard_never_matches() {
        let stored = request("http://h/x", "GET", &[]);
        let res = response(Some("*"));
        assert!(!check(&request("http://h/x", "GET", &[]), &stored, Some(&res), MatchOptions::default()));
    }

    #[test]
    fn test_normalizer_buckets_values() {
        let by_device: HeaderNormalizer = Arc::new(|name: &str, value: Option<&str>| {
            if name.eq_ignore_ascii_case("user-agent") {
                value.map(|v| if v.contains("Mobile") { "mobile".into() } else { "desktop".into() })
            } else {
                value.map(str::to_string)
            }
        });
        let stored = request("http://h/x", "GET", &[("user-agent", "Firefox/1 Mobile")]);
        let res = response(Some("user-agent"));
        let query = request("http://h/x", "GET", &[("user-agent", "Chrome/2 Mobile")]);

        assert!(!check(&query, &stored, Some(&res), MatchOptions::default()));
        assert!(matches(&query, &stored, Some(&res), MatchOptions::default(), &by_device));
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: MatchOptions = serde_json::from_str(r#"{"ignore_search": true}"#).unwrap();
        assert_eq!(options, MatchOptions::default().ignore_search());
    }
}
