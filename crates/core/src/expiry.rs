//! Time-to-live computation from response freshness headers.
//!
//! `s-maxage` wins over `max-age`; both are corrected by the response's age
//! (the larger of the `Date`-derived age and the `Age` header). Without either
//! directive an `Expires` date is used. Responses carrying neither are cached
//! for the maximum TTL. Every result is clamped to `[0, max_ttl]`; zero means
//! the response is already stale and must not be stored.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::record::header_value;

/// Default ceiling for any computed TTL (30 days).
pub const MAX_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim()).ok().map(|d| d.with_timezone(&Utc))
}

/// Seconds given by a `Cache-Control` directive, e.g. `max-age=60`.
fn directive_seconds(cache_control: &str, name: &str) -> Option<i64> {
    cache_control.split(',').find_map(|directive| {
        let (key, value) = directive.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case(name) {
            return None;
        }
        value.trim().trim_matches('"').parse().ok()
    })
}

fn clamp(millis: i64, max_ttl: Duration) -> Duration {
    let millis = u64::try_from(millis.max(0)).unwrap_or(0);
    Duration::from_millis(millis).min(max_ttl)
}

/// TTL for a response with the given headers, as seen at `now`.
pub fn expires_in(headers: &[(String, String)], now: DateTime<Utc>, max_ttl: Duration) -> Duration {
    let now_ms = now.timestamp_millis();

    if let Some(cache_control) = header_value(headers, "cache-control") {
        let max_age =
            directive_seconds(&cache_control, "s-maxage").or_else(|| directive_seconds(&cache_control, "max-age"));
        if let Some(max_age) = max_age {
            let date_age_ms = header_value(headers, "date")
                .and_then(|d| parse_http_date(&d))
                .map(|date| now_ms - date.timestamp_millis())
                .unwrap_or(0);
            let age_header_ms = header_value(headers, "age")
                .and_then(|a| a.trim().parse::<i64>().ok())
                .unwrap_or(0)
                .saturating_mul(1000);
            let corrected_age_ms = date_age_ms.max(age_header_ms);
            return clamp(max_age.saturating_mul(1000).saturating_sub(corrected_age_ms), max_ttl);
        }
    }

    if let Some(expires) = header_value(headers, "expires") {
        // An unparseable Expires value means "already expired".
        return match parse_http_date(&expires) {
            Some(at) => clamp(at.timestamp_millis() - now_ms, max_ttl),
            None => Duration::ZERO,
        };
    }

    max_ttl
}
