//! Rate-limit response header parsing
//!
//! The upstream reports its quota in `X-RateLimit-{Limit,Remaining,Reset,
//! Used}` headers; every parsed snapshot is handed to the registered
//! callback so the adaptive limiter can follow the remote budget.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;

use crate::resilience::RateLimitSnapshot;

const LIMIT: &str = "X-RateLimit-Limit";
const REMAINING: &str = "X-RateLimit-Remaining";
const RESET: &str = "X-RateLimit-Reset";
const USED: &str = "X-RateLimit-Used";

/// Invoked with every snapshot parsed off a response.
pub type RateLimitCallback = Arc<dyn Fn(RateLimitSnapshot) + Send + Sync>;

/// Parses the rate-limit headers into a snapshot.
///
/// Returns `None` unless limit, remaining, and reset are all present and
/// well-formed; `used` defaults to `limit - remaining` when absent.
pub fn parse_rate_limit_headers(headers: &HeaderMap) -> Option<RateLimitSnapshot> {
    let limit: u64 = header_u64(headers, LIMIT)?;
    let remaining: u64 = header_u64(headers, REMAINING)?;
    let reset_epoch: i64 = header_u64(headers, RESET)? as i64;
    let used = header_u64(headers, USED).unwrap_or(limit.saturating_sub(remaining));

    let reset: DateTime<Utc> = Utc.timestamp_opt(reset_epoch, 0).single()?;

    Some(RateLimitSnapshot {
        limit,
        remaining,
        reset,
        used,
    })
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(limit: &str, remaining: &str, reset: &str, used: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(LIMIT, HeaderValue::from_str(limit).unwrap());
        h.insert(REMAINING, HeaderValue::from_str(remaining).unwrap());
        h.insert(RESET, HeaderValue::from_str(reset).unwrap());
        if let Some(used) = used {
            h.insert(USED, HeaderValue::from_str(used).unwrap());
        }
        h
    }

    #[test]
    fn test_parses_complete_headers() {
        let reset = (Utc::now().timestamp() + 60).to_string();
        let snapshot =
            parse_rate_limit_headers(&headers("5000", "400", &reset, Some("4600"))).unwrap();

        assert_eq!(snapshot.limit, 5000);
        assert_eq!(snapshot.remaining, 400);
        assert_eq!(snapshot.used, 4600);
    }

    #[test]
    fn test_used_defaults_to_limit_minus_remaining() {
        let reset = (Utc::now().timestamp() + 60).to_string();
        let snapshot = parse_rate_limit_headers(&headers("100", "30", &reset, None)).unwrap();
        assert_eq!(snapshot.used, 70);
    }

    #[test]
    fn test_missing_headers_yield_none() {
        let mut h = HeaderMap::new();
        h.insert(LIMIT, HeaderValue::from_static("5000"));
        assert!(parse_rate_limit_headers(&h).is_none());
    }

    #[test]
    fn test_garbage_headers_yield_none() {
        let h = headers("many", "400", "soon", None);
        assert!(parse_rate_limit_headers(&h).is_none());
    }
}
