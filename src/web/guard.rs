//! Request gate checks: automation screening and client identity.

use axum::http::{HeaderMap, header};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{RelayError, RelayResult};

/// Shorter User-Agent values than this are treated as automation; every
/// real browser identity is far longer.
pub const MIN_USER_AGENT_LEN: usize = 10;

/// Tools that should not be pulling streams through the relay.
static AUTOMATION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // Command-line fetchers and HTTP libraries
        Regex::new(r"(?i)(curl|wget|python-requests|python-urllib|go-http-client|libwww)")
            .unwrap(),
        Regex::new(r"(?i)(scrapy|aiohttp|okhttp|httpclient|java/)").unwrap(),
        // Headless browsers and drivers
        Regex::new(r"(?i)(headlesschrome|phantomjs|selenium|puppeteer|playwright)").unwrap(),
        // Generic crawler tokens
        Regex::new(r"(?i)(bot|crawler|spider|scraper)").unwrap(),
    ]
});

/// Validate the inbound User-Agent and return it for upstream forwarding.
///
/// Missing, too-short, and automation-matching values are all rejected the
/// same way so callers cannot probe which check tripped.
pub fn validate_user_agent(headers: &HeaderMap) -> RelayResult<String> {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("");

    if user_agent.len() < MIN_USER_AGENT_LEN {
        return Err(RelayError::AutomatedClient);
    }
    if AUTOMATION_PATTERNS.iter().any(|p| p.is_match(user_agent)) {
        return Err(RelayError::AutomatedClient);
    }

    Ok(user_agent.to_string())
}

/// Resolve the client identity used as the rate-limit key.
///
/// Trusted-proxy header first, then the real-IP header, then the first hop
/// of the forwarded chain. "unknown" lumps every unidentified caller into
/// one bucket, which fails safe for rate limiting.
pub fn resolve_client(headers: &HeaderMap) -> String {
    for name in ["cf-connecting-ip", "x-real-ip"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let value = value.trim();
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }

    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const BROWSER_UA: &str =
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15) AppleWebKit/605.1.15 Safari/605.1.15";

    fn headers_with_ua(ua: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_str(ua).unwrap());
        headers
    }

    #[test]
    fn accepts_a_browser_user_agent() {
        let ua = validate_user_agent(&headers_with_ua(BROWSER_UA)).unwrap();
        assert_eq!(ua, BROWSER_UA);
    }

    #[test]
    fn rejects_missing_and_short_user_agents() {
        assert!(validate_user_agent(&HeaderMap::new()).is_err());
        assert!(validate_user_agent(&headers_with_ua("Mozilla")).is_err());
    }

    #[test]
    fn rejects_automation_tools() {
        for ua in [
            "curl/8.4.0 (x86_64-pc-linux-gnu)",
            "Wget/1.21.2 (linux-gnu)",
            "python-requests/2.31.0",
            "Googlebot/2.1 (+http://www.google.com/bot.html)",
            "Mozilla/5.0 (X11; Linux x86_64) HeadlessChrome/119.0.0.0",
            "axios scraper v1.0 automation",
        ] {
            assert!(
                validate_user_agent(&headers_with_ua(ua)).is_err(),
                "{ua} should be rejected"
            );
        }
    }

    #[test]
    fn client_resolution_priority() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("3.3.3.3, 4.4.4.4"));
        headers.insert("x-real-ip", HeaderValue::from_static("2.2.2.2"));
        headers.insert("cf-connecting-ip", HeaderValue::from_static("1.1.1.1"));
        assert_eq!(resolve_client(&headers), "1.1.1.1");

        headers.remove("cf-connecting-ip");
        assert_eq!(resolve_client(&headers), "2.2.2.2");

        headers.remove("x-real-ip");
        assert_eq!(resolve_client(&headers), "3.3.3.3");

        headers.remove("x-forwarded-for");
        assert_eq!(resolve_client(&headers), "unknown");
    }
}
