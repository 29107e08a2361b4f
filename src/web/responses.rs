//! Response composition helpers: CORS, rate-limit headers, and the JSON
//! error envelope every failure is reported through.

use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

use crate::errors::RelayError;
use crate::services::RateLimitVerdict;
use crate::upstream::fetch::{FetchError, LastFailure};

const ALLOW_METHODS: &str = "GET, HEAD, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, Range, Accept, Origin, User-Agent";
const EXPOSE_HEADERS: &str =
    "Content-Length, Content-Range, Accept-Ranges, X-RateLimit-Remaining, X-RateLimit-Reset";

/// Attach the CORS headers every relay response carries. Browser video
/// elements issue range requests cross-origin, so Range and its response
/// counterparts must be explicitly allowed and exposed.
pub fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(EXPOSE_HEADERS),
    );
}

/// Attach remaining-quota and reset-time headers from a limiter verdict.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, verdict: &RateLimitVerdict) {
    let (remaining, reset_in) = match verdict {
        RateLimitVerdict::Allowed {
            remaining,
            reset_in,
        } => (*remaining, *reset_in),
        RateLimitVerdict::Blocked { retry_after } => (0, *retry_after),
    };

    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", value);
    }
    let reset_epoch = chrono::Utc::now().timestamp() + reset_in.as_secs() as i64;
    if let Ok(value) = HeaderValue::from_str(&reset_epoch.to_string()) {
        headers.insert("x-ratelimit-reset", value);
    }
}

/// Uniform JSON error body with CORS attached.
pub fn json_error(status: StatusCode, message: &str) -> Response {
    let mut response = (status, Json(serde_json::json!({ "error": message }))).into_response();
    apply_cors(response.headers_mut());
    response
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match self {
            RelayError::Validation { message } => {
                json_error(StatusCode::BAD_REQUEST, &message)
            }
            RelayError::AutomatedClient => {
                json_error(StatusCode::BAD_REQUEST, "automated requests not allowed")
            }
            RelayError::RateLimited {
                client,
                retry_after,
            } => {
                warn!(client = %client, retry_after_secs = retry_after.as_secs(), "rate limited");
                let retry_secs = retry_after.as_secs().max(1);
                let mut response =
                    json_error(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
                if let Ok(value) = HeaderValue::from_str(&retry_secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                apply_rate_limit_headers(
                    response.headers_mut(),
                    &RateLimitVerdict::Blocked { retry_after },
                );
                response
            }
            RelayError::Fetch(FetchError::Exhausted { url, last }) => {
                warn!(url = %url, last = %last, "upstream unreachable");
                match last {
                    LastFailure::Timeout => {
                        json_error(StatusCode::REQUEST_TIMEOUT, "upstream request timed out")
                    }
                    LastFailure::Network(_) => json_error(
                        StatusCode::BAD_GATEWAY,
                        "failed to connect to upstream",
                    ),
                    // The upstream spoke HTTP; let its verdict through.
                    LastFailure::Status(status) => {
                        json_error(status, &format!("upstream returned {status}"))
                    }
                }
            }
            RelayError::Fetch(FetchError::Cancelled) => {
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "request cancelled")
            }
            RelayError::Internal { message } => {
                error!(message = %message, "internal relay error");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}
