//! HTTP middleware for cross-cutting concerns.

use axum::{
    extract::Request,
    http::{Method, Uri},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::{info, warn};

/// Request logging middleware with per-request IDs and timing.
pub async fn request_logging(method: Method, uri: Uri, request: Request, next: Next) -> Response {
    let start = Instant::now();
    let request_id = uuid::Uuid::new_v4().to_string();

    let response = next.run(request).await;
    let status = response.status().as_u16();
    let duration = start.elapsed();

    if status >= 400 {
        warn!(
            method = %method,
            path = uri.path(),
            status = status,
            request_id = %request_id,
            duration_ms = duration.as_millis() as u64,
            "request completed with error"
        );
    } else {
        info!(
            method = %method,
            path = uri.path(),
            status = status,
            request_id = %request_id,
            duration_ms = duration.as_millis() as u64,
            "request completed"
        );
    }

    response
}
