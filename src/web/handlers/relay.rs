//! The relay endpoint.
//!
//! One handler implements the whole request path: validate, resolve the
//! client, consult the rate limiter, fetch through the strategy ladder,
//! then compose the response. Playlists and subtitles are buffered and
//! transformed; everything else streams through untouched so range-based
//! seeking keeps working in the consuming player.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::errors::{RelayError, RelayResult};
use crate::models::{RelayQuery, RelayRequest};
use crate::services::RateLimitVerdict;
use crate::streaming::classify::{ContentKind, SubtitleFormat};
use crate::streaming::rewrite::{RewriteContext, rewrite_manifest};
use crate::upstream::strategy;
use crate::upstream::transport::{UpstreamBody, UpstreamResponse};
use crate::utils::UrlUtils;
use crate::web::AppState;
use crate::web::guard;
use crate::web::responses::{apply_cors, apply_rate_limit_headers};

/// GET/HEAD handler for the relay route.
pub async fn relay(
    State(state): State<AppState>,
    Query(params): Query<RelayQuery>,
    headers: HeaderMap,
) -> RelayResult<Response> {
    let request = build_relay_request(&params, &headers)?;

    let verdict = match state.limiter.check(&request.client).await {
        RateLimitVerdict::Blocked { retry_after } => {
            return Err(RelayError::RateLimited {
                client: request.client,
                retry_after,
            });
        }
        allowed => allowed,
    };

    info!(
        target = %UrlUtils::obfuscate_tokens(request.target.as_str()),
        source = request.source.as_deref().unwrap_or("-"),
        client = %request.client,
        "relaying upstream resource"
    );

    // From here on the limiter verdict is known, so even failure responses
    // carry current quota headers.
    let mut response = match fetch_and_compose(&state, &request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };
    apply_cors(response.headers_mut());
    apply_rate_limit_headers(response.headers_mut(), &verdict);
    Ok(response)
}

async fn fetch_and_compose(state: &AppState, request: &RelayRequest) -> RelayResult<Response> {
    let strategies = strategy::strategies(request.target.as_str(), request.source.as_deref());
    let upstream = state
        .fetcher
        .fetch(request, &strategies, &state.shutdown)
        .await?;
    compose_response(state, request, upstream).await
}

/// OPTIONS handler. Preflights pass through the limiter like any other
/// request so the browser always sees current quota headers.
pub async fn relay_preflight(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> RelayResult<Response> {
    let client = guard::resolve_client(&headers);
    let verdict = match state.limiter.check(&client).await {
        RateLimitVerdict::Blocked { retry_after } => {
            return Err(RelayError::RateLimited {
                client,
                retry_after,
            });
        }
        allowed => allowed,
    };

    let mut response = StatusCode::NO_CONTENT.into_response();
    apply_cors(response.headers_mut());
    apply_rate_limit_headers(response.headers_mut(), &verdict);
    Ok(response)
}

fn build_relay_request(params: &RelayQuery, headers: &HeaderMap) -> RelayResult<RelayRequest> {
    let raw_url = params
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| RelayError::validation("missing required 'url' parameter"))?;
    let target = UrlUtils::parse_absolute(raw_url).map_err(RelayError::validation)?;

    let user_agent = guard::validate_user_agent(headers)?;
    let client = guard::resolve_client(headers);
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Ok(RelayRequest {
        target,
        source: params.source.clone(),
        range,
        user_agent,
        client,
    })
}

async fn compose_response(
    state: &AppState,
    request: &RelayRequest,
    upstream: UpstreamResponse,
) -> RelayResult<Response> {
    let content_type = upstream
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match ContentKind::classify(request.target.as_str(), content_type.as_deref()) {
        ContentKind::Manifest => compose_manifest(state, request, upstream).await,
        ContentKind::Subtitle(format) => compose_subtitle(format, upstream).await,
        ContentKind::Opaque => compose_passthrough(state, upstream),
    }
}

/// Buffer the playlist, rewrite every URI line to route back through the
/// relay, and emit it with a Content-Length recomputed from the rewritten
/// bytes. The upstream length is meaningless after the transformation.
async fn compose_manifest(
    state: &AppState,
    request: &RelayRequest,
    upstream: UpstreamResponse,
) -> RelayResult<Response> {
    let raw = upstream
        .body
        .buffer()
        .await
        .map_err(|e| RelayError::internal(format!("failed to read upstream playlist: {e}")))?;
    let text = String::from_utf8_lossy(&raw);

    let ctx = RewriteContext {
        target: &request.target,
        public_base: &state.config.web.public_base_url,
        relay_path: &state.config.web.relay_path,
        source: request.source.as_deref(),
    };
    let rewritten = rewrite_manifest(&text, &ctx).into_bytes();

    debug!(
        upstream_bytes = raw.len(),
        rewritten_bytes = rewritten.len(),
        "rewrote playlist"
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONTENT_LENGTH, rewritten.len())
        .body(Body::from(rewritten))
        .map_err(|e| RelayError::internal(format!("failed to build response: {e}")))
}

/// Subtitles only need a corrected Content-Type; players refuse cues
/// served as application/octet-stream. Body passes through unmodified,
/// length recomputed from the buffered bytes.
async fn compose_subtitle(
    format: SubtitleFormat,
    upstream: UpstreamResponse,
) -> RelayResult<Response> {
    let raw = upstream
        .body
        .buffer()
        .await
        .map_err(|e| RelayError::internal(format!("failed to read upstream subtitle: {e}")))?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, format.content_type())
        .header(header::CONTENT_LENGTH, raw.len())
        .body(Body::from(raw))
        .map_err(|e| RelayError::internal(format!("failed to build response: {e}")))
}

/// Stream opaque content through without buffering, preserving the status
/// (200 or 206) and the headers range-based seeking depends on.
fn compose_passthrough(state: &AppState, upstream: UpstreamResponse) -> RelayResult<Response> {
    let mut builder = Response::builder().status(upstream.status);

    for name in [
        header::CONTENT_TYPE,
        header::CONTENT_LENGTH,
        header::CONTENT_RANGE,
        header::ACCEPT_RANGES,
        header::CACHE_CONTROL,
    ] {
        if let Some(value) = upstream.headers.get(&name) {
            builder = builder.header(name, value.clone());
        }
    }
    if !upstream.headers.contains_key(header::CONTENT_TYPE) {
        builder = builder.header(header::CONTENT_TYPE, HeaderValue::from_static("video/mp2t"));
    }
    if !upstream.headers.contains_key(header::ACCEPT_RANGES) {
        builder = builder.header(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }

    let body = match upstream.body {
        UpstreamBody::Buffered(bytes) => Body::from(bytes),
        UpstreamBody::Stream(stream) => {
            if state.config.upstream.abort_on_client_disconnect {
                Body::from_stream(stream)
            } else {
                Body::from_stream(detached(stream))
            }
        }
    };

    builder
        .body(body)
        .map_err(|e| RelayError::internal(format!("failed to build response: {e}")))
}

/// Decouple the upstream read from the client connection: chunks are
/// forwarded through a channel by a spawned task that keeps draining the
/// upstream even after the client goes away.
fn detached(
    mut stream: BoxStream<'static, std::io::Result<Bytes>>,
) -> ReceiverStream<std::io::Result<Bytes>> {
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    tokio::spawn(async move {
        let mut client_gone = false;
        while let Some(chunk) = stream.next().await {
            let upstream_failed = chunk.is_err();
            if !client_gone && tx.send(chunk).await.is_err() {
                client_gone = true;
            }
            if upstream_failed {
                break;
            }
        }
    });
    ReceiverStream::new(rx)
}
