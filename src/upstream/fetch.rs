//! Resilient upstream fetching.
//!
//! Walks the header-strategy ladder depth-first: transient failures are
//! retried on the same rung with exponential backoff, header rejections
//! drop straight to the next rung, and only when every rung is exhausted
//! does the failure surface. Attempts are strictly sequential; two
//! strategies are never in flight at once.
//!
//! The decision logic is split out as [`classify_status`] and
//! [`backoff_delay`] so the schedule is testable without timers.

use reqwest::StatusCode;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::models::RelayRequest;
use crate::upstream::strategy::HeaderStrategy;
use crate::upstream::transport::{TransportError, UpstreamResponse, UpstreamTransport};
use crate::utils::UrlUtils;

/// What a single attempt's status code means for the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusClass {
    Success,
    /// The upstream rejected this header set; the next rung may pass.
    HeaderRejected,
    /// Worth retrying the same rung after a delay.
    Transient,
    /// Neither recoverable by headers nor by waiting.
    Other,
}

pub(crate) fn classify_status(status: StatusCode) -> StatusClass {
    if status.is_success() {
        StatusClass::Success
    } else {
        match status.as_u16() {
            401 | 403 | 405 | 406 => StatusClass::HeaderRejected,
            408 | 429 => StatusClass::Transient,
            code if code >= 500 => StatusClass::Transient,
            _ => StatusClass::Other,
        }
    }
}

/// Delay before retry number `retry` (0-indexed), capped at `max_delay`.
/// With jitter enabled a random component bounded by half the base delay
/// is added, never exceeding the cap.
pub(crate) fn backoff_delay(policy: &RetryConfig, retry: u32) -> Duration {
    let multiplier = policy.backoff_factor.checked_pow(retry).unwrap_or(u32::MAX);
    let exp_delay = policy
        .base_delay
        .checked_mul(multiplier)
        .unwrap_or(policy.max_delay);
    let capped = exp_delay.min(policy.max_delay);

    if !policy.jitter {
        return capped;
    }

    let jitter_range_ms = u64::try_from(policy.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
    let headroom_ms =
        u64::try_from(policy.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
    let limit_ms = jitter_range_ms.min(headroom_ms);
    if limit_ms == 0 {
        return capped;
    }

    use rand::Rng;
    let jitter_ms = rand::rng().random_range(0..limit_ms);
    (capped + Duration::from_millis(jitter_ms)).min(policy.max_delay)
}

/// The last thing observed before giving up.
#[derive(Debug, Clone)]
pub enum LastFailure {
    Status(StatusCode),
    Timeout,
    Network(String),
}

impl fmt::Display for LastFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LastFailure::Status(status) => write!(f, "upstream status {status}"),
            LastFailure::Timeout => write!(f, "upstream timeout"),
            LastFailure::Network(message) => write!(f, "network failure: {message}"),
        }
    }
}

impl From<&TransportError> for LastFailure {
    fn from(error: &TransportError) -> Self {
        match error {
            TransportError::Timeout { .. } => LastFailure::Timeout,
            TransportError::Connect(message) | TransportError::Io(message) => {
                LastFailure::Network(message.clone())
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Every strategy was tried and none produced a 2xx.
    #[error("upstream unreachable ({last}) for {url}")]
    Exhausted { url: String, last: LastFailure },

    #[error("fetch cancelled")]
    Cancelled,
}

/// Drives the retry/fallback walk over an injected transport.
pub struct ResilientFetcher {
    transport: Arc<dyn UpstreamTransport>,
    policy: RetryConfig,
    request_timeout: Duration,
}

impl ResilientFetcher {
    pub fn new(
        transport: Arc<dyn UpstreamTransport>,
        policy: RetryConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            policy,
            request_timeout,
        }
    }

    /// Fetch the request's target, trying `strategies` in order.
    pub async fn fetch(
        &self,
        request: &RelayRequest,
        strategies: &[HeaderStrategy],
        token: &CancellationToken,
    ) -> Result<UpstreamResponse, FetchError> {
        let url = request.target.as_str();
        let display_url = UrlUtils::obfuscate_tokens(url);
        let mut last = LastFailure::Network("no strategies attempted".to_string());

        for (rung, strategy) in strategies.iter().enumerate() {
            let headers = self.attempt_headers(strategy, request);
            let mut retry = 0u32;

            loop {
                if token.is_cancelled() {
                    return Err(FetchError::Cancelled);
                }

                debug!(
                    strategy = strategy.name,
                    rung,
                    retry,
                    url = %display_url,
                    "dispatching upstream attempt"
                );

                match self
                    .transport
                    .fetch(url, headers.clone(), self.request_timeout)
                    .await
                {
                    Ok(response) => match classify_status(response.status) {
                        StatusClass::Success => {
                            if rung > 0 || retry > 0 {
                                debug!(
                                    strategy = strategy.name,
                                    rung,
                                    retry,
                                    url = %display_url,
                                    "upstream accepted after fallback"
                                );
                            }
                            return Ok(response);
                        }
                        StatusClass::HeaderRejected => {
                            warn!(
                                strategy = strategy.name,
                                status = %response.status,
                                url = %display_url,
                                "header set rejected, advancing to next strategy"
                            );
                            last = LastFailure::Status(response.status);
                            break;
                        }
                        StatusClass::Transient if retry < self.policy.max_retries => {
                            let delay = backoff_delay(&self.policy, retry);
                            debug!(
                                strategy = strategy.name,
                                status = %response.status,
                                retry,
                                delay_ms = delay.as_millis() as u64,
                                "transient upstream failure, backing off"
                            );
                            self.sleep(delay, token).await?;
                            retry += 1;
                        }
                        StatusClass::Transient | StatusClass::Other => {
                            last = LastFailure::Status(response.status);
                            break;
                        }
                    },
                    Err(error) if retry < self.policy.max_retries => {
                        let delay = backoff_delay(&self.policy, retry);
                        debug!(
                            strategy = strategy.name,
                            error = %error,
                            retry,
                            delay_ms = delay.as_millis() as u64,
                            "network failure, backing off"
                        );
                        last = LastFailure::from(&error);
                        self.sleep(delay, token).await?;
                        retry += 1;
                    }
                    Err(error) => {
                        warn!(
                            strategy = strategy.name,
                            error = %error,
                            url = %display_url,
                            "network failure exhausted retries, advancing to next strategy"
                        );
                        last = LastFailure::from(&error);
                        break;
                    }
                }
            }
        }

        Err(FetchError::Exhausted {
            url: display_url,
            last,
        })
    }

    /// Assemble the header map for one attempt: strategy headers, then the
    /// client User-Agent when the rung forwards it, then the inbound Range
    /// header, which survives every strategy unconditionally.
    fn attempt_headers(&self, strategy: &HeaderStrategy, request: &RelayRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in &strategy.headers {
            let name = match HeaderName::from_bytes(name.as_bytes()) {
                Ok(name) => name,
                Err(_) => continue,
            };
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(name, value);
            }
        }

        if strategy.use_client_user_agent {
            if let Ok(value) = HeaderValue::from_str(&request.user_agent) {
                headers.insert(header::USER_AGENT, value);
            }
        }

        if let Some(range) = &request.range {
            if let Ok(value) = HeaderValue::from_str(range) {
                headers.insert(header::RANGE, value);
            }
        }

        headers
    }

    async fn sleep(&self, delay: Duration, token: &CancellationToken) -> Result<(), FetchError> {
        tokio::select! {
            _ = token.cancelled() => Err(FetchError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::strategy::{self, BROWSER_USER_AGENT};
    use crate::upstream::transport::UpstreamBody;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use url::Url;

    struct MockTransport {
        script: Mutex<VecDeque<Result<StatusCode, TransportError>>>,
        seen: Mutex<Vec<HeaderMap>>,
    }

    impl MockTransport {
        fn scripted(outcomes: Vec<Result<StatusCode, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(outcomes.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn seen_headers(&self) -> Vec<HeaderMap> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpstreamTransport for MockTransport {
        async fn fetch(
            &self,
            _url: &str,
            headers: HeaderMap,
            _timeout: Duration,
        ) -> Result<UpstreamResponse, TransportError> {
            self.seen.lock().unwrap().push(headers);
            let outcome = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(StatusCode::OK));
            outcome.map(|status| UpstreamResponse {
                status,
                headers: HeaderMap::new(),
                body: UpstreamBody::Buffered(Bytes::from_static(b"payload")),
            })
        }
    }

    fn policy() -> RetryConfig {
        RetryConfig::default()
    }

    fn request(url: &str) -> RelayRequest {
        RelayRequest {
            target: Url::parse(url).unwrap(),
            source: Some("embed.su".to_string()),
            range: None,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) Gecko/20100101 Firefox/121.0".to_string(),
            client: "10.0.0.1".to_string(),
        }
    }

    fn fetcher(transport: Arc<MockTransport>) -> ResilientFetcher {
        ResilientFetcher::new(transport, policy(), Duration::from_secs(30))
    }

    fn status(code: u16) -> Result<StatusCode, TransportError> {
        Ok(StatusCode::from_u16(code).unwrap())
    }

    #[test]
    fn status_classification_matches_the_decision_table() {
        assert_eq!(classify_status(StatusCode::OK), StatusClass::Success);
        assert_eq!(
            classify_status(StatusCode::PARTIAL_CONTENT),
            StatusClass::Success
        );
        for code in [401, 403, 405, 406] {
            assert_eq!(
                classify_status(StatusCode::from_u16(code).unwrap()),
                StatusClass::HeaderRejected
            );
        }
        for code in [408, 429, 500, 502, 503, 504, 599] {
            assert_eq!(
                classify_status(StatusCode::from_u16(code).unwrap()),
                StatusClass::Transient
            );
        }
        for code in [404, 410, 451] {
            assert_eq!(
                classify_status(StatusCode::from_u16(code).unwrap()),
                StatusClass::Other
            );
        }
    }

    #[test]
    fn backoff_schedule_is_exponential_and_capped() {
        let policy = policy();
        assert_eq!(backoff_delay(&policy, 0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_millis(4000));
        assert_eq!(backoff_delay(&policy, 10), Duration::from_millis(10_000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut policy = policy();
        policy.jitter = true;
        for _ in 0..64 {
            let delay = backoff_delay(&policy, 0);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay < Duration::from_millis(1500));
        }
        // At the cap there is no headroom left for jitter.
        assert_eq!(backoff_delay(&policy, 10), Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn header_rejections_advance_with_zero_delay() {
        let transport = MockTransport::scripted(vec![status(403), status(403), status(200)]);
        let request = request("https://cdn.example.com/v/index.m3u8");
        let strategies = strategy::strategies(request.target.as_str(), request.source.as_deref());

        let started = tokio::time::Instant::now();
        let response = fetcher(transport.clone())
            .fetch(&request, &strategies, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(transport.attempts(), 3);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_then_advance() {
        // Four 503s exhaust the first rung (1 attempt + 3 retries with
        // delays 1s, 2s, 4s), then the next rung succeeds immediately.
        let transport = MockTransport::scripted(vec![
            status(503),
            status(503),
            status(503),
            status(503),
            status(200),
        ]);
        let request = request("https://cdn.example.com/v/index.m3u8");
        let strategies = strategy::strategies(request.target.as_str(), request.source.as_deref());

        let started = tokio::time::Instant::now();
        let response = fetcher(transport.clone())
            .fetch(&request, &strategies, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(transport.attempts(), 5);
        assert_eq!(started.elapsed(), Duration::from_millis(7000));
    }

    #[tokio::test(start_paused = true)]
    async fn other_statuses_advance_without_retrying() {
        let transport = MockTransport::scripted(vec![status(404), status(200)]);
        let request = request("https://cdn.example.com/v/seg.ts");
        let strategies = strategy::strategies(request.target.as_str(), request.source.as_deref());

        let started = tokio::time::Instant::now();
        let response = fetcher(transport.clone())
            .fetch(&request, &strategies, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(transport.attempts(), 2);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_the_last_status() {
        let transport = MockTransport::scripted(vec![status(500); 20]);
        let request = request("https://cdn.example.com/v/index.m3u8");
        let strategies = strategy::strategies(request.target.as_str(), request.source.as_deref());

        let result = fetcher(transport.clone())
            .fetch(&request, &strategies, &CancellationToken::new())
            .await;

        // Every rung gets 1 attempt + 3 retries.
        assert_eq!(transport.attempts(), strategies.len() * 4);
        match result {
            Err(FetchError::Exhausted {
                last: LastFailure::Status(status),
                ..
            }) => assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR),
            other => panic!("expected exhausted with status, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn network_failures_retry_then_escalate() {
        let timeout = TransportError::Timeout {
            timeout: Duration::from_secs(30),
        };
        let transport = MockTransport::scripted(vec![Err(timeout.clone()); 20]);
        let request = request("https://cdn.example.com/v/index.m3u8");
        let strategies = strategy::strategies(request.target.as_str(), request.source.as_deref());

        let result = fetcher(transport.clone())
            .fetch(&request, &strategies, &CancellationToken::new())
            .await;

        assert_eq!(transport.attempts(), strategies.len() * 4);
        assert!(matches!(
            result,
            Err(FetchError::Exhausted {
                last: LastFailure::Timeout,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn range_header_survives_every_strategy() {
        let transport = MockTransport::scripted(vec![status(403), status(403), status(200)]);
        let mut request = request("https://cdn.example.com/v/seg.ts");
        request.range = Some("bytes=1024-2047".to_string());
        let strategies = strategy::strategies(request.target.as_str(), request.source.as_deref());

        fetcher(transport.clone())
            .fetch(&request, &strategies, &CancellationToken::new())
            .await
            .unwrap();

        for headers in transport.seen_headers() {
            assert_eq!(
                headers.get(header::RANGE).and_then(|v| v.to_str().ok()),
                Some("bytes=1024-2047")
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn client_user_agent_reaches_only_the_forwarding_rung() {
        // Reject the three spoofing rungs so the walk reaches "minimal".
        let transport =
            MockTransport::scripted(vec![status(403), status(403), status(403), status(200)]);
        let request = request("https://cdn.example.com/v/seg.ts");
        let strategies = strategy::strategies(request.target.as_str(), request.source.as_deref());

        fetcher(transport.clone())
            .fetch(&request, &strategies, &CancellationToken::new())
            .await
            .unwrap();

        let seen = transport.seen_headers();
        let ua = |headers: &HeaderMap| {
            headers
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        assert_eq!(ua(&seen[0]).as_deref(), Some(BROWSER_USER_AGENT));
        assert_eq!(ua(&seen[3]).as_deref(), Some(request.user_agent.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn bare_rung_sends_no_headers_at_all() {
        let transport = MockTransport::scripted(vec![status(403); 4]);
        let request = request("https://cdn.example.com/v/seg.ts");
        let strategies = strategy::strategies(request.target.as_str(), request.source.as_deref());

        let _ = fetcher(transport.clone())
            .fetch(&request, &strategies, &CancellationToken::new())
            .await;

        let seen = transport.seen_headers();
        assert!(seen.last().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_short_circuits_the_walk() {
        let transport = MockTransport::scripted(vec![]);
        let request = request("https://cdn.example.com/v/index.m3u8");
        let strategies = strategy::strategies(request.target.as_str(), request.source.as_deref());

        let token = CancellationToken::new();
        token.cancel();
        let result = fetcher(transport.clone())
            .fetch(&request, &strategies, &token)
            .await;

        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert_eq!(transport.attempts(), 0);
    }
}
