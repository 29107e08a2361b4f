//! Outbound transport seam.
//!
//! The fetcher talks to upstreams through [`UpstreamTransport`] so its
//! retry/fallback behavior can be exercised against a scripted in-memory
//! transport. The real implementation wraps a shared reqwest client built
//! with a connect timeout only; the per-attempt bound covers connection
//! and response headers, and deliberately not the body, so long-lived
//! media streams stay open.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Network-level failure of a single outbound attempt.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("upstream request timed out after {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("upstream connection failed: {0}")]
    Connect(String),
    #[error("upstream i/o error: {0}")]
    Io(String),
}

/// A response from an upstream, body not yet consumed.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
}

pub enum UpstreamBody {
    Buffered(Bytes),
    Stream(BoxStream<'static, std::io::Result<Bytes>>),
}

impl UpstreamBody {
    /// Collect the whole body into memory. Used for content that gets
    /// transformed before it is re-emitted.
    pub async fn buffer(self) -> std::io::Result<Bytes> {
        match self {
            UpstreamBody::Buffered(bytes) => Ok(bytes),
            UpstreamBody::Stream(mut stream) => {
                let mut collected: Vec<u8> = Vec::with_capacity(8192);
                while let Some(chunk) = stream.next().await {
                    collected.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(collected))
            }
        }
    }
}

impl fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamBody::Buffered(bytes) => write!(f, "Buffered({} bytes)", bytes.len()),
            UpstreamBody::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}

#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Issue one GET attempt with exactly the given headers. `timeout`
    /// bounds connection establishment and response-header receipt.
    async fn fetch(
        &self,
        url: &str,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Result<UpstreamResponse, TransportError>;
}

/// Production transport over a shared reqwest client.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }
}

#[async_trait]
impl UpstreamTransport for ReqwestTransport {
    async fn fetch(
        &self,
        url: &str,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Result<UpstreamResponse, TransportError> {
        let send = self.client.get(url).headers(headers).send();

        let response = tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| TransportError::Timeout { timeout })?
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout { timeout }
                } else if e.is_connect() {
                    TransportError::Connect(e.to_string())
                } else {
                    TransportError::Io(e.to_string())
                }
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let stream = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();

        Ok(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Stream(stream),
        })
    }
}
