//! Request model shared between the web layer and the upstream fetcher.

use serde::Deserialize;
use url::Url;

/// Query parameters accepted by the relay endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayQuery {
    /// URL-encoded absolute target. Required; validated by the gate so a
    /// missing value produces a relay error instead of a framework 400.
    pub url: Option<String>,
    /// Upstream family label, echoed into rewritten playlist URLs.
    pub source: Option<String>,
}

/// A validated relay request.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    /// Absolute upstream target.
    pub target: Url,
    /// Upstream family label, if the caller supplied one.
    pub source: Option<String>,
    /// Inbound Range header, preserved across every outbound attempt.
    pub range: Option<String>,
    /// Inbound User-Agent, forwarded upstream by strategies that do not
    /// spoof their own.
    pub user_agent: String,
    /// Resolved client identity used for rate limiting.
    pub client: String,
}
