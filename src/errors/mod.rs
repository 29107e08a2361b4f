//! Error types for the stream relay.
//!
//! The hierarchy mirrors the request lifecycle: validation failures and
//! bot rejections surface immediately, rate-limit denials carry the
//! remaining cooldown, and upstream failures arrive pre-classified from
//! the fetcher so the web layer can map them onto status codes.

use std::time::Duration;
use thiserror::Error;

use crate::upstream::fetch::FetchError;

/// Top-level error for relay request handling.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Malformed or missing request parameters.
    #[error("invalid request: {message}")]
    Validation { message: String },

    /// The client failed the automation check.
    #[error("automated requests not allowed")]
    AutomatedClient,

    /// The client exceeded its request quota.
    #[error("rate limit exceeded for client {client}")]
    RateLimited {
        client: String,
        retry_after: Duration,
    },

    /// Every header strategy was exhausted against the upstream.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Anything unexpected. Mapped to a generic 500.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl RelayError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Convenience type alias for Results using RelayError.
pub type RelayResult<T> = Result<T, RelayError>;
