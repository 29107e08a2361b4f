//! Long-lived services owned by the application state.

pub mod rate_limiter;

pub use rate_limiter::{RateLimitVerdict, RateLimiter};
