//! Outbound side of the relay: header strategies, the transport seam, and
//! the retry/fallback engine that drives them.

pub mod fetch;
pub mod strategy;
pub mod transport;

pub use fetch::{FetchError, ResilientFetcher};
pub use strategy::{HeaderStrategy, strategies};
pub use transport::{ReqwestTransport, UpstreamBody, UpstreamResponse, UpstreamTransport};
