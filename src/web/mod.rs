//! HTTP surface of the relay.
//!
//! Thin handlers over the shared [`AppState`]: the relay endpoint itself,
//! a liveness probe, and request logging. The relay route is mounted on
//! the configured path so deployments can move it without recompiling.

use anyhow::Result;
use axum::{Router, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::services::RateLimiter;
use crate::upstream::fetch::ResilientFetcher;

pub mod guard;
pub mod handlers;
pub mod middleware;
pub mod responses;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub limiter: Arc<RateLimiter>,
    pub fetcher: Arc<ResilientFetcher>,
    /// Cancelled on shutdown; in-flight upstream walks observe it.
    pub shutdown: CancellationToken,
    /// Process start, reported by the liveness probe.
    pub start_time: chrono::DateTime<chrono::Utc>,
}

/// Build the router with all routes and middleware.
pub fn router(state: AppState) -> Router {
    let relay_path = state.config.web.relay_path.clone();
    Router::new()
        .route(
            &relay_path,
            get(handlers::relay::relay).options(handlers::relay::relay_preflight),
        )
        .route("/health", get(handlers::health::health_check))
        .layer(axum::middleware::from_fn(middleware::request_logging))
        .with_state(state)
}

/// Relay server bound to the configured address.
pub struct RelayServer {
    app: Router,
    addr: SocketAddr,
}

impl RelayServer {
    pub fn new(state: AppState) -> Result<Self> {
        let addr: SocketAddr =
            format!("{}:{}", state.config.web.host, state.config.web.port).parse()?;
        let app = router(state);
        Ok(Self { app, addr })
    }

    /// Serve until SIGTERM/Ctrl-C, then drain gracefully. The shared
    /// token is cancelled first so in-flight strategy walks stop retrying.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        info!("listening on {}", self.addr);

        let shutdown_signal = async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = wait_for_signal() => {
                    shutdown.cancel();
                }
            }
            info!("shutting down gracefully");
        };

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal)
            .await?;
        Ok(())
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    }
}
