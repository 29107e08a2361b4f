use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stream_relay::{
    config::Config,
    services::RateLimiter,
    upstream::{ReqwestTransport, fetch::ResilientFetcher},
    web::{AppState, RelayServer},
};

#[derive(Parser)]
#[command(name = "stream-relay")]
#[command(version)]
#[command(about = "A resilient stream relay proxy for HLS video delivery")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("stream_relay={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting stream-relay v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_from_file(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    let config = Arc::new(config);

    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    limiter.spawn_sweeper();
    info!(
        window_secs = config.rate_limit.window.as_secs(),
        max_requests = config.rate_limit.max_requests,
        "rate limiter initialized"
    );

    let transport = Arc::new(ReqwestTransport::new(config.upstream.connect_timeout));
    let fetcher = Arc::new(ResilientFetcher::new(
        transport,
        config.upstream.retry.clone(),
        config.upstream.request_timeout,
    ));

    let shutdown = CancellationToken::new();
    let state = AppState {
        config,
        limiter,
        fetcher,
        shutdown: shutdown.clone(),
        start_time: chrono::Utc::now(),
    };

    let server = RelayServer::new(state)?;
    server.serve(shutdown).await
}
