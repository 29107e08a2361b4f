//! Application configuration.
//!
//! Configuration is loaded from a TOML file with serde defaults for every
//! field, so an empty file (or no file at all) yields a runnable service.
//! Durations accept humantime strings ("30s", "5m").

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

pub mod duration_serde;

use duration_serde::duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public base URL the relay is reachable at, used when rewriting
    /// playlist entries to point back at this service.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    /// Route the relay endpoint is mounted on.
    #[serde(default = "default_relay_path")]
    pub relay_path: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_base_url: default_public_base_url(),
            relay_path: default_relay_path(),
        }
    }
}

/// Fixed-window rate limiting per client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,
    /// Window length. Counts reset when a request arrives after the window
    /// has elapsed; this is not a sliding window.
    #[serde(with = "duration", default = "default_window")]
    pub window: Duration,
    /// Maximum accepted requests per window before the client is blocked.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// How long a client stays blocked after exceeding the window quota.
    #[serde(with = "duration", default = "default_block_duration")]
    pub block_duration: Duration,
    /// Interval for the background sweep that drops stale client records.
    #[serde(with = "duration", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            window: default_window(),
            max_requests: default_max_requests(),
            block_duration: default_block_duration(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Bound on a single outbound attempt (connection + response headers).
    #[serde(with = "duration", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// TCP/TLS connect timeout for the shared client.
    #[serde(with = "duration", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(default)]
    pub retry: RetryConfig,
    /// When true, a client disconnect mid-stream drops the upstream read.
    /// When false the upstream body is drained by a detached task instead.
    #[serde(default = "default_abort_on_client_disconnect")]
    pub abort_on_client_disconnect: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            retry: RetryConfig::default(),
            abort_on_client_disconnect: default_abort_on_client_disconnect(),
        }
    }
}

/// Backoff schedule for transient upstream failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries per header strategy, not counting the initial attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(with = "duration", default = "default_base_delay")]
    pub base_delay: Duration,
    #[serde(with = "duration", default = "default_max_delay")]
    pub max_delay: Duration,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,
    /// Adds bounded random jitter to backoff delays. Off by default; with
    /// many concurrent clients hitting the same upstream, enabling this
    /// avoids synchronized retry bursts.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            jitter: false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8484
}

fn default_public_base_url() -> String {
    "http://localhost:8484".to_string()
}

fn default_relay_path() -> String {
    "/stream-proxy".to_string()
}

fn default_rate_limit_enabled() -> bool {
    true
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_max_requests() -> u32 {
    100
}

fn default_block_duration() -> Duration {
    Duration::from_secs(300)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(1000)
}

fn default_max_delay() -> Duration {
    Duration::from_millis(10_000)
}

fn default_backoff_factor() -> u32 {
    2
}

fn default_abort_on_client_disconnect() -> bool {
    true
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from_file(&config_file)
    }

    pub fn load_from_file(config_file: &str) -> Result<Self> {
        if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(config_file)?;
            Ok(toml::from_str(&contents)?)
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(config_file, contents)?;
            info!("Created default config file: {}", config_file);
            Ok(default_config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.rate_limit.block_duration, Duration::from_secs(300));
        assert_eq!(config.upstream.request_timeout, Duration::from_secs(30));
        assert_eq!(config.upstream.retry.max_retries, 3);
        assert_eq!(config.upstream.retry.base_delay, Duration::from_millis(1000));
        assert_eq!(config.upstream.retry.max_delay, Duration::from_millis(10_000));
        assert_eq!(config.upstream.retry.backoff_factor, 2);
        assert!(!config.upstream.retry.jitter);
        assert!(config.upstream.abort_on_client_disconnect);
        assert_eq!(config.web.relay_path, "/stream-proxy");
    }

    #[test]
    fn empty_file_deserializes_to_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.web.port, default_port());
        assert!(config.rate_limit.enabled);
    }

    #[test]
    fn partial_sections_use_field_defaults() {
        let config: Config = toml::from_str(
            r#"
            [rate_limit]
            max_requests = 10
            window = "30s"

            [upstream.retry]
            jitter = true
            "#,
        )
        .unwrap();
        assert_eq!(config.rate_limit.max_requests, 10);
        assert_eq!(config.rate_limit.window, Duration::from_secs(30));
        assert_eq!(config.rate_limit.block_duration, Duration::from_secs(300));
        assert!(config.upstream.retry.jitter);
        assert_eq!(config.upstream.retry.max_retries, 3);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let reparsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(reparsed.rate_limit.window, config.rate_limit.window);
        assert_eq!(
            reparsed.upstream.retry.base_delay,
            config.upstream.retry.base_delay
        );
    }
}
