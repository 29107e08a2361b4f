//! Per-client rate limiting.
//!
//! Fixed window with a blocking cooldown: a client gets `max_requests` per
//! `window`; exceeding the quota blocks the client for `block_duration`.
//! This is deliberately not a sliding window, so a burst straddling a
//! window boundary can briefly see up to twice the quota.
//!
//! The limiter is an owned service injected into the handler state. A
//! background sweep drops records whose window and block have both lapsed,
//! so the per-client map stays bounded over the process lifetime.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;

/// Outcome of a limiter check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitVerdict {
    Allowed {
        /// Requests left in the current window.
        remaining: u32,
        /// Time until the current window resets.
        reset_in: Duration,
    },
    Blocked {
        /// Remaining cooldown.
        retry_after: Duration,
    },
}

#[derive(Debug)]
struct ClientRecord {
    count: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

/// Fixed-window rate limiter keyed by client identity.
pub struct RateLimiter {
    config: RateLimitConfig,
    clients: RwLock<HashMap<String, ClientRecord>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Check and record a request for `client`.
    pub async fn check(&self, client: &str) -> RateLimitVerdict {
        self.check_at(client, Instant::now()).await
    }

    /// Clock-explicit variant of [`check`](Self::check), used by tests.
    pub(crate) async fn check_at(&self, client: &str, now: Instant) -> RateLimitVerdict {
        if !self.config.enabled {
            return RateLimitVerdict::Allowed {
                remaining: self.config.max_requests,
                reset_in: self.config.window,
            };
        }

        let mut clients = self.clients.write().await;

        let record = match clients.entry(client.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(ClientRecord {
                    count: 1,
                    window_start: now,
                    blocked_until: None,
                });
                return RateLimitVerdict::Allowed {
                    remaining: self.config.max_requests.saturating_sub(1),
                    reset_in: self.config.window,
                };
            }
            Entry::Occupied(entry) => entry.into_mut(),
        };

        if let Some(blocked_until) = record.blocked_until {
            if now < blocked_until {
                return RateLimitVerdict::Blocked {
                    retry_after: blocked_until - now,
                };
            }
        }

        if now.duration_since(record.window_start) > self.config.window {
            record.count = 1;
            record.window_start = now;
            record.blocked_until = None;
            return RateLimitVerdict::Allowed {
                remaining: self.config.max_requests.saturating_sub(1),
                reset_in: self.config.window,
            };
        }

        if record.count >= self.config.max_requests {
            let blocked_until = now + self.config.block_duration;
            record.blocked_until = Some(blocked_until);
            debug!(client, "client exceeded request quota, blocking");
            return RateLimitVerdict::Blocked {
                retry_after: self.config.block_duration,
            };
        }

        record.count += 1;
        RateLimitVerdict::Allowed {
            remaining: self.config.max_requests - record.count,
            reset_in: self
                .config
                .window
                .saturating_sub(now.duration_since(record.window_start)),
        }
    }

    /// Drop records whose window has lapsed and whose block has expired.
    pub async fn sweep(&self) {
        self.sweep_at(Instant::now()).await;
    }

    pub(crate) async fn sweep_at(&self, now: Instant) {
        let mut clients = self.clients.write().await;
        let before = clients.len();
        clients.retain(|_, record| {
            let window_active = now.duration_since(record.window_start) <= self.config.window;
            let block_active = record.blocked_until.is_some_and(|until| now < until);
            window_active || block_active
        });
        let removed = before - clients.len();
        if removed > 0 {
            debug!(removed, active = clients.len(), "swept stale rate-limit records");
        }
    }

    /// Spawn the periodic sweep task. Runs until the process exits.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        let interval = limiter.config.sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                limiter.sweep().await;
            }
        })
    }

    #[cfg(test)]
    async fn tracked_clients(&self) -> usize {
        self.clients.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(max_requests: u32) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            window: Duration::from_secs(60),
            max_requests,
            block_duration: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn allows_up_to_quota_then_blocks() {
        let limiter = RateLimiter::new(test_config(3));
        let now = Instant::now();

        for expected_remaining in [2, 1, 0] {
            match limiter.check_at("10.0.0.1", now).await {
                RateLimitVerdict::Allowed { remaining, .. } => {
                    assert_eq!(remaining, expected_remaining)
                }
                other => panic!("expected allow, got {other:?}"),
            }
        }

        match limiter.check_at("10.0.0.1", now).await {
            RateLimitVerdict::Blocked { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(300));
            }
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn blocked_client_sees_shrinking_retry_after() {
        let limiter = RateLimiter::new(test_config(1));
        let now = Instant::now();

        limiter.check_at("c", now).await;
        limiter.check_at("c", now).await; // triggers the block

        let later = now + Duration::from_secs(100);
        match limiter.check_at("c", later).await {
            RateLimitVerdict::Blocked { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(200));
            }
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn window_expiry_resets_the_count() {
        let limiter = RateLimiter::new(test_config(2));
        let now = Instant::now();

        limiter.check_at("c", now).await;
        limiter.check_at("c", now).await;

        let after_window = now + Duration::from_secs(61);
        match limiter.check_at("c", after_window).await {
            RateLimitVerdict::Allowed { remaining, .. } => assert_eq!(remaining, 1),
            other => panic!("expected allow after window reset, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn block_expires_after_cooldown() {
        let limiter = RateLimiter::new(test_config(1));
        let now = Instant::now();

        limiter.check_at("c", now).await;
        limiter.check_at("c", now).await;

        let after_block = now + Duration::from_secs(301);
        match limiter.check_at("c", after_block).await {
            RateLimitVerdict::Allowed { remaining, .. } => assert_eq!(remaining, 0),
            other => panic!("expected allow after cooldown, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clients_are_tracked_independently() {
        let limiter = RateLimiter::new(test_config(1));
        let now = Instant::now();

        limiter.check_at("a", now).await;
        assert!(matches!(
            limiter.check_at("a", now).await,
            RateLimitVerdict::Blocked { .. }
        ));
        assert!(matches!(
            limiter.check_at("b", now).await,
            RateLimitVerdict::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn disabled_limiter_always_allows() {
        let mut config = test_config(1);
        config.enabled = false;
        let limiter = RateLimiter::new(config);
        let now = Instant::now();

        for _ in 0..10 {
            assert!(matches!(
                limiter.check_at("c", now).await,
                RateLimitVerdict::Allowed { .. }
            ));
        }
    }

    #[tokio::test]
    async fn sweep_drops_idle_records_but_keeps_blocked_ones() {
        let limiter = RateLimiter::new(test_config(1));
        let now = Instant::now();

        limiter.check_at("idle", now).await;
        limiter.check_at("blocked", now).await;
        limiter.check_at("blocked", now).await; // blocked for 300s
        assert_eq!(limiter.tracked_clients().await, 2);

        // Past the window but inside the block: only the idle record goes.
        limiter.sweep_at(now + Duration::from_secs(120)).await;
        assert_eq!(limiter.tracked_clients().await, 1);

        limiter.sweep_at(now + Duration::from_secs(301)).await;
        assert_eq!(limiter.tracked_clients().await, 0);
    }
}
