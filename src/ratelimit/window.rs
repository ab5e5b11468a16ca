//! Shared fixed-window limiter backed by a remote atomic counter.
//!
//! Every identity gets one counter per UTC minute. The first increment in a
//! window sets a 60 second expiry, so stale windows clean themselves up in the
//! backend.
//!
//! Windows are fixed, not sliding: a burst straddling a minute boundary can be
//! admitted up to `2 × (requests_per_minute + burst)` times across the two
//! windows. Callers needing tighter bounds should use a smaller allowance.
//!
//! When the backend times out or errors the limiter fails open: the request
//! is admitted and a warning is logged.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::backend::{Decision, RateLimiterBackend};
use super::counter::{WindowKey, WINDOW};
use crate::clock::Clock;
use crate::config::{LimiterConfig, Strategy};
use crate::error::{GatewayError, Result};
use crate::metrics;
use crate::store::CounterStore;

/// Settings for a [`WindowCounterLimiter`].
#[derive(Debug, Clone)]
pub struct WindowLimiterConfig {
    pub key_prefix: String,
    pub requests_per_minute: u32,
    pub burst: u32,
    /// Budget for each backend call
    pub backend_timeout: Duration,
    /// Retry hint when the window TTL cannot be read
    pub fallback_retry_after: Duration,
}

impl From<&LimiterConfig> for WindowLimiterConfig {
    fn from(config: &LimiterConfig) -> Self {
        Self {
            key_prefix: config.key_prefix.clone(),
            requests_per_minute: config.requests_per_minute,
            burst: config.burst,
            backend_timeout: config.backend_timeout(),
            fallback_retry_after: config.fallback_retry_after(),
        }
    }
}

/// A rate limiter whose counters live in a shared [`CounterStore`].
///
/// Keeps no local state beyond configuration; concurrency safety comes from
/// the backend's atomic increment.
pub struct WindowCounterLimiter {
    store: Arc<dyn CounterStore>,
    config: WindowLimiterConfig,
    clock: Arc<dyn Clock>,
}

impl WindowCounterLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        config: WindowLimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    /// Requests admitted per identity per window.
    pub fn allowance(&self) -> u64 {
        u64::from(self.config.requests_per_minute) + u64::from(self.config.burst)
    }

    /// Count this request against the current window and decide.
    pub async fn check(&self, identity: &str) -> Decision {
        let key = WindowKey::new(&self.config.key_prefix, identity, self.clock.now())
            .to_string_key();

        let count = match self.count(&key).await {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    identity = %identity,
                    key = %key,
                    error = %e,
                    "Window counter backend unavailable, failing open"
                );
                metrics::record_fail_open();
                return Decision::admit();
            }
        };

        let allowance = self.allowance();
        let count = u64::try_from(count).unwrap_or(0);

        trace!(key = %key, count, allowance, "Checked window counter");

        if count <= allowance {
            return Decision::admit_with_remaining(allowance - count);
        }

        let retry_after = self.retry_after(&key).await;
        debug!(
            identity = %identity,
            count,
            allowance,
            retry_after_secs = retry_after.as_secs(),
            "Window limit exceeded"
        );
        Decision::deny(retry_after)
    }

    /// Increment the window counter, arming its expiry on first use.
    async fn count(&self, key: &str) -> Result<i64> {
        let count = self.bounded(self.store.increment(key)).await?;

        if count == 1 {
            if let Err(e) = self.bounded(self.store.expire(key, WINDOW)).await {
                debug!(key = %key, error = %e, "Failed to set window expiry");
            }
        }

        Ok(count)
    }

    /// Remaining window time, or the configured fallback.
    async fn retry_after(&self, key: &str) -> Duration {
        match self.bounded(self.store.ttl_remaining(key)).await {
            Ok(Some(ttl)) if !ttl.is_zero() => ttl,
            Ok(_) => self.config.fallback_retry_after,
            Err(e) => {
                debug!(key = %key, error = %e, "Failed to read window TTL");
                self.config.fallback_retry_after
            }
        }
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        let budget = self.config.backend_timeout;
        tokio::time::timeout(budget, call)
            .await
            .map_err(|_| GatewayError::Timeout(budget))?
    }
}

#[async_trait]
impl RateLimiterBackend for WindowCounterLimiter {
    async fn allow(&self, identity: &str) -> Decision {
        self.check(identity).await
    }

    fn strategy(&self) -> Strategy {
        Strategy::Shared
    }
}
