//! Process-local token bucket limiter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::{Decision, RateLimiterBackend};
use crate::clock::Clock;
use crate::config::Strategy;

/// Token state for one identity.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

/// Token bucket limiter holding one bucket per identity.
///
/// Tokens are real-valued and refill continuously at `requests_per_minute`,
/// capped at the burst capacity. Buckets live in a sharded map; each check
/// holds the lock of a single shard for the read-modify-write of one bucket.
pub struct TokenBucketLimiter {
    buckets: DashMap<String, Bucket>,
    requests_per_minute: u32,
    capacity: f64,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    /// Create a limiter. A `burst` of zero still allows one token so the
    /// sustained rate can be met.
    pub fn new(requests_per_minute: u32, burst: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            requests_per_minute,
            capacity: f64::from(burst.max(1)),
            clock,
        }
    }

    /// Refill, then try to take one token for `identity`.
    pub fn check(&self, identity: &str) -> Decision {
        let now = self.clock.now();
        let rate = f64::from(self.requests_per_minute);

        let mut bucket = self
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| {
                debug!(identity = %identity, capacity = self.capacity, "Creating token bucket");
                Bucket {
                    tokens: self.capacity,
                    last_refill: now,
                }
            });

        let elapsed_minutes = (now - bucket.last_refill)
            .to_std()
            .map(|d| d.as_secs_f64() / 60.0)
            .unwrap_or(0.0);
        bucket.tokens = (bucket.tokens + elapsed_minutes * rate).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            trace!(identity = %identity, tokens = bucket.tokens, "Token granted");
            return Decision::admit();
        }

        let deficit = 1.0 - bucket.tokens;
        let per_token = 60.0 / f64::from(self.requests_per_minute.max(1));
        let retry_after = Duration::from_secs_f64(deficit * per_token);

        debug!(
            identity = %identity,
            retry_after_ms = retry_after.as_millis() as u64,
            "Token bucket exhausted"
        );
        Decision::deny(retry_after)
    }

    /// Drop buckets idle long enough to have refilled completely.
    ///
    /// A removed bucket is indistinguishable from the fresh one that replaces
    /// it on the next check. Returns the number of buckets removed.
    pub fn prune_idle(&self) -> usize {
        let now = self.clock.now();
        let full_refill_minutes = self.capacity / f64::from(self.requests_per_minute.max(1));
        let before = self.buckets.len();

        self.buckets.retain(|_, bucket| {
            let idle_minutes = (now - bucket.last_refill)
                .to_std()
                .map(|d| d.as_secs_f64() / 60.0)
                .unwrap_or(0.0);
            idle_minutes < full_refill_minutes
        });

        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "Pruned idle token buckets");
        }
        removed
    }

    /// Current token count for an identity, without refilling.
    pub fn tokens(&self, identity: &str) -> Option<f64> {
        self.buckets.get(identity).map(|b| b.tokens)
    }

    /// Get the number of tracked identities.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[async_trait]
impl RateLimiterBackend for TokenBucketLimiter {
    async fn allow(&self, identity: &str) -> Decision {
        self.check(identity)
    }

    fn strategy(&self) -> Strategy {
        Strategy::Local
    }
}
