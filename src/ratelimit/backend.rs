//! Rate limiter trait for abstracting the admission strategies.

use async_trait::async_trait;
use std::time::Duration;

use crate::config::Strategy;

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub permitted: bool,
    /// Advisory wait before retrying; zero when permitted
    pub retry_after: Duration,
    /// Remaining allowance in the current window, if the strategy can tell cheaply
    pub remaining: Option<u64>,
}

impl Decision {
    pub fn admit() -> Self {
        Self {
            permitted: true,
            retry_after: Duration::ZERO,
            remaining: None,
        }
    }

    pub fn admit_with_remaining(remaining: u64) -> Self {
        Self {
            remaining: Some(remaining),
            ..Self::admit()
        }
    }

    pub fn deny(retry_after: Duration) -> Self {
        Self {
            permitted: false,
            retry_after,
            remaining: Some(0),
        }
    }

    /// `Retry-After` value: whole seconds, rounded up, at least one.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        let secs = if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        };
        secs.max(1)
    }
}

/// Trait for rate limiter implementations.
///
/// This trait abstracts over the disabled, local and shared limiters so the
/// gateway middleware can work with any of them. Implementations must return
/// in bounded time.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Decide whether `identity` may proceed right now.
    async fn allow(&self, identity: &str) -> Decision;

    /// Strategy implemented by this limiter.
    fn strategy(&self) -> Strategy;
}

/// Limiter that admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledLimiter;

#[async_trait]
impl RateLimiterBackend for DisabledLimiter {
    async fn allow(&self, _identity: &str) -> Decision {
        Decision::admit()
    }

    fn strategy(&self) -> Strategy {
        Strategy::Disabled
    }
}
