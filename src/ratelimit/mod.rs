//! Rate limiting strategies and the identity they are keyed on.

mod backend;
mod bucket;
mod counter;
mod identity;
mod window;

pub use backend::{Decision, DisabledLimiter, RateLimiterBackend};
pub use bucket::TokenBucketLimiter;
pub use counter::{WindowKey, WINDOW};
pub use identity::{normalize_address, Identity, FALLBACK_ADDRESS};
pub use window::{WindowCounterLimiter, WindowLimiterConfig};

use std::sync::Arc;
use tracing::info;

use crate::clock::Clock;
use crate::config::{LimiterConfig, Strategy};
use crate::error::{GatewayError, Result};
use crate::store::CounterStore;

/// The limiter selected by configuration, with direct access to the local
/// bucket map when that strategy is in use.
#[derive(Clone)]
pub struct Limiter {
    backend: Arc<dyn RateLimiterBackend>,
    local: Option<Arc<TokenBucketLimiter>>,
}

impl Limiter {
    /// Build the limiter for the configured strategy.
    ///
    /// Selection depends only on `config`; the shared strategy needs a counter
    /// store and fails with a configuration error without one.
    pub fn from_config(
        config: &LimiterConfig,
        counters: Option<Arc<dyn CounterStore>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let strategy = config.effective_strategy();

        let limiter = match strategy {
            Strategy::Disabled => Self {
                backend: Arc::new(DisabledLimiter),
                local: None,
            },
            Strategy::Local => {
                let local = Arc::new(TokenBucketLimiter::new(
                    config.requests_per_minute,
                    config.burst,
                    clock,
                ));
                Self {
                    backend: local.clone(),
                    local: Some(local),
                }
            }
            Strategy::Shared => {
                let store = counters.ok_or_else(|| {
                    GatewayError::Config("the shared strategy requires a counter store".to_string())
                })?;
                Self {
                    backend: Arc::new(WindowCounterLimiter::new(
                        store,
                        WindowLimiterConfig::from(config),
                        clock,
                    )),
                    local: None,
                }
            }
        };

        info!(
            strategy = %strategy,
            requests_per_minute = config.requests_per_minute,
            burst = config.burst,
            "Rate limiter initialized"
        );
        Ok(limiter)
    }

    pub fn backend(&self) -> Arc<dyn RateLimiterBackend> {
        Arc::clone(&self.backend)
    }

    /// The token bucket limiter, when the local strategy is active.
    pub fn local(&self) -> Option<&Arc<TokenBucketLimiter>> {
        self.local.as_ref()
    }

    pub fn strategy(&self) -> Strategy {
        self.backend.strategy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::MemoryStore;

    fn config(enabled: bool, strategy: Strategy) -> LimiterConfig {
        LimiterConfig {
            enabled,
            strategy,
            ..LimiterConfig::default()
        }
    }

    #[test]
    fn test_selection_follows_strategy() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new(10));

        let disabled = Limiter::from_config(&config(true, Strategy::Disabled), None, clock.clone()).unwrap();
        assert_eq!(disabled.strategy(), Strategy::Disabled);

        let off = Limiter::from_config(&config(false, Strategy::Local), None, clock.clone()).unwrap();
        assert_eq!(off.strategy(), Strategy::Disabled);
        assert!(off.local().is_none());

        let local = Limiter::from_config(&config(true, Strategy::Local), None, clock.clone()).unwrap();
        assert_eq!(local.strategy(), Strategy::Local);
        assert!(local.local().is_some());

        let shared = Limiter::from_config(&config(true, Strategy::Shared), Some(store), clock).unwrap();
        assert_eq!(shared.strategy(), Strategy::Shared);
    }

    #[test]
    fn test_shared_without_store_is_a_config_error() {
        let result = Limiter::from_config(&config(true, Strategy::Shared), None, Arc::new(SystemClock));
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }
}
