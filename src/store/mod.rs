//! Remote collaborators: the shared counter backend and the durable log sink.
//!
//! Both contracts are implemented by [`RedisStore`] for production and by
//! [`MemoryStore`] for single-process deployments and tests.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::{RedisStore, RedisStoreConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::Result;
use crate::telemetry::LogRecord;

/// Key of the rolling list holding the newest records.
pub const RECENT_LOGS_KEY: &str = "logs:recent";

/// Key of the per-day archival list, e.g. `logs:2025-10-21`.
pub fn daily_logs_key(at: DateTime<Utc>) -> String {
    format!("logs:{}", at.format("%Y-%m-%d"))
}

/// Atomic counter backend used by the shared window limiter.
///
/// Callers impose their own timeout on every call.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key`, creating it at zero, and return the new value.
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Set `key` to expire after `ttl`.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Remaining time to live, or `None` if the key is missing or has no expiry.
    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>>;
}

/// Durable, best-effort destination for log records.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Push a record onto the bounded recent list and the per-day list.
    async fn append(&self, record: &LogRecord) -> Result<()>;

    /// Up to `limit` records, newest first, capped at [`LogSink::recent_capacity`].
    async fn load_recent(&self, limit: usize) -> Result<Vec<LogRecord>>;

    /// Maximum number of records kept on the recent list.
    fn recent_capacity(&self) -> usize;
}
