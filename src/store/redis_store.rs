//! Redis-backed counter backend and log sink.
//!
//! ## Key layout
//!
//! - `rl:<identity>:<YYYYMMDDHHmm>`: window counters (`INCR` + `EXPIRE`),
//!   key composed by the shared window limiter
//! - `logs:recent`: rolling list of the newest records, trimmed on every write
//! - `logs:<YYYY-MM-DD>`: per-day archive, expires after the retention period
//!
//! The connection is a `redis::aio::ConnectionManager`, which reconnects on its
//! own after failures. No call here applies a timeout; callers wrap every
//! operation in their own budget.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use super::{daily_logs_key, CounterStore, LogSink, RECENT_LOGS_KEY};
use crate::error::{GatewayError, Result};
use crate::telemetry::LogRecord;

/// Budget for the initial connection and `PING`.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Maximum length of the recent list (default: 2000)
    pub recent_capacity: usize,
    /// Lifetime of each per-day list (default: 7 days)
    pub daily_retention: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            recent_capacity: 2000,
            daily_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Redis implementation of [`CounterStore`] and [`LogSink`].
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect and verify the server answers a `PING`.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid, the connection fails, or the
    /// server does not answer within three seconds.
    pub async fn connect(url: &str, config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(url)?;

        let mut connection =
            tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
                .await
                .map_err(|_| GatewayError::Timeout(CONNECT_TIMEOUT))??;

        let ping = redis::cmd("PING");
        let pong: String = tokio::time::timeout(CONNECT_TIMEOUT, ping.query_async(&mut connection))
            .await
            .map_err(|_| GatewayError::Timeout(CONNECT_TIMEOUT))?
            .map_err(|e| {
                warn!(error = %e, "Redis ping failed");
                GatewayError::Backend(e)
            })?;

        info!(response = %pong, recent_capacity = config.recent_capacity, "Redis connected");

        Ok(Self { connection, config })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str) -> Result<i64> {
        let count: i64 = self.conn().incr(key, 1).await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let _: () = self.conn().expire(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>> {
        // -2: key missing, -1: no expiry
        let ttl: i64 = self.conn().ttl(key).await?;
        Ok(u64::try_from(ttl).ok().map(Duration::from_secs))
    }
}

#[async_trait]
impl LogSink for RedisStore {
    async fn append(&self, record: &LogRecord) -> Result<()> {
        let raw = record.to_json()?;
        let day_key = daily_logs_key(chrono::Utc::now());
        let keep_until = self.config.recent_capacity.saturating_sub(1) as isize;

        let _: () = redis::pipe()
            .atomic()
            .lpush(RECENT_LOGS_KEY, &raw)
            .ignore()
            .ltrim(RECENT_LOGS_KEY, 0, keep_until)
            .ignore()
            .lpush(&day_key, &raw)
            .ignore()
            .expire(&day_key, self.config.daily_retention.as_secs() as i64)
            .ignore()
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn load_recent(&self, limit: usize) -> Result<Vec<LogRecord>> {
        let limit = limit.min(self.config.recent_capacity);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let raws: Vec<String> = self
            .conn()
            .lrange(RECENT_LOGS_KEY, 0, (limit - 1) as isize)
            .await?;

        Ok(raws
            .iter()
            .filter_map(|raw| LogRecord::from_json(raw).ok())
            .collect())
    }

    fn recent_capacity(&self) -> usize {
        self.config.recent_capacity
    }
}
