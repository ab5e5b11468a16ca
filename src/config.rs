//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{GatewayError, Result};
use crate::telemetry::LogLevel;

/// Main configuration for the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission control configuration
    #[serde(default)]
    pub rate_limit: LimiterConfig,

    /// Redis connection used by the shared limiter and the log sink
    #[serde(default)]
    pub redis: RedisConfig,

    /// Telemetry queue configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Local logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Honour `X-Forwarded-For` / `X-Real-IP` when resolving the client address
    #[serde(default)]
    pub trust_forwarded_headers: bool,

    /// Bearer token required by `GET /api/logs`; the endpoint is not
    /// mounted when unset
    #[serde(default)]
    pub logs_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            trust_forwarded_headers: false,
            logs_token: None,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which limiter implementation backs admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Every request is admitted
    Disabled,
    /// Process-local token bucket
    #[serde(alias = "memory")]
    Local,
    /// Fixed-window counter kept in a shared backend
    #[serde(alias = "redis")]
    Shared,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Disabled => "disabled",
            Strategy::Local => "local",
            Strategy::Shared => "shared",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission control configuration. Immutable once the limiter is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Master switch; when false the disabled limiter is used
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Limiter implementation
    #[serde(default = "default_strategy")]
    pub strategy: Strategy,

    /// Sustained rate per identity
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Extra instantaneous allowance on top of the sustained rate
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Namespace prefix for shared window counter keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Budget for each call to the shared counter backend
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,

    /// Retry hint used when the backend cannot report a window TTL
    #[serde(default = "default_fallback_retry_after_secs")]
    pub fallback_retry_after_secs: u64,

    /// How often idle local buckets are swept (0 disables sweeping)
    #[serde(default = "default_idle_sweep_interval_secs")]
    pub idle_sweep_interval_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: default_strategy(),
            requests_per_minute: default_requests_per_minute(),
            burst: default_burst(),
            key_prefix: default_key_prefix(),
            backend_timeout_ms: default_backend_timeout_ms(),
            fallback_retry_after_secs: default_fallback_retry_after_secs(),
            idle_sweep_interval_secs: default_idle_sweep_interval_secs(),
        }
    }
}

impl LimiterConfig {
    /// Strategy that is actually in effect, taking `enabled` into account.
    pub fn effective_strategy(&self) -> Strategy {
        if self.enabled {
            self.strategy
        } else {
            Strategy::Disabled
        }
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn fallback_retry_after(&self) -> Duration {
        Duration::from_secs(self.fallback_retry_after_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_strategy() -> Strategy {
    Strategy::Local
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_burst() -> u32 {
    10
}

fn default_key_prefix() -> String {
    "rl:".to_string()
}

fn default_backend_timeout_ms() -> u64 {
    500
}

fn default_fallback_retry_after_secs() -> u64 {
    10
}

fn default_idle_sweep_interval_secs() -> u64 {
    300
}

/// Redis connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/0`
    #[serde(default)]
    pub url: Option<String>,
}

/// Telemetry queue and durable sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Whether access records are forwarded to the durable sink
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Fixed capacity of the in-memory buffer
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum length of the "recent" list kept by the sink
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,

    /// Budget for persisting a single record
    #[serde(default = "default_persist_timeout_ms")]
    pub persist_timeout_ms: u64,

    /// How long per-day lists are retained
    #[serde(default = "default_daily_retention_days")]
    pub daily_retention_days: u64,

    /// Minimum level of application log events mirrored into the sink
    #[serde(default = "default_forward_level")]
    pub forward_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: default_queue_capacity(),
            recent_capacity: default_recent_capacity(),
            persist_timeout_ms: default_persist_timeout_ms(),
            daily_retention_days: default_daily_retention_days(),
            forward_level: default_forward_level(),
        }
    }
}

impl TelemetryConfig {
    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }

    pub fn daily_retention(&self) -> Duration {
        Duration::from_secs(self.daily_retention_days * 24 * 60 * 60)
    }

    /// Parsed `forward_level`.
    pub fn forward_level(&self) -> Result<LogLevel> {
        self.forward_level
            .parse()
            .map_err(|e| GatewayError::Config(format!("telemetry.forward_level: {}", e)))
    }
}

fn default_queue_capacity() -> usize {
    2048
}

fn default_recent_capacity() -> usize {
    2000
}

fn default_persist_timeout_ms() -> u64 {
    500
}

fn default_daily_retention_days() -> u64 {
    7
}

fn default_forward_level() -> String {
    "warn".to_string()
}

/// Local logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatewayConfig {
    /// Load configuration from an optional YAML file layered with
    /// `TURNSTILE__SECTION__KEY` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading gateway configuration");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: GatewayConfig = builder
            .add_source(
                config::Environment::with_prefix("TURNSTILE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatewayConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.requests_per_minute == 0 {
            return Err(GatewayError::Config(
                "rate_limit.requests_per_minute must be greater than zero".to_string(),
            ));
        }
        if self.telemetry.queue_capacity == 0 {
            return Err(GatewayError::Config(
                "telemetry.queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.telemetry.recent_capacity == 0 {
            return Err(GatewayError::Config(
                "telemetry.recent_capacity must be greater than zero".to_string(),
            ));
        }
        self.telemetry.forward_level()?;
        if self
            .server
            .logs_token
            .as_deref()
            .is_some_and(|token| token.trim().is_empty())
        {
            return Err(GatewayError::Config(
                "server.logs_token must not be empty".to_string(),
            ));
        }
        if self.rate_limit.effective_strategy() == Strategy::Shared && self.redis.url.is_none() {
            return Err(GatewayError::Config(
                "the shared strategy requires redis.url".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limit.strategy, Strategy::Local);
        assert_eq!(config.rate_limit.backend_timeout(), Duration::from_millis(500));
        assert_eq!(config.telemetry.daily_retention(), Duration::from_secs(7 * 86400));
        assert!(config.server.logs_token.is_none());
    }

    #[test]
    fn test_empty_logs_token_is_rejected() {
        let mut config = GatewayConfig::default();
        config.server.logs_token = Some("  ".to_string());
        assert!(config.validate().is_err());

        config.server.logs_token = Some("s3cret".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:9000"
  trust_forwarded_headers: true
  logs_token: "s3cret"
rate_limit:
  enabled: true
  strategy: shared
  requests_per_minute: 120
  burst: 20
redis:
  url: "redis://127.0.0.1/"
telemetry:
  queue_capacity: 16
logging:
  level: debug
  json: true
"#;
        let config = GatewayConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.http_addr.port(), 9000);
        assert!(config.server.trust_forwarded_headers);
        assert_eq!(config.server.logs_token.as_deref(), Some("s3cret"));
        assert_eq!(config.rate_limit.strategy, Strategy::Shared);
        assert_eq!(config.rate_limit.requests_per_minute, 120);
        assert_eq!(config.rate_limit.burst, 20);
        assert_eq!(config.telemetry.queue_capacity, 16);
        assert_eq!(config.telemetry.recent_capacity, 2000);
        assert!(config.logging.json);
    }

    #[test]
    fn test_legacy_strategy_aliases() {
        let config = GatewayConfig::from_yaml("rate_limit:\n  strategy: memory\n").unwrap();
        assert_eq!(config.rate_limit.strategy, Strategy::Local);

        let yaml = "rate_limit:\n  strategy: redis\nredis:\n  url: \"redis://localhost/\"\n";
        let config = GatewayConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.rate_limit.strategy, Strategy::Shared);
    }

    #[test]
    fn test_unknown_strategy_is_fatal() {
        let result = GatewayConfig::from_yaml("rate_limit:\n  strategy: sliding\n");
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_zero_rate_rejected() {
        let result = GatewayConfig::from_yaml("rate_limit:\n  requests_per_minute: 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_shared_requires_redis_url() {
        let result = GatewayConfig::from_yaml("rate_limit:\n  strategy: shared\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_forward_level_is_validated() {
        let config = GatewayConfig::from_yaml("telemetry:\n  forward_level: ERROR\n").unwrap();
        assert_eq!(config.telemetry.forward_level().unwrap(), LogLevel::Error);

        let result = GatewayConfig::from_yaml("telemetry:\n  forward_level: loud\n");
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_disabled_overrides_strategy() {
        let yaml = "rate_limit:\n  enabled: false\n  strategy: shared\n";
        let config = GatewayConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.rate_limit.effective_strategy(), Strategy::Disabled);
    }
}
