//! Structured log record persisted to the durable sink.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Severity of a [`LogRecord`], stored upper-case (`INFO`, `WARN`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    /// Case-insensitive; accepts `warning` for `warn`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// One structured log entry.
///
/// The serialized form `{ts, level, message, context}` is the exact schema
/// written to and read back from the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// RFC 3339 timestamp in UTC
    #[serde(rename = "ts")]
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
    /// Arbitrary key/value context; omitted when empty
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl LogRecord {
    pub fn new(at: DateTime<Utc>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: at.to_rfc3339_opts(SecondsFormat::Secs, true),
            level,
            message: message.into(),
            context: Map::new(),
        }
    }

    /// Attach a context value, replacing any previous value for `key`.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_wire_shape() {
        let at = Utc.with_ymd_and_hms(2025, 10, 21, 8, 30, 5).unwrap();
        let record = LogRecord::new(at, LogLevel::Info, "http")
            .with("status", 200)
            .with("path", "/api/users");

        let value: Value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["ts"], "2025-10-21T08:30:05Z");
        assert_eq!(value["level"], "INFO");
        assert_eq!(value["message"], "http");
        assert_eq!(value["context"]["status"], 200);
        assert_eq!(value["context"]["path"], "/api/users");
    }

    #[test]
    fn test_empty_context_is_omitted_and_tolerated() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let raw = LogRecord::new(at, LogLevel::Warn, "redis incr fail").to_json().unwrap();
        assert!(!raw.contains("context"));

        let parsed = LogRecord::from_json(&raw).unwrap();
        assert_eq!(parsed.level, LogLevel::Warn);
        assert!(parsed.context.is_empty());
    }

    #[test]
    fn test_level_ordering_matches_severity() {
        assert!(LogLevel::Error > LogLevel::Warn);
        assert!(LogLevel::Warn > LogLevel::Info);
        assert_eq!(LogLevel::from(&tracing::Level::WARN), LogLevel::Warn);
    }
}
