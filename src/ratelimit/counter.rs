//! Fixed-window counter keys.

use chrono::{DateTime, DurationRound, Utc};
use std::fmt;
use std::time::Duration;

/// Length of one counting window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Key identifying one identity's counter in one UTC minute,
/// rendered as `<prefix><identity>:<YYYYMMDDHHmm>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// Namespace prefix, e.g. `rl:`
    pub prefix: String,
    /// The admission-control identity
    pub identity: String,
    /// Start of the window, truncated to the minute
    pub window_start: DateTime<Utc>,
}

impl WindowKey {
    /// Create the key for the window containing `at`.
    pub fn new(prefix: &str, identity: &str, at: DateTime<Utc>) -> Self {
        let window_start = at
            .duration_trunc(chrono::Duration::minutes(1))
            .unwrap_or(at);

        Self {
            prefix: prefix.to_string(),
            identity: identity.to_string(),
            window_start,
        }
    }

    /// Convert the key to the string stored in the backend.
    pub fn to_string_key(&self) -> String {
        format!(
            "{}{}:{}",
            self.prefix,
            self.identity,
            self.window_start.format("%Y%m%d%H%M")
        )
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
