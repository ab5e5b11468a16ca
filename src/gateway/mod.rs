//! HTTP gateway: admission middleware, the recent-log endpoint and the server.

mod logs;
mod middleware;
mod server;

pub use self::logs::{recent_logs, require_bearer, LogsQuery, DEFAULT_LOGS_LIMIT};
pub use self::middleware::{admission, GatewayState};
pub use self::server::GatewayServer;

/// Target of the per-request access log event.
pub const ACCESS_LOG_TARGET: &str = "turnstile::access";

/// Correlation identifier header, propagated or generated per request.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Subject identifier placed in request extensions by an upstream
/// authentication layer. Requests carrying one are limited per subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedSubject(pub String);

/// Correlation identifier of the current request, available to handlers as
/// a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
