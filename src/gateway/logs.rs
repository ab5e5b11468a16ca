//! `GET /api/logs`: newest records from the durable sink.

use axum::extract::{Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use crate::store::LogSink;

/// Records returned when `limit` is missing or not a positive integer.
pub const DEFAULT_LOGS_LIMIT: usize = 100;

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    /// Kept as a string so a malformed value falls back to the default
    /// instead of rejecting the request
    pub limit: Option<String>,
}

impl LogsQuery {
    /// Requested limit, defaulted and capped at `max`.
    pub fn effective_limit(&self, max: usize) -> usize {
        self.limit
            .as_deref()
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .filter(|&limit| limit > 0)
            .unwrap_or(DEFAULT_LOGS_LIMIT)
            .min(max)
    }
}

pub async fn recent_logs(
    State(sink): State<Arc<dyn LogSink>>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let limit = query.effective_limit(sink.recent_capacity());

    match sink.load_recent(limit).await {
        Ok(items) => Json(json!({
            "count": items.len(),
            "items": items,
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, limit, "Failed to load recent logs");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to load logs" })),
            )
                .into_response()
        }
    }
}

/// Admit only requests presenting `Authorization: Bearer <token>`.
pub async fn require_bearer(State(token): State<Arc<str>>, req: Request, next: Next) -> Response {
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if presented == Some(&*token) {
        return next.run(req).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthorized" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(limit: Option<&str>) -> LogsQuery {
        LogsQuery {
            limit: limit.map(str::to_string),
        }
    }

    #[test]
    fn test_effective_limit() {
        assert_eq!(query(None).effective_limit(2000), DEFAULT_LOGS_LIMIT);
        assert_eq!(query(Some("25")).effective_limit(2000), 25);
        assert_eq!(query(Some("abc")).effective_limit(2000), DEFAULT_LOGS_LIMIT);
        assert_eq!(query(Some("0")).effective_limit(2000), DEFAULT_LOGS_LIMIT);
        assert_eq!(query(Some("-3")).effective_limit(2000), DEFAULT_LOGS_LIMIT);
        assert_eq!(query(Some("5000")).effective_limit(2000), 2000);
        assert_eq!(query(None).effective_limit(10), 10);
    }
}
