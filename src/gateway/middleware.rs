//! Admission middleware.
//!
//! Per request: assign the correlation id, derive the identity, ask the
//! limiter, then either short-circuit with a 429 or run the handler. The
//! access record is always built after the response exists, so status and
//! duration are accurate even for denials and failed handlers.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use super::{AuthenticatedSubject, RequestId, ACCESS_LOG_TARGET, REQUEST_ID_HEADER};
use crate::metrics;
use crate::ratelimit::{normalize_address, Decision, Identity, RateLimiterBackend, FALLBACK_ADDRESS};
use crate::telemetry::{LogLevel, LogRecord, TelemetryQueue};

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RETRY_AFTER_HEADER: &str = "retry-after";

/// Shared state of the admission middleware.
#[derive(Clone)]
pub struct GatewayState {
    pub limiter: Arc<dyn RateLimiterBackend>,
    /// Telemetry queue receiving access records, if telemetry is enabled
    pub queue: Option<Arc<TelemetryQueue>>,
    /// Advertised in `X-RateLimit-Limit`
    pub requests_per_minute: u32,
    /// Honour `X-Forwarded-For` / `X-Real-IP` when resolving the client address
    pub trust_forwarded_headers: bool,
}

impl GatewayState {
    pub fn new(limiter: Arc<dyn RateLimiterBackend>, requests_per_minute: u32) -> Self {
        Self {
            limiter,
            queue: None,
            requests_per_minute,
            trust_forwarded_headers: false,
        }
    }

    pub fn with_queue(mut self, queue: Arc<TelemetryQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_trusted_forwarding(mut self, trusted: bool) -> Self {
        self.trust_forwarded_headers = trusted;
        self
    }
}

/// Gate a request on the rate limiter and record it afterwards.
pub async fn admission(State(state): State<GatewayState>, mut req: Request, next: Next) -> Response {
    let started = Instant::now();

    let request_id = request_id(req.headers());
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let address = client_address(&req, state.trust_forwarded_headers);
    let subject = req
        .extensions()
        .get::<AuthenticatedSubject>()
        .map(|s| s.0.clone());
    let identity = Identity::derive(subject.as_deref(), address);

    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let decision = state.limiter.allow(&identity.to_string_key()).await;
    metrics::record_admission(state.limiter.strategy(), decision.permitted);

    let mut response = if decision.permitted {
        next.run(req).await
    } else {
        debug!(
            request_id = %request_id,
            identity = %identity,
            retry_after_secs = decision.retry_after_secs(),
            "Request denied by rate limiter"
        );
        denial()
    };

    apply_headers(response.headers_mut(), &decision, state.requests_per_minute, &request_id);

    let access = AccessRecord {
        request_id: &request_id,
        method: &method,
        path: &path,
        status: response.status(),
        duration: started.elapsed(),
        ip: address.map(normalize_address).unwrap_or(FALLBACK_ADDRESS),
        identity: &identity,
        user: subject.as_deref(),
    };
    access.log();
    if let Some(queue) = &state.queue {
        queue.enqueue(access.to_record());
    }

    response
}

fn denial() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "rate limit exceeded",
            "code": "too_many_requests",
        })),
    )
        .into_response()
}

fn apply_headers(headers: &mut HeaderMap, decision: &Decision, limit: u32, request_id: &str) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(limit));

    // Burst headroom is not advertised, so remaining never exceeds the limit
    let remaining = decision
        .remaining
        .map(|remaining| HeaderValue::from(remaining.min(u64::from(limit))))
        .unwrap_or_else(|| HeaderValue::from_static("unknown"));
    headers.insert(REMAINING_HEADER, remaining);

    if !decision.permitted {
        headers.insert(RETRY_AFTER_HEADER, HeaderValue::from(decision.retry_after_secs()));
    }

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
}

/// Reuse a non-empty incoming request id, otherwise generate one.
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Resolve the client address.
///
/// Forwarding headers are only consulted when the gateway sits behind a
/// trusted proxy; otherwise the peer address of the connection is used.
fn client_address(req: &Request, trust_forwarded: bool) -> Option<IpAddr> {
    if trust_forwarded {
        let headers = req.headers();
        let forwarded = header_str(headers, "x-forwarded-for").and_then(|value| {
            value
                .split(',')
                .map(str::trim)
                .find_map(|entry| entry.parse::<IpAddr>().ok())
        });
        let real_ip =
            || header_str(headers, "x-real-ip").and_then(|value| value.trim().parse::<IpAddr>().ok());

        if let Some(addr) = forwarded.or_else(real_ip) {
            return Some(addr);
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(peer)| peer.ip())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// One completed request, written to the local log and the telemetry queue.
struct AccessRecord<'a> {
    request_id: &'a str,
    method: &'a Method,
    path: &'a str,
    status: StatusCode,
    duration: Duration,
    ip: IpAddr,
    identity: &'a Identity,
    user: Option<&'a str>,
}

impl AccessRecord<'_> {
    fn log(&self) {
        info!(
            target: ACCESS_LOG_TARGET,
            request_id = %self.request_id,
            method = %self.method,
            path = %self.path,
            status = self.status.as_u16(),
            duration_ms = self.duration.as_secs_f64() * 1000.0,
            ip = %self.ip,
            identity = %self.identity,
            user = self.user.unwrap_or(""),
            "http"
        );
    }

    fn to_record(&self) -> LogRecord {
        LogRecord::new(Utc::now(), LogLevel::Info, "http")
            .with("requestId", self.request_id)
            .with("method", self.method.as_str())
            .with("path", self.path)
            .with("status", self.status.as_u16())
            .with("duration", format!("{:?}", self.duration))
            .with("durationMs", self.duration.as_secs_f64() * 1000.0)
            .with("ip", self.ip.to_string())
            .with("identity", self.identity.to_string_key())
            .with("userID", self.user.map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(headers: &[(&str, &str)], peer: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri("/api/ping");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        if let Some(peer) = peer {
            req.extensions_mut()
                .insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        }
        req
    }

    #[test]
    fn test_request_id_is_propagated_or_generated() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc-123"));
        assert_eq!(request_id(&headers), "abc-123");

        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("  "));
        let generated = request_id(&headers);
        assert!(Uuid::parse_str(&generated).is_ok());
    }

    #[test]
    fn test_peer_address_is_used_by_default() {
        let req = request(&[("x-forwarded-for", "203.0.113.9")], Some("10.0.0.5:4000"));
        assert_eq!(client_address(&req, false), Some("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn test_forwarded_headers_when_trusted() {
        let req = request(
            &[("x-forwarded-for", "garbage, 203.0.113.9, 10.0.0.1")],
            Some("10.0.0.5:4000"),
        );
        assert_eq!(client_address(&req, true), Some("203.0.113.9".parse().unwrap()));

        let req = request(&[("x-real-ip", "198.51.100.4")], Some("10.0.0.5:4000"));
        assert_eq!(client_address(&req, true), Some("198.51.100.4".parse().unwrap()));

        let req = request(&[], Some("10.0.0.5:4000"));
        assert_eq!(client_address(&req, true), Some("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn test_missing_peer_resolves_to_none() {
        assert_eq!(client_address(&request(&[], None), false), None);
    }

    #[test]
    fn test_denial_headers() {
        let mut headers = HeaderMap::new();
        let decision = Decision::deny(Duration::from_millis(2300));
        apply_headers(&mut headers, &decision, 60, "rid");

        assert_eq!(headers[LIMIT_HEADER], "60");
        assert_eq!(headers[REMAINING_HEADER], "0");
        assert_eq!(headers[RETRY_AFTER_HEADER], "3");
        assert_eq!(headers[REQUEST_ID_HEADER], "rid");
    }

    #[test]
    fn test_remaining_is_clamped_to_advertised_limit() {
        let mut headers = HeaderMap::new();
        apply_headers(&mut headers, &Decision::admit_with_remaining(14), 10, "rid");
        assert_eq!(headers[LIMIT_HEADER], "10");
        assert_eq!(headers[REMAINING_HEADER], "10");

        let mut headers = HeaderMap::new();
        apply_headers(&mut headers, &Decision::admit_with_remaining(3), 10, "rid");
        assert_eq!(headers[REMAINING_HEADER], "3");
    }

    #[test]
    fn test_unknown_remaining_and_no_retry_on_admit() {
        let mut headers = HeaderMap::new();
        apply_headers(&mut headers, &Decision::admit(), 10, "rid");

        assert_eq!(headers[REMAINING_HEADER], "unknown");
        assert!(headers.get(RETRY_AFTER_HEADER).is_none());
    }

    #[test]
    fn test_access_record_shape() {
        let identity = Identity::Subject("u1".to_string());
        let access = AccessRecord {
            request_id: "rid",
            method: &Method::POST,
            path: "/api/items",
            status: StatusCode::CREATED,
            duration: Duration::from_millis(12),
            ip: "10.0.0.5".parse().unwrap(),
            identity: &identity,
            user: Some("u1"),
        };

        let record = access.to_record();
        assert_eq!(record.message, "http");
        assert_eq!(record.level, LogLevel::Info);
        assert_eq!(record.context["requestId"], "rid");
        assert_eq!(record.context["method"], "POST");
        assert_eq!(record.context["status"], 201);
        assert_eq!(record.context["duration"], "12ms");
        assert_eq!(record.context["ip"], "10.0.0.5");
        assert_eq!(record.context["userID"], "u1");
    }
}
