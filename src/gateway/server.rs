//! HTTP server implementation.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{middleware, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::logs::{recent_logs, require_bearer};
use super::middleware::{admission, GatewayState};
use crate::error::{GatewayError, Result};
use crate::store::LogSink;

/// Wraps the `/api/logs` router with access control.
type RouterGuard = Arc<dyn Fn(Router) -> Router + Send + Sync>;

/// HTTP server fronting the gated API.
pub struct GatewayServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Admission middleware state
    state: GatewayState,
    /// Source for `/api/logs`
    logs: Arc<dyn LogSink>,
    /// `/api/logs` is only mounted behind a guard
    logs_guard: Option<RouterGuard>,
    /// Render handle for `/metrics`
    metrics: Option<Arc<PrometheusHandle>>,
    /// Additional routes mounted under `/api`
    routes: Router,
}

impl GatewayServer {
    pub fn new(addr: SocketAddr, state: GatewayState, logs: Arc<dyn LogSink>) -> Self {
        Self {
            addr,
            state,
            logs,
            logs_guard: None,
            metrics: None,
            routes: Router::new(),
        }
    }

    /// Mount `/api/logs`, wrapped by `guard`.
    ///
    /// The guard receives the logs router and typically adds an
    /// authorization layer to it. Without a guard the endpoint is not served.
    pub fn with_logs_guard<F>(mut self, guard: F) -> Self
    where
        F: Fn(Router) -> Router + Send + Sync + 'static,
    {
        self.logs_guard = Some(Arc::new(guard));
        self
    }

    /// Mount `/api/logs` behind a static bearer token.
    pub fn with_logs_token(self, token: impl Into<Arc<str>>) -> Self {
        let token: Arc<str> = token.into();
        self.with_logs_guard(move |logs| {
            logs.layer(middleware::from_fn_with_state(Arc::clone(&token), require_bearer))
        })
    }

    /// Serve the Prometheus exposition at `/metrics`, outside admission.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(Arc::new(handle));
        self
    }

    /// Mount extra routes under `/api`, behind the admission middleware.
    pub fn with_routes(mut self, routes: Router) -> Self {
        self.routes = self.routes.merge(routes);
        self
    }

    /// Build the router.
    ///
    /// `/health` and `/metrics` are public. Everything under `/api` goes
    /// through admission; panics are caught inside it so the access record
    /// sees the 500.
    pub fn router(&self) -> Router {
        let mut api: Router = Router::new();
        if let Some(guard) = &self.logs_guard {
            let logs = Router::new()
                .route("/logs", get(recent_logs))
                .with_state(Arc::clone(&self.logs));
            api = api.merge(guard(logs));
        }
        let api = api
            .merge(self.routes.clone())
            .layer(CatchPanicLayer::new())
            .layer(middleware::from_fn_with_state(self.state.clone(), admission));

        let mut app: Router = Router::new().route("/health", get(health));
        if let Some(handle) = &self.metrics {
            app = app.merge(
                Router::new()
                    .route("/metrics", get(render_metrics))
                    .with_state(Arc::clone(handle)),
            );
        }

        app.nest("/api", api).layer(TraceLayer::new_for_http())
    }

    /// Start the server with graceful shutdown.
    ///
    /// In-flight requests complete after `signal` resolves; this returns once
    /// the listener is closed.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let listener = TcpListener::bind(self.addr).await?;

        info!(
            addr = %self.addr,
            strategy = %self.state.limiter.strategy(),
            "Starting HTTP gateway"
        );

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            GatewayError::Server(e.to_string())
        })
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn render_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    (StatusCode::OK, handle.render())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::DisabledLimiter;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn server() -> GatewayServer {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let state = GatewayState::new(Arc::new(DisabledLimiter), 60);
        GatewayServer::new(addr, state, Arc::new(MemoryStore::new(10)))
    }

    #[tokio::test]
    async fn test_health_is_not_gated() {
        let response = server()
            .router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }

    #[tokio::test]
    async fn test_api_routes_are_gated() {
        let router = server()
            .with_routes(Router::new().route("/ping", get(|| async { "pong" })))
            .router();

        let response = router
            .oneshot(Request::builder().uri("/api/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "60");
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_logs_endpoint_is_not_served_without_guard() {
        let response = server().router().oneshot(get_request("/api/logs")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_logs_endpoint_requires_bearer_token() {
        let router = server().with_logs_token("s3cret").router();

        let response = router.clone().oneshot(get_request("/api/logs")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()["x-ratelimit-limit"], "60");

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/logs")
                    .header("authorization", "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_are_served_outside_admission() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let router = server().with_metrics(handle).router();

        let response = router.oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }

    #[tokio::test]
    async fn test_metrics_route_absent_without_handle() {
        let response = server().router().oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
