//! Prometheus counters for admission decisions and telemetry loss.

use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::Strategy;
use crate::error::{GatewayError, Result};

pub const REQUESTS_ADMITTED: &str = "turnstile_requests_admitted_total";
pub const REQUESTS_DENIED: &str = "turnstile_requests_denied_total";
pub const LIMITER_FAIL_OPEN: &str = "turnstile_limiter_fail_open_total";
pub const TELEMETRY_DROPPED: &str = "turnstile_telemetry_dropped_total";

/// Install the global Prometheus recorder and return its render handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| GatewayError::Server(format!("failed to install metrics recorder: {}", e)))?;

    describe_metrics();
    Ok(handle)
}

/// Register metric descriptions; safe to call more than once.
pub fn describe_metrics() {
    describe_counter!(REQUESTS_ADMITTED, "Requests admitted by the rate limiter");
    describe_counter!(REQUESTS_DENIED, "Requests rejected with 429 by the rate limiter");
    describe_counter!(
        LIMITER_FAIL_OPEN,
        "Requests admitted because the shared counter backend failed"
    );
    describe_counter!(
        TELEMETRY_DROPPED,
        "Telemetry records dropped because the queue was full or stopping"
    );
}

/// Record one admission decision.
pub fn record_admission(strategy: Strategy, permitted: bool) {
    let name = if permitted {
        REQUESTS_ADMITTED
    } else {
        REQUESTS_DENIED
    };
    counter!(name, "strategy" => strategy.as_str()).increment(1);
}

pub fn record_fail_open() {
    counter!(LIMITER_FAIL_OPEN).increment(1);
}

pub fn record_telemetry_dropped() {
    counter!(TELEMETRY_DROPPED).increment(1);
}
