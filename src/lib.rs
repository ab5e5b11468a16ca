//! Turnstile - request admission control for an HTTP API gateway
//!
//! This crate gates every API request on a per-identity rate limiter
//! (disabled, process-local token bucket, or a fixed window shared through
//! Redis) and mirrors access records into a durable log sink through a
//! bounded, non-blocking telemetry queue.

pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod ratelimit;
pub mod store;
pub mod telemetry;
