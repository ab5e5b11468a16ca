//! Error types for the Turnstile gateway core.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors reported by the Redis backend
    #[error("Backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// The remote backend could not be reached or refused the operation
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A remote call did not complete within its budget
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Log record encoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
