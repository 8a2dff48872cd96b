//! Error types for health checking operations

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during health check operations
#[derive(Error, Debug)]
pub enum HealthError {
    /// The health check timed out
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// TCP connection failed
    #[error("tcp connection failed: {0}")]
    Tcp(#[from] std::io::Error),

    /// The HTTP request failed before a response arrived
    #[error("http request failed: {0}")]
    Http(#[from] hyper::Error),

    /// The health-check URL could not be parsed
    #[error("invalid health-check url: {0}")]
    InvalidUri(String),

    /// The request could not be built
    #[error("invalid request: {0}")]
    Request(String),

    /// The service answered with a status the probe does not accept
    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),

    /// The response body did not contain the expected text
    #[error("response body did not match")]
    BodyMismatch,
}
