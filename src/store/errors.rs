//! Backing store error types
//!
//! Structured error handling for upstream file bridge operations.
//! Maps HTTP status codes to specific error variants for retry decisions.

/// Backing store error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limited, try again after backoff")]
    RateLimited,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Request error: {0}")]
    Request(String),
}

impl StoreError {
    /// Whether this error is worth retrying against the upstream
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::RateLimited
                | StoreError::Timeout
                | StoreError::Network(_)
                | StoreError::Server(_, _)
        )
    }

    /// Create a StoreError from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            403 => StoreError::Forbidden(body.to_string()),
            404 | 410 => StoreError::NotFound(body.to_string()),
            408 | 504 => StoreError::Timeout,
            429 => StoreError::RateLimited,
            500..=599 => StoreError::Server(status, body.to_string()),
            _ => StoreError::Request(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else if let Some(status) = err.status() {
            StoreError::from_status(status.as_u16(), &err.to_string())
        } else if err.is_connect() || err.is_request() || err.is_body() {
            StoreError::Network(err.to_string())
        } else {
            StoreError::Request(err.to_string())
        }
    }
}
