//! Streaming core errors
//!
//! Typed failures shared by the metadata cache, range negotiation and the
//! fetch coordinator. Only the HTTP layer turns these into status codes.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Malformed request: {0}")]
    BadRequest(String),

    #[error("Range not satisfiable for {size} byte file")]
    RangeNotSatisfiable { size: u64 },

    #[error("File too large: {size} bytes exceeds limit of {limit}")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Too many concurrent fetches for {file_id}")]
    Overloaded { file_id: String, retry_after_secs: u64 },

    #[error("Client went away")]
    Cancelled,
}

impl From<StoreError> for StreamError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => StreamError::NotFound(what),
            StoreError::Timeout => StreamError::UpstreamTimeout(err.to_string()),
            other => StreamError::Upstream(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_conversion() {
        assert_eq!(
            StreamError::from(StoreError::NotFound("1_1".into())),
            StreamError::NotFound("1_1".into())
        );
        assert!(matches!(
            StreamError::from(StoreError::Timeout),
            StreamError::UpstreamTimeout(_)
        ));
        assert!(matches!(
            StreamError::from(StoreError::Server(502, "bad".into())),
            StreamError::Upstream(_)
        ));
        assert!(matches!(
            StreamError::from(StoreError::RateLimited),
            StreamError::Upstream(_)
        ));
    }
}
