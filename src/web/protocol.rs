//! JSON bodies served by the gateway
//!
//! Health probes and structured error responses. File bodies are never JSON.

use serde::{Deserialize, Serialize};

/// Body of `/health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

impl HealthResponse {
    pub fn healthy(service: &str) -> Self {
        Self {
            status: "healthy".to_string(),
            service: service.to_string(),
        }
    }
}

/// Body of every error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable machine-readable code, e.g. `not_found`
    pub error: String,
    /// Human-readable detail
    pub message: String,
}

/// Serialize a body to JSON bytes
pub fn to_json<T: Serialize>(body: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(body)
}
