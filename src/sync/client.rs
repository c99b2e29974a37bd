//! HTTP seam and the typed sync API built on it.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::sync::protocol::{
    decode_response, PullRequest, PullResponse, PushRequest, PushResponse, PULL_PATH, PUSH_PATH,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("server rejected request ({code}): {message}")]
    Api { code: String, message: String },

    #[error("invalid request: {0}")]
    Encode(String),
}

impl TransportError {
    /// Connectivity problems, server errors, 408 and 429 may succeed later.
    /// Anything the server refused as malformed will not.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::Timeout => true,
            TransportError::Http { status, .. } => *status >= 500 || matches!(status, 408 | 429),
            TransportError::Decode(_) | TransportError::Api { .. } | TransportError::Encode(_) => {
                false
            }
        }
    }
}

/// Minimal JSON-over-HTTP client. Paths are relative to the server base URL.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, path: &str) -> Result<serde_json::Value, TransportError>;
    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError>;
    async fn patch(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError>;
    async fn delete(&self, path: &str) -> Result<serde_json::Value, TransportError>;
}

/// Typed push/pull calls.
#[derive(Clone)]
pub struct SyncApi {
    http: Arc<dyn HttpClient>,
    device_id: String,
}

impl SyncApi {
    pub fn new(http: Arc<dyn HttpClient>, device_id: impl Into<String>) -> Self {
        Self {
            http,
            device_id: device_id.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub async fn push(&self, mut request: PushRequest) -> Result<PushResponse, TransportError> {
        if request.device_id.is_none() {
            request.device_id = Some(self.device_id.clone());
        }
        let body =
            serde_json::to_value(&request).map_err(|e| TransportError::Encode(e.to_string()))?;
        decode_response(self.http.post(PUSH_PATH, body).await?)
    }

    pub async fn pull(&self, request: PullRequest) -> Result<PullResponse, TransportError> {
        let body =
            serde_json::to_value(&request).map_err(|e| TransportError::Encode(e.to_string()))?;
        decode_response(self.http.post(PULL_PATH, body).await?)
    }
}

/// Device id of the form `pipeline-{hostname}-{8 hex}`.
pub fn generate_device_id() -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!(
        "pipeline-{}-{}",
        hostname,
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}
