//! HTTP gateway to the sync server.
//!
//! The configuration is always available so it can live in the app config.
//! The reqwest-backed [`GatewayClient`] requires the `gateway` feature.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server base URL, e.g. `https://sync.example.com/api`
    pub base_url: String,
    /// Bearer authentication token
    #[serde(default)]
    pub token: Option<String>,
    /// Per-request timeout
    #[serde(with = "crate::config::duration_ms", default = "default_timeout")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

impl GatewayConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: default_timeout(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Join a request path onto the base URL.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Get the health check endpoint URL.
    pub fn health_url(&self) -> String {
        self.url("/health")
    }
}

#[cfg(feature = "gateway")]
pub use client::GatewayClient;

#[cfg(feature = "gateway")]
mod client {
    use async_trait::async_trait;

    use super::GatewayConfig;
    use crate::sync::client::{HttpClient, TransportError};

    /// reqwest implementation of [`HttpClient`].
    pub struct GatewayClient {
        config: GatewayConfig,
        client: reqwest::Client,
    }

    impl GatewayClient {
        pub fn new(config: GatewayConfig) -> Result<Self, TransportError> {
            let client = reqwest::Client::builder()
                .timeout(config.timeout)
                .build()
                .map_err(|e| TransportError::Network(format!("failed to build client: {e}")))?;
            Ok(Self { config, client })
        }

        pub fn config(&self) -> &GatewayConfig {
            &self.config
        }

        /// Test connection to the server.
        pub async fn test_connection(&self) -> Result<bool, TransportError> {
            let response = self
                .client
                .get(self.config.health_url())
                .send()
                .await
                .map_err(map_send_error)?;

            Ok(response.status().is_success())
        }

        async fn send(
            &self,
            builder: reqwest::RequestBuilder,
        ) -> Result<serde_json::Value, TransportError> {
            let builder = match &self.config.token {
                Some(token) => builder.header("Authorization", format!("Bearer {token}")),
                None => builder,
            };

            let response = builder.send().await.map_err(map_send_error)?;

            let status = response.status();
            if !status.is_success() {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(TransportError::Http {
                    status: status.as_u16(),
                    message,
                });
            }

            let bytes = response.bytes().await.map_err(map_send_error)?;
            if bytes.is_empty() {
                return Ok(serde_json::Value::Null);
            }
            serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
        }
    }

    fn map_send_error(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Network(err.to_string())
        }
    }

    #[async_trait]
    impl HttpClient for GatewayClient {
        async fn get(&self, path: &str) -> Result<serde_json::Value, TransportError> {
            self.send(self.client.get(self.config.url(path))).await
        }

        async fn post(
            &self,
            path: &str,
            body: serde_json::Value,
        ) -> Result<serde_json::Value, TransportError> {
            self.send(self.client.post(self.config.url(path)).json(&body))
                .await
        }

        async fn patch(
            &self,
            path: &str,
            body: serde_json::Value,
        ) -> Result<serde_json::Value, TransportError> {
            self.send(self.client.patch(self.config.url(path)).json(&body))
                .await
        }

        async fn delete(&self, path: &str) -> Result<serde_json::Value, TransportError> {
            self.send(self.client.delete(self.config.url(path))).await
        }
    }
}
