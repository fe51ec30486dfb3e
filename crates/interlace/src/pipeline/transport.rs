// Batch Transport
//
// Sends one batch to the collector and classifies the outcome. The worker
// owns retry; a transport only reports whether a failure is worth retrying.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use interlace_core::{Result, TracerError};

use super::queue::Batch;
use crate::config::TracerConfig;

/// Delivery channel to the collector
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one batch
    ///
    /// Retryable failures must be `TransientDelivery`; anything else is
    /// treated as permanent and the batch is dropped.
    async fn send(&self, batch: &Batch) -> Result<()>;

    /// Human-readable name for logging
    fn name(&self) -> &str {
        "transport"
    }
}

/// HTTP transport posting JSON batches to `{base_url}/v1/batch`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &TracerConfig) -> Result<Self> {
        Self::with_timeout(
            config.batch_url(),
            config.resolved_api_key().map(str::to_string),
            config.request_timeout,
        )
    }

    pub fn with_timeout(
        url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("interlace-rust/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TracerError::config(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
            api_key,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: &Batch) -> Result<()> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(TracerError::permanent(None, "missing API key"));
        };

        let body = serde_json::to_vec(batch)
            .map_err(|e| TracerError::permanent(None, format!("unserializable batch: {e}")))?;

        debug!(url = %self.url, batch_size = batch.len(), "Sending batch");

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| TracerError::transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(classify_status(status, body))
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Map a non-success status to a delivery error
pub(crate) fn classify_status(status: StatusCode, body: String) -> TracerError {
    let message = format!("HTTP {}: {}", status, body);
    let retryable = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT;

    if retryable {
        TracerError::transient(message)
    } else {
        TracerError::permanent(Some(status.as_u16()), message)
    }
}
