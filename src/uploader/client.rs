//! HTTP client for the collector batch endpoint.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::wire::{encode_body, WireTelemetry};
use crate::config::Config;
use crate::error::{Result, UplinkError};
use crate::protocol::TelemetryRecord;

/// Header carrying a fresh id per HTTP attempt
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Header carrying the stable id of the logical batch
pub const BATCH_ID_HEADER: &str = "X-Batch-ID";

/// Collector acknowledgement of a delivered batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchAck {
    /// HTTP status (200 or 201)
    pub status: u16,
    /// Number of ids the collector reported as stored
    pub accepted: usize,
    /// Collector saw this batch id before
    pub duplicate: bool,
    /// Raw response body, kept with the batch record
    pub body: String,
}

#[derive(Debug, Default, Deserialize)]
struct AckBody {
    #[serde(default)]
    ids: Vec<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    duplicate: bool,
}

impl BatchAck {
    /// Interpret a success response; an unparseable body is still a success
    pub fn parse(status: u16, body: String) -> Self {
        let parsed: AckBody = serde_json::from_str(&body).unwrap_or_default();
        let duplicate = parsed.duplicate
            || parsed
                .message
                .as_deref()
                .is_some_and(|m| m.to_ascii_lowercase().contains("duplicate"));

        Self {
            status,
            accepted: parsed.ids.len(),
            duplicate,
            body,
        }
    }
}

/// Delivers one batch of records to the collector
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CollectorClient: Send + Sync {
    /// Send `records` under `batch_id`
    ///
    /// # Errors
    ///
    /// * `ServerRejected` - 4xx, not retried within the call
    /// * `ServerError`, `Timeout`, `NetworkUnavailable` - after in-call retries are exhausted
    async fn send_batch(&self, batch_id: &str, records: &[TelemetryRecord]) -> Result<BatchAck>;
}

/// reqwest-based [`CollectorClient`]
#[derive(Debug, Clone)]
pub struct HttpCollectorClient {
    client: reqwest::Client,
    batch_url: String,
    device_id: String,
    session_id: Option<String>,
    timeout: Duration,
    max_attempts: u32,
    initial_backoff: Duration,
    compress: bool,
}

impl HttpCollectorClient {
    /// Create a client with default timeout (30s), 3 attempts and gzip bodies
    ///
    /// # Arguments
    ///
    /// * `client` - Shared HTTP client
    /// * `batch_url` - Full batch endpoint URL
    /// * `device_id` - Device id stamped on every record
    pub fn new(client: reqwest::Client, batch_url: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            client,
            batch_url: batch_url.into(),
            device_id: device_id.into(),
            session_id: None,
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            compress: true,
        }
    }

    /// Build a client from the `[collector]` and `[device]` sections
    pub fn from_config(client: reqwest::Client, config: &Config) -> Self {
        let collector = &config.collector;
        Self::new(client, config.batch_url(), config.device.device_id.clone())
            .with_session_id(config.device.session_id.clone())
            .with_timeout(Duration::from_millis(collector.upload_timeout_ms))
            .with_retry(collector.max_attempts, Duration::from_millis(collector.initial_backoff_ms))
            .with_compression(collector.compress)
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// In-call retry policy: up to `max_attempts` tries, backoff doubling from `initial_backoff`
    pub fn with_retry(mut self, max_attempts: u32, initial_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.initial_backoff = initial_backoff;
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    async fn post_once(&self, batch_id: &str, body: Bytes) -> Result<BatchAck> {
        let request_id = Uuid::new_v4().to_string();

        let mut request = self
            .client
            .post(&self.batch_url)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(REQUEST_ID_HEADER, request_id.as_str())
            .header(BATCH_ID_HEADER, batch_id)
            .body(body);
        if self.compress {
            request = request.header(CONTENT_ENCODING, "gzip");
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        debug!("Batch {} request {} answered {}", batch_id, request_id, status);

        match status {
            StatusCode::OK | StatusCode::CREATED => Ok(BatchAck::parse(status.as_u16(), text)),
            s if s.is_client_error() => Err(UplinkError::ServerRejected {
                status: s.as_u16(),
                body: text,
            }),
            s => Err(UplinkError::ServerError { status: s.as_u16() }),
        }
    }
}

fn transport_error(e: reqwest::Error) -> UplinkError {
    if e.is_timeout() {
        UplinkError::Timeout
    } else {
        UplinkError::NetworkUnavailable(e.to_string())
    }
}

#[async_trait]
impl CollectorClient for HttpCollectorClient {
    async fn send_batch(&self, batch_id: &str, records: &[TelemetryRecord]) -> Result<BatchAck> {
        let batch: Vec<WireTelemetry> = records
            .iter()
            .map(|r| WireTelemetry::from_record(r, &self.device_id, self.session_id.as_deref()))
            .collect();
        let body = encode_body(&batch, self.compress)?;

        let mut backoff = self.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.post_once(batch_id, body.clone()).await {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        "Batch {} attempt {}/{} failed: {}, retrying in {:?}",
                        batch_id, attempt, self.max_attempts, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
