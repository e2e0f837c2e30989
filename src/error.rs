//! # Error Types
//!
//! Custom error types for Telemetry Uplink using `thiserror`.

use thiserror::Error;

/// Main error type for Telemetry Uplink
#[derive(Debug, Error)]
pub enum UplinkError {
    /// Frame failed header, length or checksum validation
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Telemetry payload had the wrong size for its message type
    #[error("Unexpected payload size: expected {expected} bytes, got {actual}")]
    UnexpectedPayloadSize { expected: usize, actual: usize },

    /// Field extraction failed; no partial record is produced
    #[error("Telemetry decode failure: {0}")]
    DecodeFailure(String),

    /// Ingestion write into the durable queue failed
    #[error("Queue write failure: {0}")]
    QueueWriteFailure(String),

    /// Any other durable queue operation failed
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Record payload could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Collector unreachable (connection refused, DNS, reset)
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Collector did not answer within the request timeout
    #[error("Request timed out")]
    Timeout,

    /// Collector rejected the request (4xx)
    #[error("Server rejected request with status {status}: {body}")]
    ServerRejected { status: u16, body: String },

    /// Collector failed to process the request (5xx)
    #[error("Server error with status {status}")]
    ServerError { status: u16 },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Device byte source errors
    #[error("Device error: {0}")]
    Device(String),
}

impl UplinkError {
    /// Whether an upload error is worth retrying inside the same HTTP call.
    ///
    /// 5xx, timeouts and transport errors are; 4xx rejections and every
    /// non-upload error are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UplinkError::NetworkUnavailable(_) | UplinkError::Timeout | UplinkError::ServerError { .. }
        )
    }
}

/// Result type alias for Telemetry Uplink
pub type Result<T> = std::result::Result<T, UplinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(UplinkError::Timeout.is_retryable());
        assert!(UplinkError::ServerError { status: 503 }.is_retryable());
        assert!(UplinkError::NetworkUnavailable("refused".to_string()).is_retryable());

        assert!(!UplinkError::ServerRejected { status: 400, body: String::new() }.is_retryable());
        assert!(!UplinkError::MalformedFrame("bad header".to_string()).is_retryable());
        assert!(!UplinkError::QueueWriteFailure("disk full".to_string()).is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = UplinkError::UnexpectedPayloadSize { expected: 80, actual: 79 };
        assert_eq!(err.to_string(), "Unexpected payload size: expected 80 bytes, got 79");

        let err = UplinkError::ServerRejected { status: 422, body: "bad record".to_string() };
        assert!(err.to_string().contains("422"));
        assert!(err.to_string().contains("bad record"));
    }
}
