//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{Result, UplinkError};

/// Baud rates the sensor firmware supports
const SUPPORTED_BAUD_RATES: [u32; 7] = [9600, 38400, 57600, 115200, 230400, 460800, 921600];

/// Accepted log levels
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub collector: CollectorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sensor device configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    #[serde(default = "default_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,

    /// Largest declared payload length the reassembler accepts before resyncing
    #[serde(default = "default_max_payload_len")]
    pub max_payload_len: usize,

    #[serde(default = "default_device_id")]
    pub device_id: String,

    #[serde(default)]
    pub session_id: Option<String>,
}

/// Aggregation buffer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BufferConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: f64,
}

/// Durable queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Failed attempts before a record is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_maintenance_interval_s")]
    pub maintenance_interval_s: u64,
}

/// Collector endpoint configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default = "default_batch_path")]
    pub batch_path: String,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_upload_timeout_ms")]
    pub upload_timeout_ms: u64,

    /// HTTP attempts per upload before the batch counts as failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_compress")]
    pub compress: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,
}

// Default value functions
fn default_port() -> String { "/dev/ttyACM0".to_string() }
fn default_baud_rate() -> u32 { 115200 }
fn default_read_chunk_size() -> usize { 256 }
fn default_max_payload_len() -> usize { 1024 }
fn default_device_id() -> String { "gps-unit-01".to_string() }

fn default_capacity() -> usize { 125 }
fn default_flush_threshold() -> f64 { 0.8 }

fn default_database_path() -> String { "./data/telemetry.db".to_string() }
fn default_max_retries() -> u32 { 5 }
fn default_retention_days() -> u32 { 7 }
fn default_maintenance_interval_s() -> u64 { 3600 }

fn default_base_url() -> String { "http://localhost:8080".to_string() }
fn default_health_path() -> String { "/api/v1/health".to_string() }
fn default_batch_path() -> String { "/api/telemetry/batch".to_string() }
fn default_probe_timeout_ms() -> u64 { 5000 }
fn default_upload_timeout_ms() -> u64 { 30000 }
fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff_ms() -> u64 { 500 }
fn default_compress() -> bool { true }

fn default_log_level() -> String { "info".to_string() }

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            read_chunk_size: default_read_chunk_size(),
            max_payload_len: default_max_payload_len(),
            device_id: default_device_id(),
            session_id: None,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            flush_threshold: default_flush_threshold(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            max_retries: default_max_retries(),
            retention_days: default_retention_days(),
            maintenance_interval_s: default_maintenance_interval_s(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            health_path: default_health_path(),
            batch_path: default_batch_path(),
            probe_timeout_ms: default_probe_timeout_ms(),
            upload_timeout_ms: default_upload_timeout_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            compress: default_compress(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: None,
        }
    }
}

fn invalid(message: impl std::fmt::Display) -> UplinkError {
    UplinkError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields take their defaults.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use telemetry_uplink::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        // Device
        if self.device.port.is_empty() {
            return Err(invalid("device port cannot be empty"));
        }

        if !SUPPORTED_BAUD_RATES.contains(&self.device.baud_rate) {
            return Err(invalid(
                "baud_rate must be one of: 9600, 38400, 57600, 115200, 230400, 460800, 921600",
            ));
        }

        if self.device.read_chunk_size == 0 || self.device.read_chunk_size > 65536 {
            return Err(invalid("read_chunk_size must be between 1 and 65536"));
        }

        // A telemetry payload must always fit
        if self.device.max_payload_len < 80 || self.device.max_payload_len > 65535 {
            return Err(invalid("max_payload_len must be between 80 and 65535"));
        }

        if self.device.device_id.trim().is_empty() {
            return Err(invalid("device_id cannot be empty"));
        }

        // Buffer
        if self.buffer.capacity == 0 {
            return Err(invalid("buffer capacity must be greater than 0"));
        }

        if !(self.buffer.flush_threshold > 0.0 && self.buffer.flush_threshold <= 1.0) {
            return Err(invalid("flush_threshold must be greater than 0.0 and at most 1.0"));
        }

        // Queue
        if self.queue.database_path.is_empty() {
            return Err(invalid("database_path cannot be empty"));
        }

        if self.queue.max_retries == 0 {
            return Err(invalid("max_retries must be greater than 0"));
        }

        if self.queue.retention_days == 0 {
            return Err(invalid("retention_days must be greater than 0"));
        }

        if self.queue.maintenance_interval_s == 0 {
            return Err(invalid("maintenance_interval_s must be greater than 0"));
        }

        // Collector
        match reqwest::Url::parse(&self.collector.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => {}
            _ => return Err(invalid("base_url must be an http(s) URL with a host")),
        }

        for (name, path) in [
            ("health_path", &self.collector.health_path),
            ("batch_path", &self.collector.batch_path),
        ] {
            if !path.starts_with('/') {
                return Err(invalid(format!("{} must start with '/'", name)));
            }
        }

        for (name, value) in [
            ("probe_timeout_ms", self.collector.probe_timeout_ms),
            ("upload_timeout_ms", self.collector.upload_timeout_ms),
        ] {
            if value == 0 || value > 120000 {
                return Err(invalid(format!("{} must be between 1 and 120000", name)));
            }
        }

        if self.collector.max_attempts == 0 || self.collector.max_attempts > 10 {
            return Err(invalid("max_attempts must be between 1 and 10"));
        }

        if self.collector.initial_backoff_ms > 60000 {
            return Err(invalid("initial_backoff_ms must be at most 60000"));
        }

        // Logging
        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(invalid("log level must be one of: trace, debug, info, warn, error"));
        }

        Ok(())
    }

    /// Full URL of the collector health endpoint
    pub fn health_url(&self) -> String {
        join_url(&self.collector.base_url, &self.collector.health_path)
    }

    /// Full URL of the collector batch endpoint
    pub fn batch_url(&self) -> String {
        join_url(&self.collector.base_url, &self.collector.batch_path)
    }

    /// "host:port" of the collector, used for link reachability checks
    ///
    /// # Errors
    ///
    /// Returns `Config` error if `base_url` is not a valid URL with a host
    pub fn collector_addr(&self) -> Result<String> {
        let url = reqwest::Url::parse(&self.collector.base_url).map_err(invalid)?;
        let host = url.host_str().ok_or_else(|| invalid("base_url has no host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("base_url has no port"))?;
        Ok(format!("{}:{}", host, port))
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_valid_config() -> Config {
        Config::default()
    }

    #[test]
    fn test_default_config() {
        let config = create_valid_config();

        assert!(config.validate().is_ok());
        assert_eq!(config.device.port, "/dev/ttyACM0");
        assert_eq!(config.device.baud_rate, 115200);
        assert_eq!(config.buffer.capacity, 125);
        assert_eq!(config.buffer.flush_threshold, 0.8);
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.collector.upload_timeout_ms, 30000);
        assert_eq!(config.collector.probe_timeout_ms, 5000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_config_from_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let config_content = r#"
[device]
port = "/dev/ttyUSB1"
baud_rate = 921600
device_id = "rover-7"
session_id = "field-test"

[buffer]
capacity = 250
flush_threshold = 0.5

[queue]
database_path = "/var/lib/uplink/queue.db"
max_retries = 8

[collector]
base_url = "https://collector.example.com/"
compress = false

[logging]
level = "debug"
log_dir = "/var/log/uplink"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(config_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.device.port, "/dev/ttyUSB1");
        assert_eq!(config.device.baud_rate, 921600);
        assert_eq!(config.device.session_id.as_deref(), Some("field-test"));
        assert_eq!(config.device.read_chunk_size, 256);
        assert_eq!(config.buffer.capacity, 250);
        assert_eq!(config.queue.max_retries, 8);
        assert_eq!(config.queue.retention_days, 7);
        assert!(!config.collector.compress);
        assert_eq!(config.logging.log_dir.as_deref(), Some("/var/log/uplink"));
        assert_eq!(config.batch_url(), "https://collector.example.com/api/telemetry/batch");
        assert_eq!(config.health_url(), "https://collector.example.com/api/v1/health");
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.database_path, "./data/telemetry.db");
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/uplink.toml");
        assert!(matches!(result, Err(UplinkError::Io(_))));
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"[buffer]\ncapacity = 0\n").unwrap();

        assert!(matches!(Config::load(temp_file.path()), Err(UplinkError::Config(_))));
    }

    #[test]
    fn test_empty_port() {
        let mut config = create_valid_config();
        config.device.port = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unsupported_baud_rate() {
        let mut config = create_valid_config();
        config.device.baud_rate = 420000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_valid_baud_rates() {
        for baud in SUPPORTED_BAUD_RATES {
            let mut config = create_valid_config();
            config.device.baud_rate = baud;
            assert!(config.validate().is_ok(), "baud rate {} should be valid", baud);
        }
    }

    #[test]
    fn test_read_chunk_size_zero() {
        let mut config = create_valid_config();
        config.device.read_chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_payload_len_below_telemetry_size() {
        let mut config = create_valid_config();
        config.device.max_payload_len = 79;
        assert!(config.validate().is_err());

        config.device.max_payload_len = 80;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_device_id() {
        let mut config = create_valid_config();
        config.device.device_id = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_capacity_zero() {
        let mut config = create_valid_config();
        config.buffer.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flush_threshold_bounds() {
        let mut config = create_valid_config();

        config.buffer.flush_threshold = 0.0;
        assert!(config.validate().is_err());

        config.buffer.flush_threshold = 1.2;
        assert!(config.validate().is_err());

        config.buffer.flush_threshold = f64::NAN;
        assert!(config.validate().is_err());

        config.buffer.flush_threshold = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_retries_zero() {
        let mut config = create_valid_config();
        config.queue.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retention_days_zero() {
        let mut config = create_valid_config();
        config.queue.retention_days = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_base_url() {
        for url in ["", "collector:8080", "ftp://collector.example.com"] {
            let mut config = create_valid_config();
            config.collector.base_url = url.to_string();
            assert!(config.validate().is_err(), "{:?} should be rejected", url);
        }
    }

    #[test]
    fn test_paths_must_be_absolute() {
        let mut config = create_valid_config();
        config.collector.batch_path = "api/telemetry/batch".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_bounds() {
        let mut config = create_valid_config();
        config.collector.upload_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = create_valid_config();
        config.collector.probe_timeout_ms = 120001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_attempts_bounds() {
        let mut config = create_valid_config();
        config.collector.max_attempts = 0;
        assert!(config.validate().is_err());

        config.collector.max_attempts = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = create_valid_config();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "WARN".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_collector_addr() {
        let mut config = create_valid_config();
        assert_eq!(config.collector_addr().unwrap(), "localhost:8080");

        config.collector.base_url = "https://collector.example.com".to_string();
        assert_eq!(config.collector_addr().unwrap(), "collector.example.com:443");
    }
}
