//! Configuration management for the ingest service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;
use vidstream_pipeline::{BackoffConfig, FailureHandling, KafkaConfig, TelemetryConfig};

/// Main configuration for the ingest service.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Video source configuration
    pub source: SourceConfig,

    /// Downscale and JPEG settings
    #[serde(default)]
    pub encoding: EncodingConfig,

    /// Batch accumulation and publish settings
    #[serde(default)]
    pub batching: BatchingConfig,

    /// Kafka connection and topics
    pub kafka: KafkaConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Video source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Stream URL (e.g. "rtsp://camera:554/stream" or "file:///videos/sample.mp4")
    pub url: String,

    /// RTSP transport protocol (tcp, udp, or udp-mcast)
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Jitter buffer latency for RTSP sources in milliseconds
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u32,

    /// How long a single frame read may block before counting as a failure
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Sleep between frame reads
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,

    /// Delay schedule between reconnect attempts
    #[serde(default = "default_reconnect")]
    pub reconnect: BackoffConfig,
}

/// Frame downscale and JPEG settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EncodingConfig {
    /// Frames wider than this are downscaled, preserving aspect ratio
    #[serde(default = "default_max_width")]
    pub max_width: u32,

    /// JPEG quality, clamped to 1..=95
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

/// Batch accumulation and publish settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchingConfig {
    /// Frames per published batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum wait for broker acknowledgment
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,

    /// What happens to a batch whose publish fails
    #[serde(default = "default_publish_failure")]
    pub publish_failure: FailureHandling,

    /// Publish the partial batch when draining
    #[serde(default = "default_flush_on_shutdown")]
    pub flush_on_shutdown: bool,
}

// Default value functions
fn default_transport() -> String {
    "tcp".to_string()
}
fn default_latency_ms() -> u32 {
    200
}
fn default_read_timeout_ms() -> u64 {
    5000
}
fn default_frame_interval_ms() -> u64 {
    33
}
fn default_reconnect() -> BackoffConfig {
    BackoffConfig::new(2000, 30000)
}
fn default_max_width() -> u32 {
    640
}
fn default_jpeg_quality() -> u8 {
    55
}
fn default_batch_size() -> usize {
    25
}
fn default_ack_timeout_secs() -> u64 {
    10
}
fn default_publish_failure() -> FailureHandling {
    FailureHandling {
        backoff: BackoffConfig::new(5000, 30000),
        ..Default::default()
    }
}
fn default_flush_on_shutdown() -> bool {
    true
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            max_width: default_max_width(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            ack_timeout_secs: default_ack_timeout_secs(),
            publish_failure: default_publish_failure(),
            flush_on_shutdown: default_flush_on_shutdown(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Built-in defaults for nested backoff schedules
    /// 2. Optional config file (config/ingest.{toml,yaml,json})
    /// 3. Environment variables (e.g. INGEST__SOURCE__URL, INGEST__KAFKA__BOOTSTRAP_SERVERS)
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Partial overrides of a nested schedule keep these instead of the generic defaults
            .set_default("source.reconnect.initial_delay_ms", 2000)?
            .set_default("source.reconnect.max_delay_ms", 30000)?
            .set_default("batching.publish_failure.backoff.initial_delay_ms", 5000)?
            .set_default("batching.publish_failure.backoff.max_delay_ms", 30000)?
            .add_source(File::with_name("config/ingest").required(false))
            .add_source(
                Environment::with_prefix("INGEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.source.url.trim().is_empty() {
            return Err(ConfigValidationError::MissingField("source.url".to_string()));
        }

        if !matches!(self.source.transport.as_str(), "tcp" | "udp" | "udp-mcast") {
            return Err(ConfigValidationError::InvalidValue {
                field: "source.transport".to_string(),
                message: "must be one of tcp, udp, udp-mcast".to_string(),
            });
        }

        if self.encoding.max_width == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "encoding.max_width".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.batching.batch_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "batching.batch_size".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        self.kafka
            .validate()
            .map_err(|e| ConfigValidationError::Kafka(e.to_string()))?;

        Ok(())
    }
}

impl SourceConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

impl BatchingConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Invalid kafka configuration: {0}")]
    Kafka(String),
}
