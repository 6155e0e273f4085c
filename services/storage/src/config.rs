use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use vidstream_pipeline::{FailureHandling, KafkaConfig, TelemetryConfig};

/// Main configuration for the storage service
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Kafka connection, consumer group and topics
    pub kafka: KafkaConfig,
    /// Inference service endpoint
    pub inference: InferenceClientConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Loop pacing and the processed-frame cap
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Box and label drawing
    #[serde(default)]
    pub annotation: AnnotationConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Inference service client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceClientConfig {
    /// Base URL, e.g. `http://inference:8000`
    pub url: String,
    /// Whole-request timeout for `/infer`
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// What happens to a batch whose inference call fails
    #[serde(default)]
    pub failure: FailureHandling,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for annotated frames
    pub bucket: String,
    /// Key prefix; objects land at `<prefix>/<batch_id>_<frame_id>.jpg`
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Processing loop configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Stop after this many uploaded frames; unset or 0 runs until signalled
    #[serde(default)]
    pub max_processed_frames: Option<u64>,
    /// How long one poll waits for a batch
    #[serde(default = "default_idle_poll_timeout_ms")]
    pub idle_poll_timeout_ms: u64,
    /// Pause after a poll that returned nothing
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    /// Quality of the re-encoded annotated JPEG
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

/// Annotation drawing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AnnotationConfig {
    /// TrueType/OpenType font for labels; the built-in bitmap glyphs are used when unset
    #[serde(default)]
    pub font_path: Option<PathBuf>,
    /// Rectangle outline thickness in pixels
    #[serde(default = "default_line_thickness")]
    pub line_thickness: u32,
    /// Label size relative to a 24 px line
    #[serde(default = "default_font_scale")]
    pub font_scale: f32,
}

// Default value functions
fn default_timeout_secs() -> u64 {
    60
}

fn default_prefix() -> String {
    "annotated".to_string()
}

fn default_region() -> String {
    "ap-south-1".to_string()
}

fn default_idle_poll_timeout_ms() -> u64 {
    1000
}

fn default_idle_sleep_ms() -> u64 {
    1000
}

fn default_jpeg_quality() -> u8 {
    95
}

fn default_line_thickness() -> u32 {
    2
}

fn default_font_scale() -> f32 {
    0.5
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_processed_frames: None,
            idle_poll_timeout_ms: default_idle_poll_timeout_ms(),
            idle_sleep_ms: default_idle_sleep_ms(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            font_path: None,
            line_thickness: default_line_thickness(),
            font_scale: default_font_scale(),
        }
    }
}

impl StorageConfig {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("s3.prefix", "annotated")?
            .set_default("s3.region", "ap-south-1")?
            // Add config file if present
            .add_source(config::File::with_name("config/storage").required(false))
            // Override with environment variables
            // STORAGE__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("STORAGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Reject configurations the consumer cannot start with
    pub fn validate(&self) -> anyhow::Result<()> {
        self.kafka
            .validate()
            .map_err(|e| anyhow::anyhow!("kafka: {}", e))?;

        let url = self.inference.url.trim();
        if url.is_empty() {
            anyhow::bail!("inference.url is required");
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            anyhow::bail!("inference.url must be an http(s) URL, got {}", url);
        }
        if self.s3.bucket.trim().is_empty() {
            anyhow::bail!("s3.bucket is required");
        }
        if !(1..=100).contains(&self.processing.jpeg_quality) {
            anyhow::bail!("processing.jpeg_quality must be within 1..=100");
        }
        if self.annotation.font_scale <= 0.0 {
            anyhow::bail!("annotation.font_scale must be positive");
        }
        Ok(())
    }

    /// Effective processed-frame cap
    pub fn frame_cap(&self) -> Option<u64> {
        self.processing.max_processed_frames.filter(|cap| *cap > 0)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference.timeout_secs)
    }

    pub fn idle_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.processing.idle_poll_timeout_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.processing.idle_sleep_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> StorageConfig {
        serde_json::from_str(
            r#"{
                "kafka": {"bootstrap_servers": "kafka:9092"},
                "inference": {"url": "http://inference:8000"},
                "s3": {"bucket": "frames"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = minimal();
        assert_eq!(config.s3.prefix, "annotated");
        assert_eq!(config.s3.region, "ap-south-1");
        assert_eq!(config.inference_timeout(), Duration::from_secs(60));
        assert_eq!(config.idle_poll_timeout(), Duration::from_secs(1));
        assert_eq!(config.processing.jpeg_quality, 95);
        assert_eq!(config.annotation.line_thickness, 2);
        assert_eq!(config.kafka.consumer.group_id, "inference-consumer");
        assert_eq!(config.frame_cap(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_cap_is_unbounded() {
        let mut config = minimal();
        config.processing.max_processed_frames = Some(0);
        assert_eq!(config.frame_cap(), None);

        config.processing.max_processed_frames = Some(100);
        assert_eq!(config.frame_cap(), Some(100));
    }

    #[test]
    fn test_missing_targets_are_fatal() {
        let mut config = minimal();
        config.inference.url = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.inference.url = "inference:8000".to_string();
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.s3.bucket.clear();
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.kafka.bootstrap_servers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bucket_is_required_field() {
        let result: Result<StorageConfig, _> = serde_json::from_str(
            r#"{"kafka": {"bootstrap_servers": "k:9092"}, "inference": {"url": "http://i"}, "s3": {}}"#,
        );
        assert!(result.is_err());
    }
}
