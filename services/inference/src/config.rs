use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use vidstream_pipeline::TelemetryConfig;

/// Main configuration for the inference service
#[derive(Debug, Clone, Deserialize, Default)]
pub struct InferenceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest accepted `/infer` body; must cover the bus's `message_max_bytes`
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Detection model configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Local ONNX file; downloaded from `url` when missing
    #[serde(default = "default_model_path")]
    pub path: PathBuf,
    #[serde(default = "default_model_url")]
    pub url: String,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    /// Square model input resolution
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    /// Number of independent model handles serving requests
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

/// Post-processing thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdConfig {
    /// Minimum `objectness * class_score` to keep a prediction
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    /// Overlap above which the weaker of two boxes is suppressed
    #[serde(default = "default_iou")]
    pub iou: f32,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_model_path() -> PathBuf {
    PathBuf::from("/models/yolov5s.onnx")
}

fn default_model_url() -> String {
    "https://github.com/ultralytics/yolov5/releases/download/v6.0/yolov5s.onnx".to_string()
}

fn default_download_timeout_secs() -> u64 {
    60
}

fn default_input_size() -> u32 {
    640
}

fn default_pool_size() -> usize {
    1
}

fn default_confidence() -> f32 {
    0.4
}

fn default_iou() -> f32 {
    0.45
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: default_model_path(),
            url: default_model_url(),
            download_timeout_secs: default_download_timeout_secs(),
            input_size: default_input_size(),
            pool_size: default_pool_size(),
        }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            confidence: default_confidence(),
            iou: default_iou(),
        }
    }
}

impl ModelConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

impl InferenceConfig {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/inference").required(false))
            // INFERENCE__THRESHOLDS__CONFIDENCE -> thresholds.confidence
            .add_source(
                config::Environment::with_prefix("INFERENCE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Reject values the service cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.max_body_bytes == 0 {
            anyhow::bail!("server.max_body_bytes must be greater than 0");
        }
        if self.model.input_size == 0 {
            anyhow::bail!("model.input_size must be greater than 0");
        }
        if self.model.pool_size == 0 {
            anyhow::bail!("model.pool_size must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.thresholds.confidence) {
            anyhow::bail!("thresholds.confidence must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.thresholds.iou) {
            anyhow::bail!("thresholds.iou must be within [0, 1]");
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = InferenceConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8000");
        assert_eq!(config.model.input_size, 640);
        assert_eq!(config.model.pool_size, 1);
        assert_eq!(config.thresholds.confidence, 0.4);
        assert_eq!(config.thresholds.iou, 0.45);
        assert_eq!(config.model.download_timeout(), Duration::from_secs(60));
        assert_eq!(config.server.max_body_bytes, 16 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_threshold() {
        let mut config = InferenceConfig::default();
        config.thresholds.iou = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_override() {
        let config: InferenceConfig =
            serde_json::from_str(r#"{"thresholds": {"confidence": 0.25}}"#).unwrap();
        assert_eq!(config.thresholds.confidence, 0.25);
        assert_eq!(config.thresholds.iou, 0.45);
        assert_eq!(config.model.path, PathBuf::from("/models/yolov5s.onnx"));
    }
}
