//! Logging and metrics bootstrap shared by the service binaries.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging and metrics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `json` or `pretty`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port; disabled when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

impl TelemetryConfig {
    /// Filter used when `RUST_LOG` is not set
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::try_new(format!(
                "{},rdkafka=warn,aws_config=warn,aws_smithy_runtime=warn,hyper=warn",
                self.log_level
            ))
            .unwrap_or_else(|_| EnvFilter::new("info"))
        })
    }
}

/// Install the global tracing subscriber
pub fn init_tracing(config: &TelemetryConfig) -> Result<()> {
    let subscriber = tracing_subscriber::registry().with(config.filter());

    if config.log_format.eq_ignore_ascii_case("pretty") {
        subscriber
            .with(fmt::layer().pretty())
            .try_init()
            .context("Failed to install tracing subscriber")?;
    } else {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }

    Ok(())
}

/// Install the Prometheus exporter when a port is configured
pub fn init_metrics(config: &TelemetryConfig) -> Result<()> {
    let Some(port) = config.metrics_port else {
        return Ok(());
    };

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}
