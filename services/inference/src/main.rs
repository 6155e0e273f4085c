//! Inference service entry point.
//!
//! Configuration is loaded from an optional `config/inference` file and
//! `INFERENCE__`-prefixed environment variables. See `config.rs` for the options.

use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use vidstream_inference::{ensure_model, start_server, AppState, InferenceConfig, ModelPool};
use vidstream_pipeline::{init_metrics, init_tracing, spawn_signal_listener};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = InferenceConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.telemetry)?;

    info!(
        service = "vidstream-inference",
        version = env!("CARGO_PKG_VERSION"),
        model = %config.model.path.display(),
        "Starting inference service"
    );

    config.validate().context("Invalid configuration")?;
    init_metrics(&config.telemetry)?;

    ensure_model(&config.model)
        .await
        .context("Failed to obtain detection model")?;

    let model_config = config.model.clone();
    let pool = tokio::task::spawn_blocking(move || ModelPool::load(&model_config))
        .await
        .context("Model loading task failed")?
        .context("Failed to load detection model")?;

    let state = AppState {
        pool: Arc::new(pool),
        thresholds: config.thresholds.clone(),
        input_size: config.model.input_size,
        max_body_bytes: config.server.max_body_bytes,
    };

    let cancel = CancellationToken::new();
    let signals = spawn_signal_listener(cancel.clone());

    let result = start_server(state, &config.bind_address(), cancel.clone()).await;

    cancel.cancel();
    let _ = signals.await;

    result
}
