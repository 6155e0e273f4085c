//! Storage service entry point.
//!
//! Configuration is loaded from an optional `config/storage` file and
//! `STORAGE__`-prefixed environment variables. See `config.rs` for the options.

use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vidstream_pipeline::{
    init_metrics, init_tracing, spawn_signal_listener, BatchSink, FailurePolicy,
    KafkaBatchConsumer, KafkaBatchPublisher,
};
use vidstream_storage::{
    Annotator, BatchProcessor, HttpInferenceClient, InferenceApi, ObjectStore, ProcessorSettings,
    S3Uploader, StorageConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = StorageConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.telemetry)?;

    info!(
        service = "vidstream-storage",
        version = env!("CARGO_PKG_VERSION"),
        topic = %config.kafka.topics.frames,
        bucket = %config.s3.bucket,
        "Starting storage service"
    );

    config.validate().context("Invalid configuration")?;
    init_metrics(&config.telemetry)?;

    let client = HttpInferenceClient::new(&config.inference.url, config.inference_timeout())
        .context("Failed to create inference client")?;
    if let Err(e) = client.health().await {
        warn!(url = %config.inference.url, error = %e, "Inference service not healthy yet");
    }
    let inference: Arc<dyn InferenceApi> = Arc::new(client);

    let store: Arc<dyn ObjectStore> = Arc::new(S3Uploader::new(&config.s3).await);
    let annotator = Annotator::new(&config.annotation, config.processing.jpeg_quality)
        .context("Failed to initialize annotator")?;
    let source = KafkaBatchConsumer::new(config.kafka.clone())
        .context("Failed to create Kafka consumer")?;

    let mut processor = BatchProcessor::new(
        Box::new(source),
        inference,
        store,
        annotator,
        ProcessorSettings::from(&config),
    );

    if config.inference.failure.policy == FailurePolicy::DeadLetter {
        let dead_letter: Arc<dyn BatchSink> = Arc::new(
            KafkaBatchPublisher::new(config.kafka.clone(), config.kafka.request_timeout())
                .context("Failed to create dead-letter producer")?,
        );
        processor = processor.with_dead_letter(dead_letter);
    }

    let cancel = CancellationToken::new();
    let signals = spawn_signal_listener(cancel.clone());

    let reason = processor.run(&cancel).await;

    cancel.cancel();
    let _ = signals.await;

    let summary = processor.summary();
    info!(
        reason = ?reason,
        batches_received = summary.batches_received,
        batches_failed = summary.batches_failed,
        frames_uploaded = summary.frames_uploaded,
        frames_skipped = summary.frames_skipped,
        "Storage service stopped"
    );

    Ok(())
}
