//! Ingest service entry point.
//!
//! Configuration is loaded from an optional `config/ingest` file and
//! `INGEST__`-prefixed environment variables. See `config.rs` for the options.

use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use vidstream_ingest::{FrameEncoder, FrameSource, IngestConfig, Streamer, StreamerSettings};
use vidstream_pipeline::{
    init_metrics, init_tracing, spawn_signal_listener, BatchSink, KafkaBatchPublisher,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = IngestConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.telemetry)?;

    info!(
        service = "vidstream-ingest",
        version = env!("CARGO_PKG_VERSION"),
        url = %config.source.url,
        "Starting ingest service"
    );

    config.validate().context("Invalid configuration")?;
    init_metrics(&config.telemetry)?;

    let sink: Arc<dyn BatchSink> = Arc::new(
        KafkaBatchPublisher::new(config.kafka.clone(), config.batching.ack_timeout())
            .context("Failed to create Kafka producer")?,
    );
    let source = build_source(&config)?;
    let encoder = FrameEncoder::new(&config.encoding);

    let cancel = CancellationToken::new();
    let signals = spawn_signal_listener(cancel.clone());

    let mut streamer = Streamer::new(source, sink, encoder, StreamerSettings::from(&config));
    let result = streamer.run(&cancel).await;

    cancel.cancel();
    let _ = signals.await;

    match result {
        Ok(summary) => {
            info!(
                frames_captured = summary.frames_captured,
                batches_published = summary.batches_published,
                batches_failed = summary.batches_failed,
                reconnects = summary.reconnects,
                "Ingest service stopped"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Ingest service failed");
            Err(e.into())
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn build_source(config: &IngestConfig) -> anyhow::Result<Box<dyn FrameSource>> {
    let source = vidstream_ingest::GstFrameSource::new(config.source.clone())
        .context("Failed to initialize GStreamer")?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "rtsp-gstreamer"))]
fn build_source(_config: &IngestConfig) -> anyhow::Result<Box<dyn FrameSource>> {
    Err(vidstream_ingest::CaptureError::Unsupported(
        "rebuild with the rtsp-gstreamer feature".to_string(),
    )
    .into())
}
