//! The capture → encode → batch → publish loop.
//!
//! Lifecycle: `Opening → Streaming ⇄ Reconnecting → Draining → Terminated`.
//! Failing to open the source is fatal; every later read failure goes through
//! a capped exponential reconnect. Cancellation is honoured between reads and
//! during every sleep, and always ends in a drain.

use backoff::backoff::Backoff;
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use vidstream_pipeline::{
    cancellable_sleep, retry_with_backoff, BackoffConfig, Batch, BatchSink, FailureHandling,
    FailurePolicy,
};

use crate::batcher::BatchAccumulator;
use crate::capture::{CaptureError, FrameSource};
use crate::config::IngestConfig;
use crate::encoder::FrameEncoder;

/// Errors that stop the streamer.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Failed to open video source: {0}")]
    Open(#[source] CaptureError),
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opening,
    Streaming,
    Reconnecting,
    Draining,
    Terminated,
}

/// Counters reported when the streamer terminates.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    pub frames_captured: u64,
    pub batches_published: u64,
    pub batches_failed: u64,
    pub reconnects: u64,
}

/// Loop settings taken from [`IngestConfig`].
#[derive(Debug, Clone)]
pub struct StreamerSettings {
    pub batch_size: usize,
    pub frame_interval: Duration,
    pub reconnect: BackoffConfig,
    pub publish_failure: FailureHandling,
    pub flush_on_shutdown: bool,
    pub flush_timeout: Duration,
}

impl From<&IngestConfig> for StreamerSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            batch_size: config.batching.batch_size,
            frame_interval: config.source.frame_interval(),
            reconnect: config.source.reconnect.clone(),
            publish_failure: config.batching.publish_failure.clone(),
            flush_on_shutdown: config.batching.flush_on_shutdown,
            flush_timeout: config.batching.ack_timeout(),
        }
    }
}

/// Run a blocking capture call without stalling other tasks on a multi-threaded runtime.
fn run_blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Frame producer state machine.
pub struct Streamer {
    source: Box<dyn FrameSource>,
    sink: Arc<dyn BatchSink>,
    encoder: FrameEncoder,
    accumulator: BatchAccumulator,
    settings: StreamerSettings,
    state: StreamState,
    next_frame_id: u64,
    summary: StreamSummary,
}

impl Streamer {
    pub fn new(
        source: Box<dyn FrameSource>,
        sink: Arc<dyn BatchSink>,
        encoder: FrameEncoder,
        settings: StreamerSettings,
    ) -> Self {
        Self {
            source,
            sink,
            encoder,
            accumulator: BatchAccumulator::new(settings.batch_size),
            settings,
            state: StreamState::Opening,
            next_frame_id: 0,
            summary: StreamSummary::default(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    fn set_state(&mut self, state: StreamState) {
        let previous = std::mem::replace(&mut self.state, state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Stream state changed");
        }
    }

    /// Run until cancelled. Only a failure to open the source is returned as an error.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<StreamSummary, StreamError> {
        self.set_state(StreamState::Opening);
        let source = &mut self.source;
        if let Err(e) = run_blocking(|| source.open()) {
            self.set_state(StreamState::Terminated);
            return Err(StreamError::Open(e));
        }

        self.set_state(StreamState::Streaming);
        info!(batch_size = self.settings.batch_size, "Streaming started");

        let mut reconnect = self.settings.reconnect.build();

        while !cancel.is_cancelled() {
            let source = &mut self.source;
            match run_blocking(|| source.read_frame()) {
                Ok(image) => {
                    reconnect.reset();
                    self.handle_frame(image, cancel).await;
                    if !cancellable_sleep(self.settings.frame_interval, cancel).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Frame read failed, reconnecting");
                    metrics::counter!("ingest.read_failures").increment(1);
                    if !self.reconnect(&mut reconnect, cancel).await {
                        break;
                    }
                }
            }
        }

        self.drain().await;
        Ok(self.summary.clone())
    }

    async fn handle_frame(&mut self, image: RgbImage, cancel: &CancellationToken) {
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        self.summary.frames_captured += 1;
        metrics::counter!("ingest.frames_captured").increment(1);

        let frame = match self.encoder.encode(frame_id, image) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(frame_id, error = %e, "Failed to encode frame, skipping");
                metrics::counter!("ingest.frames_dropped").increment(1);
                return;
            }
        };

        if let Some(batch) = self.accumulator.push(frame) {
            self.publish(batch, cancel).await;
        }
    }

    /// Release, wait, reopen; repeated until the source opens or we are cancelled.
    async fn reconnect(
        &mut self,
        backoff: &mut backoff::ExponentialBackoff,
        cancel: &CancellationToken,
    ) -> bool {
        self.set_state(StreamState::Reconnecting);
        self.source.release();

        loop {
            let delay = backoff
                .next_backoff()
                .unwrap_or_else(|| Duration::from_millis(self.settings.reconnect.max_delay_ms));
            self.summary.reconnects += 1;
            metrics::counter!("ingest.reconnects").increment(1);
            info!(
                attempt = self.summary.reconnects,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to video source"
            );

            if !cancellable_sleep(delay, cancel).await {
                return false;
            }

            let source = &mut self.source;
            match run_blocking(|| source.open()) {
                Ok(()) => {
                    self.set_state(StreamState::Streaming);
                    return true;
                }
                Err(e) => warn!(error = %e, "Reconnect failed"),
            }
        }
    }

    /// Publish a full batch according to the configured failure policy.
    ///
    /// The batch is gone afterwards whatever the outcome.
    #[instrument(skip(self, batch, cancel), fields(batch_id = batch.batch_id, frames = batch.len()))]
    async fn publish(&mut self, batch: Batch, cancel: &CancellationToken) {
        let handling = self.settings.publish_failure.clone();
        let sink = &self.sink;
        let outgoing = &batch;

        let result = retry_with_backoff(handling.attempts(), &handling.backoff, cancel, move |_| {
            sink.publish(outgoing)
        })
        .await;

        let error = match result {
            Ok(delivery) => {
                self.summary.batches_published += 1;
                metrics::counter!("ingest.batches_published").increment(1);
                debug!(
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Batch published"
                );
                return;
            }
            Err(e) => e,
        };

        self.summary.batches_failed += 1;
        metrics::counter!("ingest.batches_failed").increment(1);

        match handling.policy {
            FailurePolicy::Drop => {
                error!(error = %error, "Failed to publish batch, dropping it");
                let pause = Duration::from_millis(handling.backoff.initial_delay_ms);
                cancellable_sleep(pause, cancel).await;
            }
            FailurePolicy::Retry => {
                error!(
                    error = %error,
                    attempts = handling.attempts(),
                    "Failed to publish batch after retries, dropping it"
                );
            }
            FailurePolicy::DeadLetter => {
                warn!(error = %error, "Failed to publish batch, sending to dead-letter topic");
                if let Err(e) = self.sink.dead_letter(&batch, &error.to_string()).await {
                    error!(error = %e, "Failed to dead-letter batch, dropping it");
                }
            }
        }
    }

    async fn drain(&mut self) {
        self.set_state(StreamState::Draining);

        if self.settings.flush_on_shutdown {
            if let Some(batch) = self.accumulator.drain() {
                info!(
                    batch_id = batch.batch_id,
                    frames = batch.len(),
                    "Publishing partial batch on shutdown"
                );
                match self.sink.publish(&batch).await {
                    Ok(_) => {
                        self.summary.batches_published += 1;
                        metrics::counter!("ingest.batches_published").increment(1);
                    }
                    Err(e) => {
                        self.summary.batches_failed += 1;
                        error!(batch_id = batch.batch_id, error = %e, "Failed to publish partial batch");
                    }
                }
            }
        }

        if let Err(e) = self.sink.flush(self.settings.flush_timeout) {
            warn!(error = %e, "Failed to flush producer");
        }

        self.source.release();
        self.set_state(StreamState::Terminated);

        info!(
            frames_captured = self.summary.frames_captured,
            batches_published = self.summary.batches_published,
            batches_failed = self.summary.batches_failed,
            reconnects = self.summary.reconnects,
            "Streamer terminated"
        );
    }
}
