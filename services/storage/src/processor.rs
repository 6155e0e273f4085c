//! The poll → infer → annotate → upload loop.
//!
//! One batch is handled at a time. Inference failures follow the configured
//! failure policy; a frame that cannot be annotated or uploaded is skipped on
//! its own. The loop ends when the processed-frame cap is reached or the
//! cancellation token fires.

use crate::annotate::Annotator;
use crate::config::StorageConfig;
use crate::inference_client::InferenceApi;
use crate::s3_uploader::{object_key, FrameMetadata, ObjectStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use vidstream_pipeline::{
    cancellable_sleep, retry_with_backoff, Batch, BatchSink, BatchSource, FailureHandling,
    FailurePolicy,
};

/// Why [`BatchProcessor::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    FrameCapReached,
    Cancelled,
}

/// Counters kept across the whole run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessingSummary {
    pub batches_received: u64,
    pub batches_failed: u64,
    pub frames_uploaded: u64,
    pub frames_skipped: u64,
}

/// Loop settings taken from [`StorageConfig`]
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Stop once this many frames have been uploaded
    pub frame_cap: Option<u64>,
    pub idle_poll_timeout: Duration,
    pub idle_sleep: Duration,
    pub inference_failure: FailureHandling,
    pub key_prefix: String,
}

impl From<&StorageConfig> for ProcessorSettings {
    fn from(config: &StorageConfig) -> Self {
        Self {
            frame_cap: config.frame_cap(),
            idle_poll_timeout: config.idle_poll_timeout(),
            idle_sleep: config.idle_sleep(),
            inference_failure: config.inference.failure.clone(),
            key_prefix: config.s3.prefix.clone(),
        }
    }
}

enum BatchOutcome {
    Handled,
    CapReached,
    Interrupted,
}

/// Frame consumer
pub struct BatchProcessor {
    source: Box<dyn BatchSource>,
    inference: Arc<dyn InferenceApi>,
    store: Arc<dyn ObjectStore>,
    annotator: Annotator,
    dead_letter: Option<Arc<dyn BatchSink>>,
    settings: ProcessorSettings,
    summary: ProcessingSummary,
}

impl BatchProcessor {
    pub fn new(
        source: Box<dyn BatchSource>,
        inference: Arc<dyn InferenceApi>,
        store: Arc<dyn ObjectStore>,
        annotator: Annotator,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            source,
            inference,
            store,
            annotator,
            dead_letter: None,
            settings,
            summary: ProcessingSummary::default(),
        }
    }

    /// Destination for batches whose inference keeps failing under `dead_letter`
    pub fn with_dead_letter(mut self, sink: Arc<dyn BatchSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    pub fn summary(&self) -> &ProcessingSummary {
        &self.summary
    }

    /// Run until the frame cap is reached or `cancel` fires
    pub async fn run(&mut self, cancel: &CancellationToken) -> StopReason {
        info!(
            frame_cap = ?self.settings.frame_cap,
            policy = ?self.settings.inference_failure.policy,
            "Frame consumer started"
        );

        let reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StopReason::Cancelled,
                polled = self.source.next_batch(self.settings.idle_poll_timeout) => polled,
            };

            let batch = match polled {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    if !cancellable_sleep(self.settings.idle_sleep, cancel).await {
                        break StopReason::Cancelled;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to receive batch");
                    metrics::counter!("storage.poll_errors").increment(1);
                    if !cancellable_sleep(self.settings.idle_sleep, cancel).await {
                        break StopReason::Cancelled;
                    }
                    continue;
                }
            };

            self.summary.batches_received += 1;
            metrics::counter!("storage.batches_received").increment(1);

            let outcome = self.handle_batch(&batch, cancel).await;
            if matches!(outcome, BatchOutcome::Interrupted) {
                // Left uncommitted so the batch is delivered again
                break StopReason::Cancelled;
            }

            if let Err(e) = self.source.commit() {
                warn!(batch_id = batch.batch_id, error = %e, "Failed to commit offsets");
            }

            if matches!(outcome, BatchOutcome::CapReached) {
                info!(
                    frames_uploaded = self.summary.frames_uploaded,
                    "Processed frame limit reached"
                );
                break StopReason::FrameCapReached;
            }
        };

        info!(
            reason = ?reason,
            batches_received = self.summary.batches_received,
            batches_failed = self.summary.batches_failed,
            frames_uploaded = self.summary.frames_uploaded,
            frames_skipped = self.summary.frames_skipped,
            "Frame consumer stopped"
        );
        reason
    }

    #[instrument(skip(self, batch, cancel), fields(batch_id = batch.batch_id, frames = batch.len()))]
    async fn handle_batch(&mut self, batch: &Batch, cancel: &CancellationToken) -> BatchOutcome {
        info!("Processing batch");

        let handling = self.settings.inference_failure.clone();
        let inference = &self.inference;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return BatchOutcome::Interrupted,
            result = retry_with_backoff(handling.attempts(), &handling.backoff, cancel, move |_| {
                inference.infer(batch)
            }) => result,
        };

        let response = match result {
            Ok(response) => response,
            Err(_) if cancel.is_cancelled() => return BatchOutcome::Interrupted,
            Err(e) => {
                self.summary.batches_failed += 1;
                metrics::counter!("storage.batches_failed").increment(1);
                self.handle_inference_failure(batch, &handling, &e.to_string())
                    .await;
                return BatchOutcome::Handled;
            }
        };

        if response.results.is_empty() {
            info!("Inference returned no results");
            return BatchOutcome::Handled;
        }

        for result in &response.results {
            let jpeg = match self.annotator.annotate(result) {
                Ok(jpeg) => jpeg,
                Err(e) => {
                    warn!(frame_id = result.frame_id, error = %e, "Skipping frame");
                    self.skip_frame();
                    continue;
                }
            };

            let key = object_key(&self.settings.key_prefix, batch.batch_id, result.frame_id);
            let metadata = FrameMetadata {
                batch_id: batch.batch_id,
                frame_id: result.frame_id,
                detection_count: result.detections.len(),
            };

            if let Err(e) = self.store.put_frame(&key, jpeg, &metadata).await {
                warn!(frame_id = result.frame_id, error = %e, "Failed to upload annotated frame");
                self.skip_frame();
                continue;
            }

            self.summary.frames_uploaded += 1;
            metrics::counter!("storage.frames_uploaded").increment(1);
            debug!(
                frame_id = result.frame_id,
                key = %key,
                detections = result.detections.len(),
                "Annotated frame uploaded"
            );

            if self.cap_reached() {
                return BatchOutcome::CapReached;
            }
        }

        BatchOutcome::Handled
    }

    async fn handle_inference_failure(&self, batch: &Batch, handling: &FailureHandling, reason: &str) {
        match (handling.policy, &self.dead_letter) {
            (FailurePolicy::DeadLetter, Some(sink)) => {
                warn!(error = %reason, "Inference failed, sending batch to dead-letter topic");
                if let Err(e) = sink.dead_letter(batch, reason).await {
                    error!(error = %e, "Failed to dead-letter batch, dropping it");
                }
            }
            (FailurePolicy::DeadLetter, None) => {
                error!(error = %reason, "Inference failed and no dead-letter sink is configured, dropping batch");
            }
            (FailurePolicy::Retry, _) => {
                error!(
                    error = %reason,
                    attempts = handling.attempts(),
                    "Inference failed after retries, dropping batch"
                );
            }
            (FailurePolicy::Drop, _) => {
                error!(error = %reason, "Inference failed, dropping batch");
            }
        }
    }

    fn skip_frame(&mut self) {
        self.summary.frames_skipped += 1;
        metrics::counter!("storage.frames_skipped").increment(1);
    }

    fn cap_reached(&self) -> bool {
        self.settings
            .frame_cap
            .is_some_and(|cap| self.summary.frames_uploaded >= cap)
    }
}
