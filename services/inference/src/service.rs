use crate::config::ThresholdConfig;
use crate::model::{InferenceError, ModelPool};
use crate::postprocess::{postprocess, PostprocessError};
use crate::preprocess::{decode_frame, to_input_tensor};
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use metrics::{counter, histogram};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};
use vidstream_pipeline::{Batch, FrameResult, InferenceResponse};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<ModelPool>,
    pub thresholds: ThresholdConfig,
    pub input_size: u32,
    /// Largest accepted `/infer` request body
    pub max_body_bytes: usize,
}

/// Failures that abort a whole request
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Model(#[from] InferenceError),

    #[error(transparent)]
    Postprocess(#[from] PostprocessError),
}

impl ServiceError {
    fn code(&self) -> &'static str {
        match self {
            ServiceError::Model(_) => "MODEL_ERROR",
            ServiceError::Postprocess(_) => "MALFORMED_OUTPUT",
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn internal_error(error: String, code: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error,
            code: code.to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/infer", post(infer))
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[instrument(skip_all, fields(batch_id = batch.batch_id, frames = batch.len()))]
async fn infer(
    State(state): State<AppState>,
    Json(batch): Json<Batch>,
) -> Result<Json<InferenceResponse>, ApiError> {
    let started = Instant::now();
    let frames = batch.len() as u64;

    let outcome = tokio::task::spawn_blocking(move || process_batch(&state, &batch))
        .await
        .map_err(|e| {
            error!(error = %e, "Inference task panicked");
            internal_error("Inference task failed".to_string(), "INTERNAL")
        })?;

    match outcome {
        Ok(response) => {
            counter!("inference.batches").increment(1);
            counter!("inference.frames").increment(frames);
            histogram!("inference.batch_seconds").record(started.elapsed().as_secs_f64());
            Ok(Json(response))
        }
        Err(e) => {
            error!(error = %e, "Batch inference failed");
            counter!("inference.batches_failed").increment(1);
            Err(internal_error(e.to_string(), e.code()))
        }
    }
}

/// Run every frame of a batch through decode, the model and post-processing.
///
/// A frame that cannot be decoded is echoed with no detections. A model or
/// output-shape failure fails the whole batch.
pub fn process_batch(state: &AppState, batch: &Batch) -> Result<InferenceResponse, ServiceError> {
    let mut results = Vec::with_capacity(batch.len());

    for frame in &batch.frames {
        let image = match decode_frame(frame) {
            Ok(image) => image,
            Err(e) => {
                warn!(
                    batch_id = batch.batch_id,
                    frame_id = frame.frame_id,
                    error = %e,
                    "Undecodable frame, passing through"
                );
                counter!("inference.frames_skipped").increment(1);
                results.push(FrameResult::passthrough(frame));
                continue;
            }
        };

        let input = to_input_tensor(&image, state.input_size);
        let output = state.pool.run(&input)?;

        let (width, height) = if frame.width == 0 || frame.height == 0 {
            (image.width(), image.height())
        } else {
            (frame.width, frame.height)
        };
        let detections = postprocess(&output, &state.thresholds, state.input_size, width, height)?;

        debug!(
            batch_id = batch.batch_id,
            frame_id = frame.frame_id,
            detections = detections.len(),
            "Frame processed"
        );
        counter!("inference.detections").increment(detections.len() as u64);

        results.push(FrameResult::with_detections(frame, detections));
    }

    Ok(InferenceResponse {
        batch_id: batch.batch_id,
        results,
    })
}

/// Serve until `cancel` fires
pub async fn start_server(state: AppState, address: &str, cancel: CancellationToken) -> Result<()> {
    let router = create_router(state);

    info!(address = %address, "Starting inference API server");

    let listener = tokio::net::TcpListener::bind(address)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("API server error")?;

    info!("Inference API server stopped");
    Ok(())
}
