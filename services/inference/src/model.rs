//! Detection model loading and execution.
//!
//! The model is built once at startup into a [`ModelPool`] and shared by
//! reference with the request handlers. Each handle sits behind its own mutex,
//! so concurrent requests either find a free handle or wait for one.

use crate::config::ModelConfig;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, info, instrument};
use tract_onnx::prelude::*;

/// Errors that can occur while obtaining or running the model
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Failed to download model from {url}: {message}")]
    Download { url: String, message: String },

    #[error("Model file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to load model: {0}")]
    Load(String),

    #[error("Model execution failed: {0}")]
    Execution(String),

    #[error("Unexpected model output shape {0:?}")]
    OutputShape(Vec<usize>),

    #[error("Model pool is empty")]
    EmptyPool,
}

/// Row-major prediction matrix: one row per anchor,
/// `[cx, cy, w, h, objectness, class_0, ..., class_k]`
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
    pub rows: usize,
    pub row_len: usize,
    pub data: Vec<f32>,
}

impl RawOutput {
    /// Accepts `[N, C]` or `[1, N, C]`.
    pub fn from_shape(shape: &[usize], data: Vec<f32>) -> Result<Self, InferenceError> {
        let (rows, row_len) = match shape {
            [rows, row_len] => (*rows, *row_len),
            [1, rows, row_len] => (*rows, *row_len),
            _ => return Err(InferenceError::OutputShape(shape.to_vec())),
        };
        if rows.checked_mul(row_len) != Some(data.len()) {
            return Err(InferenceError::OutputShape(shape.to_vec()));
        }
        Ok(Self {
            rows,
            row_len,
            data,
        })
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.row_len.max(1)).take(self.rows)
    }
}

/// One executable detection model handle
#[cfg_attr(test, mockall::automock)]
pub trait Detector: Send {
    /// Run one forward pass over a `1x3xSxS` input
    fn detect(&mut self, input: &[f32]) -> Result<RawOutput, InferenceError>;
}

/// ONNX model executed with tract
pub struct TractDetector {
    model: TypedRunnableModel<TypedModel>,
    input_size: usize,
}

impl TractDetector {
    pub fn load(path: &Path, input_size: u32) -> Result<Self, InferenceError> {
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(|e| InferenceError::Load(format!("{}: {}", path.display(), e)))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .map_err(|e| InferenceError::Load(e.to_string()))?
            .into_optimized()
            .map_err(|e| InferenceError::Load(e.to_string()))?
            .into_runnable()
            .map_err(|e| InferenceError::Load(e.to_string()))?;

        Ok(Self {
            model,
            input_size: size,
        })
    }
}

impl Detector for TractDetector {
    fn detect(&mut self, input: &[f32]) -> Result<RawOutput, InferenceError> {
        let size = self.input_size;
        let tensor = tract_ndarray::Array4::from_shape_vec((1, 3, size, size), input.to_vec())
            .map_err(|e| InferenceError::Execution(e.to_string()))?
            .into_tensor();

        let outputs = self
            .model
            .run(tvec!(tensor.into()))
            .map_err(|e| InferenceError::Execution(e.to_string()))?;

        let output = outputs
            .first()
            .ok_or_else(|| InferenceError::Execution("model produced no outputs".to_string()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| InferenceError::Execution(e.to_string()))?;

        RawOutput::from_shape(view.shape(), view.iter().copied().collect())
    }
}

/// Fixed set of model handles shared by all requests
pub struct ModelPool {
    detectors: Vec<Mutex<Box<dyn Detector>>>,
    next: AtomicUsize,
}

impl ModelPool {
    pub fn new(detectors: Vec<Box<dyn Detector>>) -> Result<Self, InferenceError> {
        if detectors.is_empty() {
            return Err(InferenceError::EmptyPool);
        }
        Ok(Self {
            detectors: detectors.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
        })
    }

    /// Load `pool_size` tract handles from the configured model file
    pub fn load(config: &ModelConfig) -> Result<Self, InferenceError> {
        let detectors = (0..config.pool_size.max(1))
            .map(|_| {
                TractDetector::load(&config.path, config.input_size)
                    .map(|d| Box::new(d) as Box<dyn Detector>)
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            path = %config.path.display(),
            handles = detectors.len(),
            input_size = config.input_size,
            "Detection model loaded"
        );

        Self::new(detectors)
    }

    /// Run on the first free handle, or wait for the next one in rotation
    pub fn run(&self, input: &[f32]) -> Result<RawOutput, InferenceError> {
        let start = self.next.fetch_add(1, Ordering::Relaxed) % self.detectors.len();

        for offset in 0..self.detectors.len() {
            let idx = (start + offset) % self.detectors.len();
            if let Some(mut detector) = self.detectors[idx].try_lock() {
                return detector.detect(input);
            }
        }

        debug!(handle = start, "All model handles busy, waiting");
        self.detectors[start].lock().detect(input)
    }
}

/// Download the model to `config.path` unless it is already there
#[instrument(skip(config), fields(path = %config.path.display()))]
pub async fn ensure_model(config: &ModelConfig) -> Result<PathBuf, InferenceError> {
    if tokio::fs::try_exists(&config.path).await? {
        return Ok(config.path.clone());
    }

    if let Some(parent) = config.path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    info!(url = %config.url, "Downloading detection model");

    let download_error = |message: String| InferenceError::Download {
        url: config.url.clone(),
        message,
    };

    let client = reqwest::Client::builder()
        .timeout(config.download_timeout())
        .build()
        .map_err(|e| download_error(e.to_string()))?;

    let bytes = client
        .get(&config.url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|e| download_error(e.to_string()))?
        .bytes()
        .await
        .map_err(|e| download_error(e.to_string()))?;

    let partial = config.path.with_extension("onnx.part");
    tokio::fs::write(&partial, &bytes).await?;
    tokio::fs::rename(&partial, &config.path).await?;

    info!(size = bytes.len(), "Detection model downloaded");

    Ok(config.path.clone())
}
