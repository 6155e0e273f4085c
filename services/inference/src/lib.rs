//! Vidstream Inference - batch detection service
//!
//! Accepts a frame batch on `POST /infer`, runs every frame through the
//! detection model and answers with the batch enriched by per-frame
//! detections in original-frame pixel coordinates.
//!
//! # Architecture
//!
//! ```text
//! Batch -> decode_frame -> to_input_tensor -> ModelPool -> postprocess -> InferenceResponse
//! ```

pub mod config;
pub mod model;
pub mod postprocess;
pub mod preprocess;
pub mod service;

pub use config::{InferenceConfig, ModelConfig, ServerConfig, ThresholdConfig};
pub use model::{ensure_model, Detector, InferenceError, ModelPool, RawOutput, TractDetector};
pub use postprocess::{
    candidates_from_output, iou, non_max_suppression, postprocess, rescale_to_frame, Candidate,
    PostprocessError,
};
pub use preprocess::{decode_frame, to_input_tensor, PreprocessError};
pub use service::{create_router, process_batch, start_server, AppState, ErrorResponse, ServiceError};
