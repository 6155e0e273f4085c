//! Vidstream Storage - frame consumer
//!
//! Polls frame batches from Kafka, sends each batch to the inference
//! service, draws the returned detections onto every frame and stores the
//! annotated JPEGs in S3 under `<prefix>/<batch_id>_<frame_id>.jpg`.
//!
//! ## Architecture
//!
//! ```text
//! Kafka topic            Inference service          S3 bucket
//! ┌──────────────┐       ┌──────────────┐          ┌──────────────┐
//! │ video-ingest │──────▶│ POST /infer  │          │ annotated/   │
//! └──────────────┘       └──────────────┘          │   {batch}_   │
//!                               │                  │   {frame}.jpg│
//!                               ▼                  └──────────────┘
//!                        ┌──────────────┐                 ▲
//!                        │ Annotator    │─────────────────┘
//!                        └──────────────┘
//! ```
//!
//! The loop stops once the configured number of frames has been uploaded or
//! on SIGINT/SIGTERM.

pub mod annotate;
pub mod config;
pub mod inference_client;
pub mod processor;
pub mod s3_uploader;

pub use annotate::{label_origin, label_text, AnnotateError, Annotator};
pub use config::{AnnotationConfig, InferenceClientConfig, ProcessingConfig, S3Config, StorageConfig};
pub use inference_client::{HttpInferenceClient, InferenceApi, InferenceClientError};
pub use processor::{BatchProcessor, ProcessingSummary, ProcessorSettings, StopReason};
pub use s3_uploader::{object_key, FrameMetadata, ObjectStore, S3Uploader, UploadError};
