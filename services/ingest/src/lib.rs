//! Vidstream Ingest - frame producer
//!
//! Reads a live video stream, downscales and JPEG-encodes each frame, groups
//! frames into fixed-size batches and publishes them to Kafka.
//!
//! # Architecture
//!
//! ```text
//! FrameSource -> FrameEncoder -> BatchAccumulator -> BatchSink (Kafka)
//! ```

pub mod batcher;
pub mod capture;
pub mod config;
pub mod encoder;
pub mod streamer;

pub use batcher::BatchAccumulator;
pub use capture::{CaptureError, FrameSource};
pub use config::IngestConfig;
pub use encoder::{EncodeError, FrameEncoder};
pub use streamer::{StreamError, StreamState, StreamSummary, Streamer, StreamerSettings};

#[cfg(feature = "rtsp-gstreamer")]
pub use capture::GstFrameSource;
