//! Wire model shared by the producer, the inference service and the consumer.
//!
//! Every type here serialises to the JSON layout carried on the `video-ingest`
//! topic and on the `/infer` endpoint. Frame payloads stay base64 strings on
//! the wire so a single corrupt frame never poisons the whole batch.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while decoding a frame payload
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("frame payload is empty")]
    Empty,

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// One encoded video frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Monotonic within a producer session, restarts at 0
    pub frame_id: u64,
    /// Seconds since the Unix epoch, captured at encode time
    pub timestamp: f64,
    /// Width after any downscale
    pub width: u32,
    /// Height after any downscale
    pub height: u32,
    /// Base64 (standard alphabet) JPEG bytes
    #[serde(default)]
    pub frame_data: String,
}

impl Frame {
    /// Build a frame from raw JPEG bytes
    pub fn from_jpeg(frame_id: u64, timestamp: f64, width: u32, height: u32, jpeg: &[u8]) -> Self {
        Self {
            frame_id,
            timestamp,
            width,
            height,
            frame_data: STANDARD.encode(jpeg),
        }
    }

    /// Decode the base64 payload back into JPEG bytes
    pub fn decode_payload(&self) -> Result<Vec<u8>, PayloadError> {
        decode_frame_data(&self.frame_data)
    }
}

/// A group of frames published as one bus message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Publish time in milliseconds; not unique across producers
    pub batch_id: i64,
    pub frames: Vec<Frame>,
}

impl Batch {
    /// Stamp a new batch with the current time in milliseconds
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            batch_id: Utc::now().timestamp_millis(),
            frames,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// One detected object in original-frame pixel coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// `[x1, y1, x2, y2]`
    pub bbox: [i32; 4],
    pub confidence: f32,
    pub class_id: u32,
}

/// A frame echoed back by the inference service with its detections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameResult {
    pub frame_id: u64,
    pub timestamp: f64,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub frame_data: String,
}

impl FrameResult {
    /// Echo a frame with an empty detection list
    pub fn passthrough(frame: &Frame) -> Self {
        Self::with_detections(frame, Vec::new())
    }

    pub fn with_detections(frame: &Frame, detections: Vec<Detection>) -> Self {
        Self {
            frame_id: frame.frame_id,
            timestamp: frame.timestamp,
            width: frame.width,
            height: frame.height,
            detections,
            frame_data: frame.frame_data.clone(),
        }
    }

    pub fn decode_payload(&self) -> Result<Vec<u8>, PayloadError> {
        decode_frame_data(&self.frame_data)
    }
}

/// Response body of `POST /infer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub batch_id: i64,
    #[serde(default)]
    pub results: Vec<FrameResult>,
}

/// Seconds since the Unix epoch with microsecond precision
pub fn unix_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn decode_frame_data(data: &str) -> Result<Vec<u8>, PayloadError> {
    if data.is_empty() {
        return Err(PayloadError::Empty);
    }
    let bytes = STANDARD.decode(data)?;
    if bytes.is_empty() {
        return Err(PayloadError::Empty);
    }
    Ok(bytes)
}
