//! Video capture.
//!
//! [`FrameSource`] is the pull-based seam the streamer reads from. The
//! GStreamer-backed implementation decodes RTSP (or any URI GStreamer can
//! open) into packed RGB frames through an appsink.

use image::RgbImage;
use thiserror::Error;

/// Errors that can occur while capturing frames.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("GStreamer initialization failed: {0}")]
    Init(String),

    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    #[error("Pipeline element not found: {0}")]
    ElementNotFound(String),

    #[error("Pipeline state change failed: {0}")]
    StateChangeFailed(String),

    #[error("Source is not open")]
    NotOpen,

    #[error("No frame within {0:?}")]
    Timeout(std::time::Duration),

    #[error("End of stream")]
    EndOfStream,

    #[error("Frame extraction failed: {0}")]
    FrameExtraction(String),

    #[error("Capture support not compiled in: {0}")]
    Unsupported(String),
}

/// Blocking, pull-based video source.
#[cfg_attr(test, mockall::automock)]
pub trait FrameSource: Send {
    /// Acquire the source. Fails if it cannot be opened at all.
    fn open(&mut self) -> Result<(), CaptureError>;

    /// Block until the next decoded frame is available.
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError>;

    /// Release the source. Safe to call when not open.
    fn release(&mut self);
}

#[cfg(feature = "rtsp-gstreamer")]
pub use self::gst_source::GstFrameSource;

#[cfg(feature = "rtsp-gstreamer")]
mod gst_source {
    use super::{CaptureError, FrameSource};
    use crate::config::SourceConfig;
    use gstreamer as gst;
    use gstreamer::prelude::*;
    use gstreamer_app as gst_app;
    use gstreamer_video as gst_video;
    use image::RgbImage;
    use tracing::{debug, info, warn};

    /// GStreamer-backed frame source.
    pub struct GstFrameSource {
        config: SourceConfig,
        pipeline: Option<gst::Pipeline>,
        appsink: Option<gst_app::AppSink>,
    }

    impl GstFrameSource {
        pub fn new(config: SourceConfig) -> Result<Self, CaptureError> {
            gst::init().map_err(|e| CaptureError::Init(e.to_string()))?;

            Ok(Self {
                config,
                pipeline: None,
                appsink: None,
            })
        }

        /// Surface any error or EOS posted on the pipeline bus since the last read.
        fn check_bus(&self) -> Result<(), CaptureError> {
            let Some(bus) = self.pipeline.as_ref().and_then(|p| p.bus()) else {
                return Ok(());
            };

            while let Some(msg) = bus.pop() {
                match msg.view() {
                    gst::MessageView::Error(err) => {
                        return Err(CaptureError::FrameExtraction(format!(
                            "{} ({:?})",
                            err.error(),
                            err.debug()
                        )));
                    }
                    gst::MessageView::Eos(_) => return Err(CaptureError::EndOfStream),
                    gst::MessageView::Warning(w) => {
                        warn!(url = %self.config.url, warning = %w.error(), "GStreamer warning");
                    }
                    _ => {}
                }
            }

            Ok(())
        }
    }

    /// Build the GStreamer launch line for a source.
    pub(crate) fn pipeline_description(config: &SourceConfig) -> String {
        const SINK: &str = "videoconvert ! video/x-raw,format=RGB \
             ! appsink name=sink sync=false max-buffers=2 drop=true";

        if config.url.starts_with("rtsp://") || config.url.starts_with("rtsps://") {
            let protocols = match config.transport.as_str() {
                "udp" => "0",
                "udp-mcast" => "1",
                _ => "2", // tcp
            };
            format!(
                "rtspsrc location={url} protocols={protocols} latency={latency} \
                 ! decodebin ! {SINK}",
                url = config.url,
                latency = config.latency_ms,
            )
        } else {
            format!("uridecodebin uri={url} ! {SINK}", url = config.url)
        }
    }

    /// Copy a possibly row-padded RGB buffer into a tightly packed image.
    pub(crate) fn packed_rgb(
        data: &[u8],
        width: u32,
        height: u32,
        stride: usize,
    ) -> Result<RgbImage, CaptureError> {
        let row = width as usize * 3;
        if stride < row || data.len() < stride * (height as usize).saturating_sub(1) + row {
            return Err(CaptureError::FrameExtraction(format!(
                "buffer of {} bytes too small for {}x{} (stride {})",
                data.len(),
                width,
                height,
                stride
            )));
        }

        let mut packed = Vec::with_capacity(row * height as usize);
        for y in 0..height as usize {
            packed.extend_from_slice(&data[y * stride..y * stride + row]);
        }

        RgbImage::from_raw(width, height, packed)
            .ok_or_else(|| CaptureError::FrameExtraction("invalid frame dimensions".to_string()))
    }

    impl FrameSource for GstFrameSource {
        fn open(&mut self) -> Result<(), CaptureError> {
            self.release();

            let description = pipeline_description(&self.config);
            debug!(pipeline = %description, "Creating GStreamer pipeline");

            let pipeline = gst::parse::launch(&description)
                .map_err(|e| CaptureError::PipelineCreation(e.to_string()))?
                .downcast::<gst::Pipeline>()
                .map_err(|_| {
                    CaptureError::PipelineCreation("Failed to cast to Pipeline".to_string())
                })?;

            let appsink = pipeline
                .by_name("sink")
                .ok_or_else(|| CaptureError::ElementNotFound("appsink".to_string()))?
                .downcast::<gst_app::AppSink>()
                .map_err(|_| CaptureError::ElementNotFound("Could not cast to AppSink".to_string()))?;

            pipeline
                .set_state(gst::State::Playing)
                .map_err(|e| CaptureError::StateChangeFailed(e.to_string()))?;

            let (result, _state, _pending) = pipeline.state(gst::ClockTime::from_mseconds(
                self.config.read_timeout_ms,
            ));
            if result.is_err() {
                let _ = pipeline.set_state(gst::State::Null);
                return Err(CaptureError::StateChangeFailed(
                    "Timeout waiting for pipeline to start".to_string(),
                ));
            }

            info!(url = %self.config.url, "Video source opened");
            self.pipeline = Some(pipeline);
            self.appsink = Some(appsink);
            Ok(())
        }

        fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
            let appsink = self.appsink.as_ref().ok_or(CaptureError::NotOpen)?;
            let timeout = self.config.read_timeout();

            let sample = match appsink
                .try_pull_sample(gst::ClockTime::from_mseconds(self.config.read_timeout_ms))
            {
                Some(sample) => sample,
                None => {
                    self.check_bus()?;
                    if appsink.is_eos() {
                        return Err(CaptureError::EndOfStream);
                    }
                    return Err(CaptureError::Timeout(timeout));
                }
            };

            let caps = sample
                .caps()
                .ok_or_else(|| CaptureError::FrameExtraction("sample without caps".to_string()))?;
            let info = gst_video::VideoInfo::from_caps(caps)
                .map_err(|e| CaptureError::FrameExtraction(e.to_string()))?;
            let buffer = sample
                .buffer()
                .ok_or_else(|| CaptureError::FrameExtraction("sample without buffer".to_string()))?;
            let map = buffer
                .map_readable()
                .map_err(|e| CaptureError::FrameExtraction(e.to_string()))?;

            let stride = info.stride().first().copied().unwrap_or(0).max(0) as usize;
            packed_rgb(map.as_slice(), info.width(), info.height(), stride)
        }

        fn release(&mut self) {
            self.appsink = None;
            if let Some(pipeline) = self.pipeline.take() {
                debug!(url = %self.config.url, "Releasing video source");
                let _ = pipeline.set_state(gst::State::Null);
            }
        }
    }

    impl Drop for GstFrameSource {
        fn drop(&mut self) {
            self.release();
        }
    }

}
