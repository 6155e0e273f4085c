//! Per-frame downscale and JPEG encoding.

use fast_image_resize as fr;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use thiserror::Error;
use vidstream_pipeline::{unix_timestamp, Frame};

use crate::config::EncodingConfig;

/// Errors that can occur while encoding a frame.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Resize failed: {0}")]
    Resize(String),

    #[error("JPEG encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),

    #[error("Empty frame")]
    EmptyFrame,
}

/// Downscales oversized frames and encodes them as JPEG.
pub struct FrameEncoder {
    max_width: u32,
    quality: u8,
    resizer: fr::Resizer,
}

impl FrameEncoder {
    pub fn new(config: &EncodingConfig) -> Self {
        Self {
            max_width: config.max_width.max(1),
            quality: config.jpeg_quality.clamp(1, 95),
            resizer: fr::Resizer::new(),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Output dimensions for a `width`x`height` input.
    pub fn target_size(&self, width: u32, height: u32) -> (u32, u32) {
        if width <= self.max_width {
            return (width, height);
        }
        let scaled = (height as u64 * self.max_width as u64) / width as u64;
        (self.max_width, (scaled as u32).max(1))
    }

    /// Area-averaging downscale to `max_width`; smaller frames pass through untouched.
    pub fn downscale(&mut self, image: RgbImage) -> Result<RgbImage, EncodeError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(EncodeError::EmptyFrame);
        }

        let (dst_width, dst_height) = self.target_size(width, height);
        if (dst_width, dst_height) == (width, height) {
            return Ok(image);
        }

        let src = fr::images::ImageRef::new(width, height, image.as_raw(), fr::PixelType::U8x3)
            .map_err(|e| EncodeError::Resize(e.to_string()))?;
        let mut dst = fr::images::Image::new(dst_width, dst_height, fr::PixelType::U8x3);

        let options =
            fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Box));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .map_err(|e| EncodeError::Resize(e.to_string()))?;

        RgbImage::from_raw(dst_width, dst_height, dst.into_vec())
            .ok_or_else(|| EncodeError::Resize("resized buffer size mismatch".to_string()))
    }

    /// JPEG-encode an RGB image at the configured quality.
    pub fn encode_jpeg(&self, image: &RgbImage) -> Result<Vec<u8>, EncodeError> {
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, self.quality).encode_image(image)?;
        Ok(buf)
    }

    /// Downscale, encode and wrap a captured frame.
    pub fn encode(&mut self, frame_id: u64, image: RgbImage) -> Result<Frame, EncodeError> {
        let image = self.downscale(image)?;
        let (width, height) = image.dimensions();
        let jpeg = self.encode_jpeg(&image)?;

        Ok(Frame::from_jpeg(frame_id, unix_timestamp(), width, height, &jpeg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder(max_width: u32, jpeg_quality: u8) -> FrameEncoder {
        FrameEncoder::new(&EncodingConfig {
            max_width,
            jpeg_quality,
        })
    }

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        })
    }

    #[test]
    fn test_downscale_720p_to_640() {
        let mut encoder = encoder(640, 55);
        let resized = encoder.downscale(gradient(1280, 720)).unwrap();
        assert_eq!(resized.dimensions(), (640, 360));
    }

    #[test]
    fn test_narrow_frames_untouched() {
        let mut encoder = encoder(640, 55);
        let resized = encoder.downscale(gradient(320, 240)).unwrap();
        assert_eq!(resized.dimensions(), (320, 240));
    }

    #[test]
    fn test_target_size_floors_and_keeps_one_row() {
        let encoder = encoder(640, 55);
        assert_eq!(encoder.target_size(1000, 333), (640, 213));
        assert_eq!(encoder.target_size(4000, 2), (640, 1));
    }

    #[test]
    fn test_quality_clamped() {
        assert_eq!(encoder(640, 0).quality(), 1);
        assert_eq!(encoder(640, 100).quality(), 95);
        assert_eq!(encoder(640, 55).quality(), 55);
    }

    #[test]
    fn test_encode_roundtrip_preserves_dimensions() {
        let mut encoder = encoder(640, 55);
        let frame = encoder.encode(3, gradient(1280, 720)).unwrap();

        assert_eq!(frame.frame_id, 3);
        assert_eq!((frame.width, frame.height), (640, 360));
        assert!(frame.timestamp > 0.0);

        let jpeg = frame.decode_payload().unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (640, 360));
    }

    #[test]
    fn test_empty_frame_rejected() {
        let mut encoder = encoder(640, 55);
        assert!(matches!(
            encoder.downscale(RgbImage::new(0, 0)),
            Err(EncodeError::EmptyFrame)
        ));
    }
}
