//! Frame decoding and model input preparation.

use image::imageops::FilterType;
use image::DynamicImage;
use thiserror::Error;
use vidstream_pipeline::{Frame, PayloadError};

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("invalid frame payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("decoded image has no pixels")]
    EmptyImage,
}

/// Decode a frame's base64 JPEG payload into an image
pub fn decode_frame(frame: &Frame) -> Result<DynamicImage, PreprocessError> {
    let bytes = frame.decode_payload()?;
    let image = image::load_from_memory(&bytes)?;
    if image.width() == 0 || image.height() == 0 {
        return Err(PreprocessError::EmptyImage);
    }
    Ok(image)
}

/// Resize to `size`x`size` and lay out as normalised NCHW RGB.
///
/// The returned buffer holds `3 * size * size` values in `[0, 1]`, one full
/// plane per channel.
pub fn to_input_tensor(image: &DynamicImage, size: u32) -> Vec<f32> {
    let resized = image.resize_exact(size, size, FilterType::Triangle).to_rgb8();
    let plane = (size as usize) * (size as usize);
    let mut tensor = vec![0.0f32; 3 * plane];

    for (idx, pixel) in resized.pixels().enumerate() {
        for channel in 0..3 {
            tensor[channel * plane + idx] = pixel[channel] as f32 / 255.0;
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn encoded_frame(image: RgbImage, format: ImageFormat) -> Frame {
        let (width, height) = image.dimensions();
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), format)
            .unwrap();
        Frame::from_jpeg(3, 1.0, width, height, &bytes)
    }

    #[test]
    fn test_decode_jpeg_frame() {
        let frame = encoded_frame(RgbImage::new(64, 48), ImageFormat::Jpeg);
        let image = decode_frame(&frame).unwrap();
        assert_eq!((image.width(), image.height()), (64, 48));
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        let mut frame = Frame::from_jpeg(0, 0.0, 2, 2, b"not an image");
        assert!(matches!(decode_frame(&frame), Err(PreprocessError::Decode(_))));

        frame.frame_data = "!!!invalid!!!".to_string();
        assert!(matches!(decode_frame(&frame), Err(PreprocessError::Payload(_))));

        frame.frame_data.clear();
        assert!(matches!(
            decode_frame(&frame),
            Err(PreprocessError::Payload(PayloadError::Empty))
        ));
    }

    #[test]
    fn test_input_tensor_is_planar_rgb() {
        let red = RgbImage::from_pixel(10, 6, Rgb([255, 0, 0]));
        let frame = encoded_frame(red, ImageFormat::Png);
        let image = decode_frame(&frame).unwrap();

        let tensor = to_input_tensor(&image, 8);
        assert_eq!(tensor.len(), 3 * 8 * 8);

        let plane = 64;
        assert!(tensor[..plane].iter().all(|v| *v > 0.99));
        assert!(tensor[plane..].iter().all(|v| *v < 0.01));
    }
}
