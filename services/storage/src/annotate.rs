//! Detection overlay for result frames.
//!
//! Each detection becomes a green outline plus an `id:<class> <confidence>`
//! label just above the box's top-left corner. Labels use a TrueType font
//! when one is configured and a small built-in bitmap glyph set otherwise.

use crate::config::AnnotationConfig;
use ab_glyph::{FontVec, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;
use thiserror::Error;
use tracing::info;
use vidstream_pipeline::{Detection, FrameResult, PayloadError};

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Label line height at `font_scale == 1.0`
const BASE_LINE_HEIGHT: f32 = 24.0;

/// Vertical gap between the label and the box's top edge
const LABEL_OFFSET: i32 = 10;

#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("invalid frame payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("failed to decode frame: {0}")]
    Decode(#[source] image::ImageError),

    #[error("failed to encode annotated frame: {0}")]
    Encode(#[source] image::ImageError),

    #[error("failed to load font {path}: {message}")]
    Font { path: String, message: String },
}

enum LabelFont {
    TrueType(FontVec),
    Bitmap,
}

/// Draws detections onto result frames and re-encodes them as JPEG
pub struct Annotator {
    font: LabelFont,
    line_thickness: u32,
    font_scale: f32,
    jpeg_quality: u8,
}

impl Annotator {
    pub fn new(config: &AnnotationConfig, jpeg_quality: u8) -> Result<Self, AnnotateError> {
        let font = match &config.font_path {
            Some(path) => LabelFont::TrueType(load_font(path)?),
            None => LabelFont::Bitmap,
        };

        Ok(Self {
            font,
            line_thickness: config.line_thickness,
            font_scale: config.font_scale,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        })
    }

    /// Decode, draw and re-encode one result frame
    pub fn annotate(&self, result: &FrameResult) -> Result<Vec<u8>, AnnotateError> {
        let bytes = result.decode_payload()?;
        let mut image = image::load_from_memory(&bytes)
            .map_err(AnnotateError::Decode)?
            .to_rgb8();

        self.draw(&mut image, &result.detections);

        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, self.jpeg_quality)
            .encode_image(&image)
            .map_err(AnnotateError::Encode)?;
        Ok(buf)
    }

    pub fn draw(&self, image: &mut RgbImage, detections: &[Detection]) {
        for detection in detections {
            self.draw_box(image, detection.bbox);

            let (x, y) = label_origin(detection.bbox);
            let x = x.clamp(-1, pixel_limit(image.width()));
            let y = y.min(pixel_limit(image.height()));
            let text = label_text(detection);
            match &self.font {
                LabelFont::TrueType(font) => {
                    let scale = PxScale::from(BASE_LINE_HEIGHT * self.font_scale);
                    draw_text_mut(image, BOX_COLOR, x, y, scale, font, &text);
                }
                LabelFont::Bitmap => {
                    let cell = ((BASE_LINE_HEIGHT * self.font_scale) / 6.0).round().max(1.0) as u32;
                    draw_bitmap_text(image, x, y, cell, &text);
                }
            }
        }
    }

    /// Concentric one-pixel outlines, growing inward
    fn draw_box(&self, image: &mut RgbImage, bbox: [i32; 4]) {
        // Edges past the image stay one pixel outside it and are never drawn
        let limit_x = pixel_limit(image.width());
        let limit_y = pixel_limit(image.height());
        let [x1, x2] = [bbox[0], bbox[2]].map(|x| x.clamp(-1, limit_x));
        let [y1, y2] = [bbox[1], bbox[3]].map(|y| y.clamp(-1, limit_y));
        let width = span(x1, x2);
        let height = span(y1, y2);

        for t in 0..self.line_thickness {
            if width <= t.saturating_mul(2) || height <= t.saturating_mul(2) {
                break;
            }
            let inset = t as i32;
            let rect = Rect::at(x1.saturating_add(inset), y1.saturating_add(inset))
                .of_size(width - 2 * t, height - 2 * t);
            draw_hollow_rect_mut(image, rect, BOX_COLOR);
        }
    }
}

fn pixel_limit(dimension: u32) -> i32 {
    i32::try_from(dimension).unwrap_or(i32::MAX)
}

/// Inclusive pixel count between two edges, at least 1
fn span(start: i32, end: i32) -> u32 {
    let len = i64::from(end) - i64::from(start) + 1;
    len.clamp(1, i64::from(i32::MAX)) as u32
}

fn load_font(path: &Path) -> Result<FontVec, AnnotateError> {
    let font_error = |message: String| AnnotateError::Font {
        path: path.display().to_string(),
        message,
    };
    let data = std::fs::read(path).map_err(|e| font_error(e.to_string()))?;
    let font = FontVec::try_from_vec(data).map_err(|e| font_error(e.to_string()))?;
    info!(path = %path.display(), "Loaded label font");
    Ok(font)
}

/// `id:<class_id> <confidence to 2 decimals>`
pub fn label_text(detection: &Detection) -> String {
    format!("id:{} {:.2}", detection.class_id, detection.confidence)
}

/// Label position: above the top-left corner, never above the image
pub fn label_origin(bbox: [i32; 4]) -> (i32, i32) {
    (bbox[0], bbox[1].saturating_sub(LABEL_OFFSET).max(0))
}

/// 3x5 glyphs, one row per entry, most significant of the 3 bits leftmost
fn glyph(c: char) -> [u8; 5] {
    match c {
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b111, 0b001, 0b111, 0b100, 0b111],
        '3' => [0b111, 0b001, 0b111, 0b001, 0b111],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b111, 0b001, 0b111],
        '6' => [0b111, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b001, 0b001, 0b001],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b111],
        '.' => [0b000, 0b000, 0b000, 0b000, 0b010],
        ':' => [0b000, 0b010, 0b000, 0b010, 0b000],
        '-' => [0b000, 0b000, 0b111, 0b000, 0b000],
        'i' => [0b010, 0b000, 0b010, 0b010, 0b010],
        'd' => [0b001, 0b001, 0b111, 0b101, 0b111],
        _ => [0; 5],
    }
}

fn draw_bitmap_text(image: &mut RgbImage, x: i32, y: i32, cell: u32, text: &str) {
    let step = cell as i32;
    let mut cursor = x;

    for c in text.chars() {
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..3 {
                if bits & (0b100u8 >> col) != 0 {
                    let rect = Rect::at(cursor + col * step, y + row as i32 * step).of_size(cell, cell);
                    draw_filled_rect_mut(image, rect, BOX_COLOR);
                }
            }
        }
        cursor += 4 * step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn detection(bbox: [i32; 4]) -> Detection {
        Detection {
            bbox,
            confidence: 0.72,
            class_id: 3,
        }
    }

    fn annotator() -> Annotator {
        Annotator::new(&AnnotationConfig::default(), 95).unwrap()
    }

    fn is_green(image: &RgbImage, x: u32, y: u32) -> bool {
        image.get_pixel(x, y) == &BOX_COLOR
    }

    #[test]
    fn test_label_text() {
        assert_eq!(label_text(&detection([0, 0, 1, 1])), "id:3 0.72");

        let mut d = detection([0, 0, 1, 1]);
        d.class_id = 0;
        d.confidence = 1.0;
        assert_eq!(label_text(&d), "id:0 1.00");
    }

    #[test]
    fn test_label_never_above_image() {
        assert_eq!(label_origin([15, 40, 50, 80]), (15, 30));
        assert_eq!(label_origin([15, 4, 50, 80]), (15, 0));
    }

    #[test]
    fn test_box_outline_thickness() {
        let mut image = RgbImage::new(100, 100);
        annotator().draw(&mut image, &[detection([10, 40, 50, 80])]);

        assert!(is_green(&image, 10, 60));
        assert!(is_green(&image, 11, 60));
        assert!(!is_green(&image, 12, 60));
        assert!(is_green(&image, 50, 60));
        assert!(is_green(&image, 49, 60));
        assert!(!is_green(&image, 30, 60));
        assert!(is_green(&image, 30, 80));
    }

    #[test]
    fn test_bitmap_label_drawn_above_box() {
        let mut image = RgbImage::new(120, 100);
        annotator().draw(&mut image, &[detection([10, 40, 90, 90])]);

        let label_pixels = (30..40)
            .flat_map(|y| (10..90).map(move |x| (x, y)))
            .filter(|&(x, y)| is_green(&image, x, y))
            .count();
        assert!(label_pixels > 0);
    }

    #[test]
    fn test_out_of_range_boxes_do_not_panic() {
        let mut image = RgbImage::new(20, 20);
        annotator().draw(
            &mut image,
            &[detection([15, 15, 400, 400]), detection([5, 5, 5, 5]), detection([3, 3, 1, 1])],
        );
        assert!(is_green(&image, 15, 15));
        assert!(is_green(&image, 5, 5));
    }

    #[test]
    fn test_extreme_coordinates_are_clamped() {
        let mut image = RgbImage::new(20, 20);
        annotator().draw(
            &mut image,
            &[detection([i32::MIN, 4, i32::MAX, 12]), detection([i32::MAX, i32::MAX, i32::MIN, i32::MIN])],
        );
        assert!(is_green(&image, 10, 4));
        assert!(is_green(&image, 10, 12));

        assert_eq!(label_origin([i32::MIN, i32::MIN, 0, 0]), (i32::MIN, 0));
        assert_eq!(span(i32::MIN, i32::MAX), i32::MAX as u32);
        assert_eq!(span(5, 1), 1);
        assert_eq!(span(3, 7), 5);
    }

    #[test]
    fn test_annotate_preserves_dimensions() {
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, 90)
            .encode_image(&RgbImage::new(64, 48))
            .unwrap();
        let frame = vidstream_pipeline::Frame::from_jpeg(4, 1.0, 64, 48, &jpeg);
        let result = FrameResult::with_detections(&frame, vec![detection([8, 8, 40, 40])]);

        let annotated = annotator().annotate(&result).unwrap();
        let decoded = image::load_from_memory(&annotated).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[test]
    fn test_annotate_rejects_bad_payloads() {
        let frame = vidstream_pipeline::Frame::from_jpeg(4, 1.0, 64, 48, b"not a jpeg");
        let result = FrameResult::passthrough(&frame);
        assert!(matches!(
            annotator().annotate(&result),
            Err(AnnotateError::Decode(_))
        ));

        let mut result = FrameResult::passthrough(&frame);
        result.frame_data.clear();
        assert!(matches!(
            annotator().annotate(&result),
            Err(AnnotateError::Payload(PayloadError::Empty))
        ));
    }

    #[test]
    fn test_missing_font_file() {
        let config = AnnotationConfig {
            font_path: Some(PathBuf::from("/nonexistent/label-font.ttf")),
            ..Default::default()
        };
        assert!(matches!(
            Annotator::new(&config, 95),
            Err(AnnotateError::Font { .. })
        ));
    }
}
