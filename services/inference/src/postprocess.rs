//! Raw model output to frame-space detections.
//!
//! Rows are `[cx, cy, w, h, objectness, class_0, ..., class_k]` at model input
//! scale. The pipeline is: confidence filter, corner conversion, greedy
//! class-agnostic NMS, then rescale and clamp into the frame.

use crate::config::ThresholdConfig;
use crate::model::RawOutput;
use thiserror::Error;
use vidstream_pipeline::Detection;

#[derive(Error, Debug, PartialEq)]
pub enum PostprocessError {
    #[error("model output rows have {0} values, need at least 6")]
    MalformedOutput(usize),
}

/// A prediction that passed the confidence filter, in model input coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// Keep rows whose `objectness * best_class_score` reaches `threshold`
pub fn candidates_from_output(
    output: &RawOutput,
    threshold: f32,
) -> Result<Vec<Candidate>, PostprocessError> {
    if output.rows == 0 {
        return Ok(Vec::new());
    }
    if output.row_len < 6 {
        return Err(PostprocessError::MalformedOutput(output.row_len));
    }

    let mut candidates = Vec::new();
    for row in output.iter_rows() {
        let (class_id, class_score) = row[5..]
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (idx, &score)| {
                if score > best.1 {
                    (idx, score)
                } else {
                    best
                }
            });

        let confidence = row[4] * class_score;
        // NaN fails this comparison too
        if !(confidence >= threshold) {
            continue;
        }

        let (cx, cy) = (row[0], row[1]);
        let half_w = row[2].max(0.0) / 2.0;
        let half_h = row[3].max(0.0) / 2.0;

        candidates.push(Candidate {
            x1: cx - half_w,
            y1: cy - half_h,
            x2: cx + half_w,
            y2: cy + half_h,
            confidence,
            class_id: class_id as u32,
        });
    }

    Ok(candidates)
}

/// Intersection over union of two corner-form boxes
pub fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let ix1 = a.x1.max(b.x1);
    let iy1 = a.y1.max(b.y1);
    let ix2 = a.x2.min(b.x2);
    let iy2 = a.y2.min(b.y2);

    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    if inter == 0.0 {
        return 0.0;
    }
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        return 0.0;
    }
    inter / union
}

/// Greedy NMS across all classes.
///
/// Output is in descending confidence order. Equal confidences keep their
/// input order.
pub fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Candidate> = Vec::new();
    let mut suppressed = vec![false; candidates.len()];

    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        kept.push(candidates[i]);
        for j in (i + 1)..candidates.len() {
            if !suppressed[j] && iou(&candidates[i], &candidates[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    kept
}

/// Map a model-space box onto a `width`x`height` frame, clamped to its pixels
pub fn rescale_to_frame(candidate: &Candidate, input_size: u32, width: u32, height: u32) -> Detection {
    let sx = width as f32 / input_size as f32;
    let sy = height as f32 / input_size as f32;
    let max_x = last_pixel(width);
    let max_y = last_pixel(height);

    let scale = |v: f32, factor: f32, max: i32| ((v * factor) as i32).clamp(0, max);

    Detection {
        bbox: [
            scale(candidate.x1, sx, max_x),
            scale(candidate.y1, sy, max_y),
            scale(candidate.x2, sx, max_x),
            scale(candidate.y2, sy, max_y),
        ],
        confidence: candidate.confidence,
        class_id: candidate.class_id,
    }
}

fn last_pixel(dimension: u32) -> i32 {
    i32::try_from(dimension.saturating_sub(1)).unwrap_or(i32::MAX)
}

/// Filter, suppress and rescale one frame's raw output
pub fn postprocess(
    output: &RawOutput,
    thresholds: &ThresholdConfig,
    input_size: u32,
    width: u32,
    height: u32,
) -> Result<Vec<Detection>, PostprocessError> {
    let candidates = candidates_from_output(output, thresholds.confidence)?;
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    Ok(non_max_suppression(candidates, thresholds.iou)
        .iter()
        .map(|c| rescale_to_frame(c, input_size, width, height))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(rows: &[[f32; 7]]) -> RawOutput {
        RawOutput {
            rows: rows.len(),
            row_len: 7,
            data: rows.iter().flatten().copied().collect(),
        }
    }

    fn thresholds() -> ThresholdConfig {
        ThresholdConfig {
            confidence: 0.4,
            iou: 0.45,
        }
    }

    #[test]
    fn test_single_prediction_scenario() {
        let output = raw(&[[320.0, 320.0, 100.0, 100.0, 0.9, 0.8, 0.1]]);

        let candidates = candidates_from_output(&output, 0.4).unwrap();
        assert_eq!(candidates.len(), 1);
        let c = candidates[0];
        assert_eq!(c.class_id, 0);
        assert!((c.confidence - 0.72).abs() < 1e-5);
        assert_eq!((c.x1, c.y1, c.x2, c.y2), (270.0, 270.0, 370.0, 370.0));

        let detections = postprocess(&output, &thresholds(), 640, 640, 640).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].bbox, [270, 270, 370, 370]);
    }

    #[test]
    fn test_overlapping_boxes_keep_higher_confidence() {
        let output = raw(&[
            [320.0, 320.0, 100.0, 100.0, 0.9, 0.8, 0.1],
            [325.0, 322.0, 100.0, 100.0, 0.9, 0.9, 0.1],
        ]);

        let detections = postprocess(&output, &thresholds(), 640, 640, 640).unwrap();
        assert_eq!(detections.len(), 1);
        assert!((detections[0].confidence - 0.81).abs() < 1e-5);
        assert_eq!(detections[0].bbox, [275, 272, 375, 372]);
    }

    #[test]
    fn test_suppression_ignores_class() {
        let output = raw(&[
            [320.0, 320.0, 100.0, 100.0, 0.9, 0.8, 0.1],
            [320.0, 320.0, 100.0, 100.0, 0.9, 0.1, 0.6],
        ]);

        let detections = postprocess(&output, &thresholds(), 640, 640, 640).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_id, 0);
    }

    #[test]
    fn test_disjoint_boxes_sorted_by_confidence() {
        let output = raw(&[
            [100.0, 100.0, 50.0, 50.0, 0.9, 0.5, 0.0],
            [500.0, 500.0, 50.0, 50.0, 0.9, 0.0, 0.9],
        ]);

        let detections = postprocess(&output, &thresholds(), 640, 640, 640).unwrap();
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class_id, 1);
        assert_eq!(detections[1].class_id, 0);
    }

    #[test]
    fn test_nothing_above_threshold_is_empty() {
        let output = raw(&[
            [320.0, 320.0, 100.0, 100.0, 0.5, 0.5, 0.1],
            [100.0, 100.0, 10.0, 10.0, 0.1, 0.9, 0.9],
        ]);
        assert!(postprocess(&output, &thresholds(), 640, 1280, 720)
            .unwrap()
            .is_empty());

        let empty = RawOutput {
            rows: 0,
            row_len: 85,
            data: Vec::new(),
        };
        assert!(postprocess(&empty, &thresholds(), 640, 1280, 720)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_nan_confidence_discarded() {
        let output = raw(&[[320.0, 320.0, 100.0, 100.0, f32::NAN, 0.8, 0.1]]);
        assert!(candidates_from_output(&output, 0.4).unwrap().is_empty());
    }

    #[test]
    fn test_short_rows_are_malformed() {
        let output = RawOutput {
            rows: 2,
            row_len: 5,
            data: vec![0.0; 10],
        };
        assert_eq!(
            candidates_from_output(&output, 0.4),
            Err(PostprocessError::MalformedOutput(5))
        );
    }

    #[test]
    fn test_rescale_uses_independent_axes() {
        let candidate = Candidate {
            x1: 270.0,
            y1: 270.0,
            x2: 370.0,
            y2: 370.0,
            confidence: 0.72,
            class_id: 0,
        };
        let detection = rescale_to_frame(&candidate, 640, 1280, 720);
        assert_eq!(detection.bbox, [540, 303, 740, 416]);
    }

    #[test]
    fn test_rescale_extreme_frame_dimensions() {
        let candidate = Candidate {
            x1: 270.0,
            y1: 270.0,
            x2: 370.0,
            y2: 370.0,
            confidence: 0.72,
            class_id: 0,
        };
        let detection = rescale_to_frame(&candidate, 640, u32::MAX, 0);
        let [x1, y1, x2, y2] = detection.bbox;
        assert!(x1 > 0 && x1 <= x2);
        assert_eq!((y1, y2), (0, 0));

        assert_eq!(last_pixel(0), 0);
        assert_eq!(last_pixel(1280), 1279);
        assert_eq!(last_pixel(u32::MAX), i32::MAX);
    }

    #[test]
    fn test_boxes_stay_inside_frame() {
        let output = raw(&[
            [0.0, 0.0, 200.0, 200.0, 1.0, 0.9, 0.0],
            [640.0, 640.0, 300.0, 100.0, 1.0, 0.0, 0.9],
            [320.0, 320.0, -50.0, -50.0, 1.0, 0.9, 0.0],
            [10.0, 630.0, 1000.0, 1000.0, 1.0, 0.5, 0.0],
        ]);

        let (width, height) = (1280, 720);
        let detections = postprocess(
            &output,
            &ThresholdConfig {
                confidence: 0.4,
                iou: 1.0,
            },
            640,
            width,
            height,
        )
        .unwrap();

        assert_eq!(detections.len(), 4);
        for d in &detections {
            let [x1, y1, x2, y2] = d.bbox;
            assert!(0 <= x1 && x1 <= x2 && x2 <= width as i32 - 1, "{:?}", d.bbox);
            assert!(0 <= y1 && y1 <= y2 && y2 <= height as i32 - 1, "{:?}", d.bbox);
        }
    }

    #[test]
    fn test_iou() {
        let a = Candidate {
            x1: 0.0,
            y1: 0.0,
            x2: 10.0,
            y2: 10.0,
            confidence: 1.0,
            class_id: 0,
        };
        let b = Candidate {
            x1: 5.0,
            x2: 15.0,
            ..a
        };
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);

        let far = Candidate {
            x1: 20.0,
            x2: 30.0,
            ..a
        };
        assert_eq!(iou(&a, &far), 0.0);
    }
}
