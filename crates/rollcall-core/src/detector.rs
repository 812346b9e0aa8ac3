//! ONNX face detector (SCRFD export) via ONNX Runtime.
//!
//! The frame is letterboxed into a square 640×640 input, and the three
//! stride heads (8, 16, 32) are decoded into boxes in frame coordinates,
//! then filtered by score and non-maximum suppression.

use crate::pipeline::Detector;
use crate::types::{BoundingBox, Frame};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: usize = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model not found: {0}")]
    ModelNotFound(String),
    #[error("detector model has {0} outputs, expected at least 6 (score + bbox per stride)")]
    UnexpectedOutputs(usize),
    #[error("frame buffer does not match {width}x{height}")]
    InvalidFrame { width: u32, height: u32 },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps letterboxed input coordinates back to the source frame.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((INPUT_SIZE as f32 - new_w) / 2.0).floor(),
            pad_y: ((INPUT_SIZE as f32 - new_h) / 2.0).floor(),
        }
    }

    fn to_frame(self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// SCRFD face detector backed by an ONNX Runtime session.
pub struct OnnxFaceDetector {
    session: Session,
    /// (score, bbox) output index per stride.
    heads: [(usize, usize); 3],
}

impl OnnxFaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if names.len() < 6 {
            return Err(DetectorError::UnexpectedOutputs(names.len()));
        }
        let heads = output_heads(&names);

        tracing::info!(
            path = %model_path.display(),
            outputs = ?names,
            ?heads,
            "loaded face detector"
        );

        Ok(Self { session, heads })
    }
}

impl Detector for OnnxFaceDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(frame)?;
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx)) in STRIDES.iter().zip(self.heads.iter()) {
            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("scores for stride {stride}: {e}"))
            })?;
            let (_, boxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("boxes for stride {stride}: {e}"))
            })?;
            candidates.extend(decode_stride(scores, boxes, stride, letterbox, SCORE_THRESHOLD));
        }

        Ok(nms(candidates, NMS_IOU_THRESHOLD))
    }
}

/// Pick (score, bbox) output indices per stride.
///
/// Prefers tensors named `score_<stride>` / `bbox_<stride>`; otherwise uses the
/// usual export order: scores at 0..3, boxes at 3..6.
fn output_heads(names: &[String]) -> [(usize, usize); 3] {
    let find = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut heads = [(0, 3), (1, 4), (2, 5)];
    for (slot, &stride) in STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(s), Some(b)) => heads[slot] = (s, b),
            _ => return [(0, 3), (1, 4), (2, 5)],
        }
    }
    heads
}

/// Letterbox a grayscale frame into a normalized 1×3×640×640 tensor.
fn preprocess(frame: &Frame) -> Result<(Array4<f32>, Letterbox), DetectorError> {
    let invalid = || DetectorError::InvalidFrame {
        width: frame.width,
        height: frame.height,
    };
    if frame.width == 0 || frame.height == 0 {
        return Err(invalid());
    }
    let img = GrayImage::from_raw(frame.width, frame.height, frame.data.clone())
        .ok_or_else(invalid)?;

    let letterbox = Letterbox::fit(frame.width, frame.height);
    let new_w = ((frame.width as f32 * letterbox.scale).round() as u32).max(1);
    let new_h = ((frame.height as f32 * letterbox.scale).round() as u32).max(1);
    let resized = imageops::resize(&img, new_w, new_h, FilterType::Triangle);

    // Zero is the normalized value of the pad color.
    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, px) in resized.enumerate_pixels() {
        let (tx, ty) = (ox + x as usize, oy + y as usize);
        if tx >= INPUT_SIZE || ty >= INPUT_SIZE {
            continue;
        }
        let v = (px.0[0] as f32 - PIXEL_MEAN) / PIXEL_STD;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = v;
        }
    }

    Ok((tensor, letterbox))
}

/// Decode one stride head into frame-space boxes above `threshold`.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: usize,
    letterbox: Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid_w = INPUT_SIZE / stride;
    let s = stride as f32;

    scores
        .iter()
        .enumerate()
        .filter(|(_, &score)| score > threshold)
        .filter_map(|(idx, &score)| {
            let offsets = boxes.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * s;
            let cy = (cell / grid_w) as f32 * s;

            let (x1, y1) = letterbox.to_frame(cx - offsets[0] * s, cy - offsets[1] * s);
            let (x2, y2) = letterbox.to_frame(cx + offsets[2] * s, cy + offsets[3] * s);
            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression. Output is sorted by confidence, highest first.
fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let ix = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let iy = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = ix * iy;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence }
    }

    #[test]
    fn test_iou() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &bbox(20.0, 20.0, 5.0, 5.0, 1.0)), 0.0);
        let half = bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &half) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let kept = nms(
            vec![
                bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                bbox(300.0, 300.0, 40.0, 40.0, 0.6),
                bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            0.4,
        );
        let confidences: Vec<f32> = kept.iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.6]);
    }

    #[test]
    fn test_letterbox_maps_back_to_frame() {
        // 320x240 scales by 2 to 640x480, padded 80px top and bottom.
        let lb = Letterbox::fit(320, 240);
        assert_eq!((lb.scale, lb.pad_x, lb.pad_y), (2.0, 0.0, 80.0));
        assert_eq!(lb.to_frame(200.0, 180.0), (100.0, 50.0));
    }

    #[test]
    fn test_decode_stride_thresholds_and_positions() {
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let grid_w = INPUT_SIZE / 32;
        // Two anchors per cell; light up the first anchor of cell (x=2, y=1).
        let cell = grid_w + 2;
        let mut scores = vec![0.0; grid_w * grid_w * ANCHORS_PER_CELL];
        let mut boxes = vec![0.0; scores.len() * 4];
        scores[cell * 2] = 0.9;
        scores[1] = 0.4;
        boxes[cell * 2 * 4..cell * 2 * 4 + 4].copy_from_slice(&[0.5, 0.5, 1.0, 1.0]);

        let dets = decode_stride(&scores, &boxes, 32, lb, SCORE_THRESHOLD);

        assert_eq!(dets.len(), 1);
        let d = dets[0];
        assert_eq!((d.x, d.y, d.width, d.height), (48.0, 16.0, 48.0, 48.0));
        assert_eq!(d.confidence, 0.9);
    }

    #[test]
    fn test_output_heads_named_and_positional() {
        let named: Vec<String> = ["bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(output_heads(&named), [(1, 0), (3, 2), (5, 4)]);

        let numeric: Vec<String> = (0..9).map(|i| format!("{}", 400 + i)).collect();
        assert_eq!(output_heads(&numeric), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_preprocess_rejects_short_buffer() {
        let frame = Frame::new(vec![0; 10], 8, 8);
        assert!(matches!(
            preprocess(&frame),
            Err(DetectorError::InvalidFrame { width: 8, height: 8 })
        ));
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let frame = Frame::new(vec![255; 64 * 32], 64, 32);
        let (tensor, lb) = preprocess(&frame).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, INPUT_SIZE, INPUT_SIZE]);
        assert_eq!(lb.pad_y, 160.0);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let inside = tensor[[0, 1, 320, 320]];
        assert!((inside - (255.0 - PIXEL_MEAN) / PIXEL_STD).abs() < 1e-6);
    }
}
