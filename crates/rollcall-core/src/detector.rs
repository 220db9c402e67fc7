//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes the frame into a 640×640 input, decodes the three anchor-free
//! stride heads (score, box, five landmarks) and keeps the strongest
//! non-overlapping detections.

use crate::extractor::{ExtractError, FaceDetector};
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<DetectorError> for ExtractError {
    fn from(e: DetectorError) -> Self {
        ExtractError::Model(e.to_string())
    }
}

/// Mapping between letterboxed model space and source pixels.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let (w, h) = Self::scaled_dims(width, height, scale);
        Self {
            scale,
            pad_x: (INPUT_SIZE - w) as f32 / 2.0,
            pad_y: (INPUT_SIZE - h) as f32 / 2.0,
        }
    }

    fn scaled_dims(width: u32, height: u32, scale: f32) -> (u32, u32) {
        let w = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        let h = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        (w, h)
    }

    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// `[score, bbox, kps]` output tensor positions for each stride.
type OutputLayout = [[usize; 3]; 3];

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    layout: OutputLayout,
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }
        let layout = output_layout(&names);

        tracing::info!(path = %model_path.display(), outputs = ?names, ?layout, "loaded SCRFD model");
        Ok(Self { session, layout })
    }

    /// Faces in a grayscale image, highest confidence first.
    pub fn detect_faces(&mut self, image: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &[score_idx, bbox_idx, kps_idx]) in STRIDES.iter().zip(self.layout.iter()) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let heads = StrideHeads {
                stride,
                scores: extract(score_idx, "scores")?,
                boxes: extract(bbox_idx, "boxes")?,
                landmarks: extract(kps_idx, "landmarks")?,
            };
            candidates.extend(heads.decode(&letterbox, SCORE_THRESHOLD));
        }

        Ok(suppress_overlaps(candidates, IOU_THRESHOLD))
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<BoundingBox>, ExtractError> {
        Ok(self.detect_faces(image)?)
    }
}

/// Letterbox a grayscale image into a normalized NCHW tensor.
fn preprocess(image: &GrayImage) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(image.width(), image.height());
    let (w, h) = Letterbox::scaled_dims(image.width(), image.height(), letterbox.scale);
    let resized = imageops::resize(image, w, h, FilterType::Triangle);

    let size = INPUT_SIZE as usize;
    let x0 = letterbox.pad_x.floor() as u32;
    let y0 = letterbox.pad_y.floor() as u32;

    // Padding stays at 0.0, which is what the mean pixel normalizes to.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let value = (pixel.0[0] as f32 - PIXEL_MEAN) / PIXEL_STD;
        let (tx, ty) = ((x + x0) as usize, (y + y0) as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = value;
        }
    }

    (tensor, letterbox)
}

/// Map output tensors to strides by name (`score_8`, `bbox_16`, ...), falling
/// back to the usual positional order: scores, then boxes, then landmarks.
fn output_layout(names: &[String]) -> OutputLayout {
    let position = |kind: &str, stride: usize| {
        let target = format!("{kind}_{stride}");
        names.iter().position(|n| *n == target)
    };
    let by_name = || -> Option<OutputLayout> {
        let mut layout = [[0; 3]; 3];
        for (slot, &stride) in layout.iter_mut().zip(STRIDES.iter()) {
            *slot = [
                position("score", stride)?,
                position("bbox", stride)?,
                position("kps", stride)?,
            ];
        }
        Some(layout)
    };
    by_name().unwrap_or([[0, 3, 6], [1, 4, 7], [2, 5, 8]])
}

/// Raw outputs of one stride level.
struct StrideHeads<'a> {
    stride: usize,
    scores: &'a [f32],
    boxes: &'a [f32],
    landmarks: &'a [f32],
}

impl StrideHeads<'_> {
    fn decode(&self, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
        let grid_w = INPUT_SIZE as usize / self.stride;
        let step = self.stride as f32;

        self.scores
            .iter()
            .enumerate()
            .filter(|(_, &score)| score > threshold)
            .filter_map(|(idx, &score)| {
                let cell = idx / ANCHORS_PER_CELL;
                let cx = (cell % grid_w) as f32 * step;
                let cy = (cell / grid_w) as f32 * step;

                let d = self.boxes.get(idx * 4..idx * 4 + 4)?;
                let (x1, y1) = letterbox.to_source(cx - d[0] * step, cy - d[1] * step);
                let (x2, y2) = letterbox.to_source(cx + d[2] * step, cy + d[3] * step);

                let landmarks = self.landmarks.get(idx * 10..idx * 10 + 10).map(|k| {
                    std::array::from_fn(|i| {
                        letterbox.to_source(cx + k[i * 2] * step, cy + k[i * 2 + 1] * step)
                    })
                });

                Some(BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: score,
                    landmarks,
                })
            })
            .collect()
    }
}

/// Greedy non-maximum suppression; the result is sorted by confidence.
fn suppress_overlaps(mut candidates: Vec<BoundingBox>, iou_limit: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_limit) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
