//! ArcFace embedding extractor via ONNX Runtime.
//!
//! Produces L2-normalized 512-dimensional embeddings from 112×112 face crops,
//! using the w600k_r50 ArcFace model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::detector::{DetectorError, ScrfdDetector};
use crate::extractor::{EmbeddingExtractor, ExtractError};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<RecognizerError> for ExtractError {
    fn from(e: RecognizerError) -> Self {
        ExtractError::Model(e.to_string())
    }
}

/// Default location of the ONNX model files.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}

/// ArcFace embedder, paired with an SCRFD detector for whole-image input.
pub struct ArcFaceExtractor {
    session: Session,
    detector: ScrfdDetector,
}

impl ArcFaceExtractor {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, RecognizerError> {
        let arcface_path = model_dir.join(ARCFACE_MODEL_FILE);
        if !arcface_path.exists() {
            return Err(RecognizerError::ModelNotFound(arcface_path.display().to_string()));
        }
        let detector = ScrfdDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?;

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(&arcface_path)?;

        tracing::info!(
            path = %arcface_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session, detector })
    }

    /// Embed an already-localized face crop.
    pub fn embed(&mut self, crop: &GrayImage) -> Result<Vec<f32>, RecognizerError> {
        let input = preprocess(crop);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        l2_normalize(raw.to_vec())
            .ok_or_else(|| RecognizerError::InferenceFailed("zero-norm embedding".into()))
    }

    /// Detect the most confident face and return its aligned crop.
    fn locate(&mut self, image: &GrayImage) -> Result<GrayImage, ExtractError> {
        let faces = self.detector.detect_faces(image)?;
        let face = faces.first().ok_or(ExtractError::NoFaceDetected)?;
        alignment::face_chip(image, face).ok_or(ExtractError::EmptyRegion)
    }
}

impl EmbeddingExtractor for ArcFaceExtractor {
    fn extract(&mut self, image: &GrayImage, detect: bool) -> Result<Vec<f32>, ExtractError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(ExtractError::EmptyRegion);
        }
        let crop = if detect {
            self.locate(image)?
        } else {
            image.clone()
        };
        Ok(self.embed(&crop)?)
    }
}

/// Resize a face crop to 112×112 and lay it out as a normalized NCHW tensor,
/// replicating the gray channel into all three inputs.
fn preprocess(crop: &GrayImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let resized;
    let face = if crop.dimensions() == (ALIGNED_SIZE, ALIGNED_SIZE) {
        crop
    } else {
        resized = imageops::resize(crop, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle);
        &resized
    };

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in face.enumerate_pixels() {
        let value = (pixel.0[0] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = value;
        }
    }
    tensor
}

fn l2_normalize(mut values: Vec<f32>) -> Option<Vec<f32>> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm <= 0.0 || !norm.is_finite() {
        return None;
    }
    values.iter_mut().for_each(|v| *v /= norm);
    Some(values)
}
