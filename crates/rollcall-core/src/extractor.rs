//! Seams to the face models.
//!
//! Detection and embedding are external capabilities. The gallery builder and
//! the recognition session only see these traits; the ONNX-backed
//! implementations live in [`crate::detector`] and [`crate::recognizer`].

use crate::types::BoundingBox;
use image::GrayImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("image region is empty")]
    EmptyRegion,
    #[error("embedding model failed: {0}")]
    Model(String),
}

/// Produces a fixed-length embedding for a face image.
pub trait EmbeddingExtractor {
    /// With `detect` set, `image` is a whole picture and the extractor localizes
    /// the face itself. Without it, `image` is already a face crop.
    fn extract(&mut self, image: &GrayImage, detect: bool) -> Result<Vec<f32>, ExtractError>;
}

/// Cheap per-frame face localization.
pub trait FaceDetector {
    /// Faces in `image`, best first.
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<BoundingBox>, ExtractError>;
}

impl<T: EmbeddingExtractor + ?Sized> EmbeddingExtractor for Box<T> {
    fn extract(&mut self, image: &GrayImage, detect: bool) -> Result<Vec<f32>, ExtractError> {
        (**self).extract(image, detect)
    }
}

impl<T: FaceDetector + ?Sized> FaceDetector for Box<T> {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<BoundingBox>, ExtractError> {
        (**self).detect(image)
    }
}
