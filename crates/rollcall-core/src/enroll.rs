//! Staging enrollment photos into the dataset layout.
//!
//! Accepted images are re-encoded as JPEG into `<dataset>/<label>/<label>_<n>.jpg`.
//! Whether an image is good enough is decided by an external [`QualityGate`].

use crate::identity::{canonical_label, is_valid_label};
use crate::gallery::has_image_extension;
use image::DynamicImage;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Minimum accepted images for a new identity.
pub const DEFAULT_MIN_IMAGES: usize = 5;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("{0:?} is not a usable identity label")]
    InvalidLabel(String),
    #[error("need at least {required} acceptable images, got {accepted}")]
    NotEnoughImages {
        accepted: usize,
        required: usize,
        rejected: Vec<(PathBuf, String)>,
    },
    #[error("dataset I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Pass/fail verdict with a score in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct QualityVerdict {
    pub passed: bool,
    pub score: f32,
    pub reason: Option<String>,
}

impl QualityVerdict {
    pub fn pass(score: f32) -> Self {
        Self { passed: true, score, reason: None }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self { passed: false, score: 0.0, reason: Some(reason.into()) }
    }
}

/// Decides whether a candidate photo may be enrolled.
pub trait QualityGate {
    fn assess(&self, image: &DynamicImage) -> QualityVerdict;
}

/// Rejects images whose shorter side is below `min_side` pixels.
#[derive(Debug, Clone, Copy)]
pub struct MinResolution {
    pub min_side: u32,
}

impl Default for MinResolution {
    fn default() -> Self {
        Self { min_side: 80 }
    }
}

impl QualityGate for MinResolution {
    fn assess(&self, image: &DynamicImage) -> QualityVerdict {
        let (w, h) = (image.width(), image.height());
        if w.min(h) < self.min_side {
            QualityVerdict::fail(format!("image too small ({w}x{h})"))
        } else {
            QualityVerdict::pass(1.0)
        }
    }
}

#[derive(Debug, Clone)]
pub struct StagedImage {
    pub source: PathBuf,
    pub path: PathBuf,
    pub quality: f32,
}

#[derive(Debug, Clone)]
pub struct Enrollment {
    pub label: String,
    pub folder: PathBuf,
    pub staged: Vec<StagedImage>,
    pub rejected: Vec<(PathBuf, String)>,
}

/// Copy the acceptable `images` into the dataset folder for `raw_label`.
///
/// Nothing is written unless at least `min_images` pass the gate. Existing
/// images in the folder are kept and numbering continues after them.
pub fn stage_images(
    dataset_root: &Path,
    raw_label: &str,
    images: &[PathBuf],
    gate: &dyn QualityGate,
    min_images: usize,
) -> Result<Enrollment, EnrollError> {
    let label = canonical_label(raw_label);
    if !is_valid_label(&label) {
        return Err(EnrollError::InvalidLabel(raw_label.to_string()));
    }

    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    for path in images {
        let image = match image::open(path) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(image = %path.display(), error = %e, "cannot read candidate image");
                rejected.push((path.clone(), e.to_string()));
                continue;
            }
        };
        let verdict = gate.assess(&image);
        if verdict.passed {
            accepted.push((path.clone(), image, verdict.score));
        } else {
            let reason = verdict.reason.unwrap_or_else(|| "rejected by quality gate".into());
            tracing::warn!(image = %path.display(), %reason, "candidate image rejected");
            rejected.push((path.clone(), reason));
        }
    }

    if accepted.len() < min_images {
        return Err(EnrollError::NotEnoughImages {
            accepted: accepted.len(),
            required: min_images,
            rejected,
        });
    }

    let folder = dataset_root.join(&label);
    fs::create_dir_all(&folder).map_err(|source| EnrollError::Io {
        path: folder.clone(),
        source,
    })?;
    let mut next = existing_images(&folder)? + 1;

    let mut staged = Vec::with_capacity(accepted.len());
    for (source, image, quality) in accepted {
        let path = loop {
            let candidate = folder.join(format!("{label}_{next}.jpg"));
            next += 1;
            if !candidate.exists() {
                break candidate;
            }
        };
        image
            .to_rgb8()
            .save(&path)
            .map_err(|source| EnrollError::Encode {
                path: path.clone(),
                source,
            })?;
        tracing::debug!(identity = %label, image = %path.display(), "staged image");
        staged.push(StagedImage { source, path, quality });
    }

    tracing::info!(identity = %label, staged = staged.len(), rejected = rejected.len(), "enrollment staged");
    Ok(Enrollment {
        label,
        folder,
        staged,
        rejected,
    })
}

fn existing_images(folder: &Path) -> Result<usize, EnrollError> {
    let entries = fs::read_dir(folder).map_err(|source| EnrollError::Io {
        path: folder.to_path_buf(),
        source,
    })?;
    Ok(entries
        .filter_map(Result::ok)
        .filter(|e| has_image_extension(&e.path()))
        .count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use tempfile::TempDir;

    fn photo(dir: &Path, name: &str, size: u32) -> PathBuf {
        let path = dir.join(name);
        GrayImage::from_pixel(size, size, Luma([128])).save(&path).unwrap();
        path
    }

    #[test]
    fn test_stages_accepted_images() {
        let tmp = TempDir::new().unwrap();
        let dataset = tmp.path().join("dataset");
        let images = vec![photo(tmp.path(), "a.png", 100), photo(tmp.path(), "b.png", 120)];

        let enrollment =
            stage_images(&dataset, " Bob  Smith ", &images, &MinResolution::default(), 2).unwrap();

        assert_eq!(enrollment.label, "Bob Smith");
        assert_eq!(enrollment.staged.len(), 2);
        assert!(dataset.join("Bob Smith/Bob Smith_1.jpg").is_file());
        assert!(dataset.join("Bob Smith/Bob Smith_2.jpg").is_file());
    }

    #[test]
    fn test_rejects_small_images() {
        let tmp = TempDir::new().unwrap();
        let dataset = tmp.path().join("dataset");
        let images = vec![photo(tmp.path(), "ok.png", 100), photo(tmp.path(), "tiny.png", 20)];

        let err = stage_images(&dataset, "Bob", &images, &MinResolution::default(), 2).unwrap_err();
        match err {
            EnrollError::NotEnoughImages { accepted, required, rejected } => {
                assert_eq!((accepted, required), (1, 2));
                assert_eq!(rejected.len(), 1);
                assert!(rejected[0].1.contains("too small"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!dataset.join("Bob").exists());
    }

    #[test]
    fn test_unreadable_image_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let bogus = tmp.path().join("bogus.jpg");
        fs::write(&bogus, b"nope").unwrap();
        let images = vec![bogus, photo(tmp.path(), "ok.png", 100)];

        let enrollment =
            stage_images(&tmp.path().join("dataset"), "Eve", &images, &MinResolution::default(), 1).unwrap();
        assert_eq!(enrollment.staged.len(), 1);
        assert_eq!(enrollment.rejected.len(), 1);
    }

    #[test]
    fn test_numbering_continues_after_existing() {
        let tmp = TempDir::new().unwrap();
        let dataset = tmp.path().join("dataset");
        let gate = MinResolution::default();
        stage_images(&dataset, "Dan", &[photo(tmp.path(), "a.png", 90)], &gate, 1).unwrap();
        let second = stage_images(&dataset, "Dan", &[photo(tmp.path(), "b.png", 90)], &gate, 1).unwrap();
        assert_eq!(second.staged[0].path, dataset.join("Dan/Dan_2.jpg"));
    }

    #[test]
    fn test_blank_label_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let err = stage_images(tmp.path(), "   ", &[], &MinResolution::default(), 0).unwrap_err();
        assert!(matches!(err, EnrollError::InvalidLabel(_)));
    }

    #[test]
    fn test_dot_labels_cannot_escape_dataset() {
        let tmp = TempDir::new().unwrap();
        let dataset = tmp.path().join("dataset");
        let images = vec![photo(tmp.path(), "a.png", 100)];
        let gate = MinResolution::default();

        for label in [".", "..", " .. ", ".hidden"] {
            let err = stage_images(&dataset, label, &images, &gate, 1).unwrap_err();
            assert!(matches!(err, EnrollError::InvalidLabel(_)), "{label:?}");
        }
        assert!(!dataset.exists());
        // Only the source photo is next to the dataset.
        let entries: Vec<_> = fs::read_dir(tmp.path()).unwrap().filter_map(Result::ok).collect();
        assert_eq!(entries.len(), 1);
    }
}
