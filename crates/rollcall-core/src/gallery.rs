//! Incremental gallery builder.
//!
//! The dataset is a directory with one subdirectory per identity. A build only
//! embeds identities that have no records in the store yet, so re-running it
//! over an unchanged dataset does no model work and leaves the store untouched.

use crate::extractor::{EmbeddingExtractor, ExtractError};
use crate::identity::{canonical_label, is_valid_label};
use crate::store::{self, StoreError, VectorStore};
use crate::types::EmbeddingRecord;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Recognized image file extensions, compared case-insensitively.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("dataset I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("another gallery write is in progress")]
    WriteInProgress,
    #[error("{0:?} is not a usable identity label")]
    InvalidLabel(String),
}

/// Why a single image produced no record. Never fatal to a build.
#[derive(Error, Debug)]
enum ImageFailure {
    #[error("decode: {0}")]
    Decode(#[from] image::ImageError),
    #[error("extract: {0}")]
    Extract(#[from] ExtractError),
    #[error("embedding has {actual} dimensions, gallery uses {expected}")]
    Dimension { expected: usize, actual: usize },
}

/// Outcome of one [`GalleryBuilder::build_or_update`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    /// Records appended by this run.
    pub added: usize,
    /// Identities that received their first records.
    pub new_identities: Vec<String>,
    /// Identities skipped because the store already covers them.
    pub skipped_identities: usize,
    /// Images that could not be decoded or embedded.
    pub failed_images: usize,
    /// Size of the gallery after the run.
    pub total_records: usize,
}

/// Outcome of [`GalleryBuilder::delete_identity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub label: String,
    pub images_removed: bool,
    pub records_removed: usize,
}

impl DeleteReport {
    pub fn removed_anything(&self) -> bool {
        self.images_removed || self.records_removed > 0
    }
}

/// Sole writer of the embedding store.
///
/// Builds and deletions are mutually exclusive; a second writer gets
/// [`GalleryError::WriteInProgress`] instead of waiting.
pub struct GalleryBuilder {
    dataset_root: PathBuf,
    store: VectorStore,
    detect: bool,
    writing: AtomicBool,
}

struct WriteGuard<'a>(&'a AtomicBool);

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl GalleryBuilder {
    pub fn new(dataset_root: impl Into<PathBuf>, store: VectorStore) -> Self {
        Self {
            dataset_root: dataset_root.into(),
            store,
            detect: true,
            writing: AtomicBool::new(false),
        }
    }

    /// Whether dataset images are whole pictures (detect the face first) or
    /// already-cropped faces.
    pub fn with_detection(mut self, detect: bool) -> Self {
        self.detect = detect;
        self
    }

    pub fn dataset_root(&self) -> &Path {
        &self.dataset_root
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    fn begin_write(&self) -> Result<WriteGuard<'_>, GalleryError> {
        self.writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| GalleryError::WriteInProgress)?;
        Ok(WriteGuard(&self.writing))
    }

    /// Embed every identity the store does not cover yet and persist the merged
    /// gallery once at the end.
    pub fn build_or_update(
        &self,
        extractor: &mut dyn EmbeddingExtractor,
    ) -> Result<BuildReport, GalleryError> {
        let _guard = self.begin_write()?;

        let mut records = self.store.load()?;
        let covered = store::distinct_identities(&records);
        let mut dimension = store::gallery_dimension(&records);
        tracing::info!(
            identities = covered.len(),
            records = records.len(),
            "starting gallery build"
        );

        let mut report = BuildReport::default();

        for (label, dir) in self.identity_dirs()? {
            if covered.contains(&label) {
                tracing::debug!(identity = %label, "already embedded, skipping");
                report.skipped_identities += 1;
                continue;
            }

            let images = match image_files(&dir) {
                Ok(images) => images,
                Err(e) => {
                    tracing::warn!(identity = %label, error = %e, "cannot list identity folder");
                    continue;
                }
            };

            let before = records.len();
            for path in images {
                match self.embed_file(extractor, &path, dimension) {
                    Ok(vector) => {
                        dimension.get_or_insert(vector.len());
                        records.push(EmbeddingRecord::new(label.clone(), vector));
                        tracing::info!(identity = %label, image = %path.display(), "embedded image");
                    }
                    Err(e) => {
                        report.failed_images += 1;
                        tracing::warn!(identity = %label, image = %path.display(), error = %e, "skipping image");
                    }
                }
            }

            if records.len() > before {
                report.added += records.len() - before;
                report.new_identities.push(label);
            }
        }

        report.total_records = records.len();
        if report.added > 0 {
            self.store.save(&records)?;
        }

        tracing::info!(
            added = report.added,
            new_identities = report.new_identities.len(),
            skipped = report.skipped_identities,
            failed = report.failed_images,
            total = report.total_records,
            "gallery build finished"
        );
        Ok(report)
    }

    /// Remove an identity's dataset folder and every store record carrying its
    /// canonical label.
    pub fn delete_identity(&self, raw_label: &str) -> Result<DeleteReport, GalleryError> {
        let label = canonical_label(raw_label);
        if !is_valid_label(&label) {
            return Err(GalleryError::InvalidLabel(raw_label.to_string()));
        }
        let _guard = self.begin_write()?;

        let folder = self.dataset_root.join(&label);
        let images_removed = if folder.is_dir() {
            fs::remove_dir_all(&folder).map_err(|source| GalleryError::Io {
                path: folder.clone(),
                source,
            })?;
            true
        } else {
            false
        };

        let records = self.store.load()?;
        let kept = store::remove_identity(&records, &[label.as_str()]);
        let records_removed = records.len() - kept.len();
        if records_removed > 0 {
            self.store.save(&kept)?;
        }

        tracing::info!(identity = %label, images_removed, records_removed, "deleted identity");
        Ok(DeleteReport {
            label,
            images_removed,
            records_removed,
        })
    }

    fn embed_file(
        &self,
        extractor: &mut dyn EmbeddingExtractor,
        path: &Path,
        expected_dim: Option<usize>,
    ) -> Result<Vec<f32>, ImageFailure> {
        let image = image::open(path)?.to_luma8();
        let vector = extractor.extract(&image, self.detect)?;
        match expected_dim {
            Some(expected) if expected != vector.len() => Err(ImageFailure::Dimension {
                expected,
                actual: vector.len(),
            }),
            _ => Ok(vector),
        }
    }

    /// Immediate subdirectories of the dataset root, sorted by label. Folders
    /// whose name is not a canonical label are skipped so every stored
    /// identity can later be deleted by name.
    fn identity_dirs(&self) -> Result<Vec<(String, PathBuf)>, GalleryError> {
        let io_err = |source| GalleryError::Io {
            path: self.dataset_root.clone(),
            source,
        };
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.dataset_root).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(label) if label.starts_with('.') => {}
                Ok(label) if !is_valid_label(&label) => tracing::warn!(
                    folder = %label,
                    canonical = %canonical_label(&label),
                    "identity folder name is not canonical, skipping"
                ),
                Ok(label) => dirs.push((label, path)),
                Err(name) => tracing::warn!(?name, "identity folder name is not UTF-8, skipping"),
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

/// Image files directly inside `dir`, sorted by path.
fn image_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && has_image_extension(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|known| e.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}
