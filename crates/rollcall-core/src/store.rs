//! On-disk embedding gallery.
//!
//! The whole record sequence is persisted as one JSON array. Every mutation is
//! load → transform → save, and `save` replaces the file through a temp file and
//! rename so readers only ever observe a complete gallery.

use crate::types::EmbeddingRecord;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("embedding dimension mismatch for {identity}: expected {expected}, got {actual}")]
    DimensionMismatch {
        identity: String,
        expected: usize,
        actual: usize,
    },
}

/// Handle to the serialized gallery file.
#[derive(Debug, Clone)]
pub struct VectorStore {
    path: PathBuf,
}

impl VectorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record. A missing file is an empty gallery; an unreadable one
    /// is [`StoreError::Corrupt`].
    pub fn load(&self) -> Result<Vec<EmbeddingRecord>, StoreError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no store yet, starting empty");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let records: Vec<EmbeddingRecord> = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| StoreError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        check_dimensions(&records).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        tracing::debug!(
            path = %self.path.display(),
            records = records.len(),
            "loaded embedding store"
        );
        Ok(records)
    }

    /// Atomically replace the persisted gallery with `records`.
    pub fn save(&self, records: &[EmbeddingRecord]) -> Result<(), StoreError> {
        check_dimensions(records)?;

        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let tmp_path = self.temp_path();
        let result = (|| {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, records)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            fs::rename(&tmp_path, &self.path)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(io_err(e));
        }

        tracing::info!(
            path = %self.path.display(),
            records = records.len(),
            "saved embedding store"
        );
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Unique identity labels present in `records`.
pub fn distinct_identities(records: &[EmbeddingRecord]) -> BTreeSet<String> {
    records.iter().map(|r| r.identity.clone()).collect()
}

/// Records whose identity is not in `identities`. Exact, case-sensitive match.
pub fn remove_identity(records: &[EmbeddingRecord], identities: &[&str]) -> Vec<EmbeddingRecord> {
    records
        .iter()
        .filter(|r| !identities.contains(&r.identity.as_str()))
        .cloned()
        .collect()
}

/// Number of records per identity, in label order.
pub fn identity_counts(records: &[EmbeddingRecord]) -> Vec<(String, usize)> {
    let mut counts = std::collections::BTreeMap::<&str, usize>::new();
    for r in records {
        *counts.entry(r.identity.as_str()).or_default() += 1;
    }
    counts.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Shared dimensionality of a gallery, taken from its first record.
pub fn gallery_dimension(records: &[EmbeddingRecord]) -> Option<usize> {
    records.first().map(EmbeddingRecord::dimension)
}

fn check_dimensions(records: &[EmbeddingRecord]) -> Result<(), StoreError> {
    let Some(expected) = gallery_dimension(records) else {
        return Ok(());
    };
    match records.iter().find(|r| r.dimension() != expected) {
        Some(r) => Err(StoreError::DimensionMismatch {
            identity: r.identity.clone(),
            expected,
            actual: r.dimension(),
        }),
        None => Ok(()),
    }
}
