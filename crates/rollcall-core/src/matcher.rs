//! Nearest-neighbour classification of a probe vector against the gallery.

use crate::types::{cosine_distance, EmbeddingRecord, MatchResult};

/// Strategy for classifying a probe embedding against a gallery of records.
pub trait Matcher {
    fn classify(&self, probe: &[f32], gallery: &[EmbeddingRecord], threshold: f32) -> MatchResult;
}

/// Linear-scan cosine-distance matcher.
///
/// `threshold` is a distance: the nearest record is rejected when its distance
/// is strictly greater. On exact ties the first record seen wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn classify(&self, probe: &[f32], gallery: &[EmbeddingRecord], threshold: f32) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, record) in gallery.iter().enumerate() {
            let dist = cosine_distance(probe, &record.vector);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        let Some(idx) = best_idx else {
            return MatchResult::unknown();
        };

        let confidence = (1.0 - best_dist).max(0.0);
        let identity = if best_dist > threshold {
            None
        } else {
            Some(gallery[idx].identity.clone())
        };

        MatchResult {
            identity,
            confidence,
            distance: best_dist,
        }
    }
}
