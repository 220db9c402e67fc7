use serde::{Deserialize, Serialize};

/// Label reported when no enrolled identity is close enough to a probe.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Integer pixel rectangle `(x, y, width, height)` clamped to an image of the
    /// given size. Returns `None` when nothing of the box lies inside the image.
    pub fn clamped_rect(&self, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = ((self.x + self.width).ceil().max(0.0) as u32).min(image_width);
        let y1 = ((self.y + self.height).ceil().max(0.0) as u32).min(image_height);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }
}

/// One enrolled embedding. An identity usually owns several records, one per
/// enrolled image, and every record takes part in nearest-neighbour search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub identity: String,
    #[serde(rename = "embedding")]
    pub vector: Vec<f32>,
}

impl EmbeddingRecord {
    pub fn new(identity: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            identity: identity.into(),
            vector,
        }
    }

    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// Result of classifying a probe vector against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Matched identity, or `None` when the probe was rejected.
    pub identity: Option<String>,
    /// `max(0, 1 - distance)` of the nearest record, accepted or not.
    pub confidence: f32,
    /// Cosine distance to the nearest record (`f32::INFINITY` for an empty gallery).
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown() -> Self {
        Self {
            identity: None,
            confidence: 0.0,
            distance: f32::INFINITY,
        }
    }

    pub fn is_known(&self) -> bool {
        self.identity.is_some()
    }

    /// Identity label, or [`UNKNOWN_IDENTITY`].
    pub fn label(&self) -> &str {
        self.identity.as_deref().unwrap_or(UNKNOWN_IDENTITY)
    }
}

/// Cosine distance `1 - (a·b)/(‖a‖‖b‖)`.
///
/// Callers guarantee non-zero vectors of equal length; a zero norm yields NaN.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}
