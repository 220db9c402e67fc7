//! rollcall-core — Face-recognition attendance engine.
//!
//! SCRFD detection and ArcFace embeddings via ONNX Runtime, a flat-file
//! embedding gallery, cosine nearest-neighbour matching and the attendance
//! debounce state machine. Nothing in here touches a camera.

pub mod alignment;
pub mod attendance;
pub mod detector;
pub mod enroll;
pub mod extractor;
pub mod gallery;
pub mod identity;
pub mod matcher;
pub mod recognizer;
pub mod store;
pub mod tracker;
pub mod types;

pub use attendance::{AttendanceError, AttendanceEvent, AttendanceSink, SqliteAttendanceLog, TracingSink};
pub use extractor::{EmbeddingExtractor, ExtractError, FaceDetector};
pub use gallery::{BuildReport, DeleteReport, GalleryBuilder, GalleryError};
pub use identity::canonical_label;
pub use matcher::{CosineMatcher, Matcher};
pub use store::{StoreError, VectorStore};
pub use tracker::{AbsenceReset, AttendanceTracker, Decision, IdentitySwitch, TrackerPolicy};
pub use types::{BoundingBox, EmbeddingRecord, MatchResult, UNKNOWN_IDENTITY};
