//! rollcall-hw — Camera capture for the recognition loop.
//!
//! V4L2 access through the `v4l` crate behind the [`FrameSource`] trait,
//! with bounded retry when the device is busy or missing.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, PixelFormat, V4lSource};
pub use frame::{Frame, FrameError};
pub use source::{open_with_retry, FrameSource, RetryPolicy};
