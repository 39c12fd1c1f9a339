//! rollcall-hw — Webcam capture and frame handling.
//!
//! Provides V4L2-based camera access with index fallback, RGB frames,
//! overlay drawing and JPEG encoding for the preview stream.

pub mod camera;
pub mod frame;
pub mod overlay;

pub use camera::{open_first_available, Camera, CameraError, FrameSource, PixelFormat};
pub use frame::{Frame, FrameError};
pub use overlay::Overlay;
