//! rollcall-hw: webcam capture for the recognition loop.
//!
//! Wraps a V4L2 device as a [`rollcall_core::FrameSource`] producing
//! grayscale frames, whatever pixel format the driver negotiates.

pub mod backend;
pub mod camera;
pub mod frame;

pub use backend::WebcamBackend;
pub use camera::{Camera, CameraError, CameraStream, DeviceInfo, PixelFormat};
