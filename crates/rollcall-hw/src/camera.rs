//! V4L2 webcam capture via the `v4l` crate.

use crate::frame::{self, FrameError};
use rollcall_core::pipeline::{FrameSource, SourceError};
use rollcall_core::Frame;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUEST_WIDTH: u32 = 640;
const REQUEST_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
/// Dark frames tolerated after warmup before giving up on a bright one.
const MAX_DARK_FRAMES: usize = 30;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("video capture not supported")]
    CaptureNotSupported,
    #[error("frame conversion failed: {0}")]
    Frame(#[from] FrameError),
}

impl From<CameraError> for SourceError {
    fn from(err: CameraError) -> Self {
        match err {
            CameraError::DeviceNotFound(_)
            | CameraError::DeviceBusy(_)
            | CameraError::FormatNegotiationFailed(_)
            | CameraError::CaptureNotSupported => SourceError::Unavailable(err.to_string()),
            CameraError::CaptureFailed(_) | CameraError::Frame(_) => {
                SourceError::ReadFailed(err.to_string())
            }
        }
    }
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, Y channel extracted.
    Yuyv,
    /// Motion-JPEG, decoded per frame.
    Mjpg,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpg),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }

    fn to_grayscale(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_grayscale(buf, width, height),
            Self::Mjpg => frame::mjpg_to_grayscale(buf, width, height),
            Self::Grey => frame::grey_to_grayscale(buf, width, height),
            Self::Y16 => frame::y16_to_grayscale(buf, width, height),
        }
    }
}

/// An opened V4L2 device with a negotiated format, not yet streaming.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 capture device by path (e.g. "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
                CameraError::DeviceBusy(device_path.to_string())
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::CaptureNotSupported);
        }

        // Ask for YUYV; many webcams answer with MJPG at this size instead.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUEST_WIDTH;
        fmt.height = REQUEST_HEIGHT;
        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, MJPG, GREY, or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Start streaming, discarding `warmup` frames while exposure settles.
    ///
    /// Dark frames after the warmup are also discarded, up to a limit.
    pub fn stream(self, warmup: usize) -> Result<CameraStream, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;

        let mut stream = CameraStream {
            stream,
            camera: self,
        };

        for _ in 0..warmup {
            stream.capture()?;
        }
        for _ in 0..MAX_DARK_FRAMES {
            let frame = stream.capture()?;
            if !frame::is_dark_frame(&frame.data, 0.95) {
                break;
            }
            tracing::debug!(seq = frame.sequence, "skipping dark frame");
        }

        tracing::info!(device = %stream.camera.device_path, warmup, "camera streaming");
        Ok(stream)
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps
                .capabilities
                .contains(v4l::capability::Flags::VIDEO_CAPTURE)
            {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card,
                driver: caps.driver,
                bus: caps.bus,
            });
        }

        devices
    }
}

/// A streaming camera. Dropping it stops the stream and closes the device.
pub struct CameraStream {
    // Declared before `camera` so the stream is torn down first.
    stream: MmapStream<'static>,
    camera: Camera,
}

impl CameraStream {
    pub fn width(&self) -> u32 {
        self.camera.width
    }

    pub fn height(&self) -> u32 {
        self.camera.height
    }

    /// Dequeue one buffer and convert it to grayscale.
    pub fn capture(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let data = self
            .camera
            .pixel_format
            .to_grayscale(buf, self.camera.width, self.camera.height)?;

        let mut frame = Frame::new(data, self.camera.width, self.camera.height);
        frame.sequence = meta.sequence;
        Ok(frame)
    }
}

impl FrameSource for CameraStream {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        // A webcam never runs out; every failure is a read failure.
        Ok(Some(self.capture()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_mapping() {
        assert_eq!(
            PixelFormat::from_fourcc(FourCC::new(b"YUYV")),
            Some(PixelFormat::Yuyv)
        );
        assert_eq!(
            PixelFormat::from_fourcc(FourCC::new(b"MJPG")),
            Some(PixelFormat::Mjpg)
        );
        assert_eq!(
            PixelFormat::from_fourcc(FourCC::new(b"Y16 ")),
            Some(PixelFormat::Y16)
        );
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"H264")), None);
    }

    #[test]
    fn test_missing_device_is_unavailable() {
        let err = Camera::open("/dev/does-not-exist-video").err().unwrap();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
        assert!(matches!(
            SourceError::from(err),
            SourceError::Unavailable(_)
        ));
    }

    #[test]
    fn test_capture_failure_is_read_failure() {
        let err = SourceError::from(CameraError::CaptureFailed("EIO".into()));
        assert!(matches!(err, SourceError::ReadFailed(_)));
    }
}
