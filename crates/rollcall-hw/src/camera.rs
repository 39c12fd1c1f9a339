//! V4L2 webcam capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("no working camera; tried indices {tried:?}")]
    Unavailable { tried: Vec<u32> },
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, converted to RGB per frame.
    Yuyv,
    /// Motion JPEG, decoded per frame.
    Mjpeg,
    /// Packed RGB24, used as-is.
    Rgb24,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpeg),
            b"RGB3" => Some(Self::Rgb24),
            _ => None,
        }
    }
}

/// Anything that yields RGB frames: a webcam, or a fake in tests.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, CameraError>;

    /// Human-readable name for logs and diagnostics.
    fn describe(&self) -> String;

    /// Drop `count` frames while exposure settles.
    fn discard(&mut self, count: usize) -> Result<(), CameraError> {
        for _ in 0..count {
            self.next_frame()?;
        }
        Ok(())
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        (**self).next_frame()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// V4L2 camera device handle. Streaming stops when it is dropped.
pub struct Camera {
    stream: MmapStream<'static>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `/dev/video{index}`.
    pub fn open_index(index: u32) -> Result<Self, CameraError> {
        Self::open(&format!("/dev/video{index}"))
    }

    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
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

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for YUYV; most webcams answer with YUYV or MJPG.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, MJPG, or RGB3)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, 4).map_err(|e| {
            CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
        })?;

        Ok(Self {
            stream,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
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
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let sequence = meta.sequence;

        let (data, width, height) = to_rgb(buf, self.pixel_format, self.width, self.height)?;
        let mut frame = Frame::new(data, width, height)
            .map_err(|e| CameraError::CaptureFailed(format!("bad frame: {e}")))?;
        frame.sequence = sequence;
        Ok(frame)
    }

    fn describe(&self) -> String {
        format!("{} ({}x{}, {:?})", self.device_path, self.width, self.height, self.pixel_format)
    }
}

/// Convert a raw buffer to RGB24 based on the negotiated format.
fn to_rgb(
    buf: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<(Vec<u8>, u32, u32), CameraError> {
    match format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height)
            .map(|rgb| (rgb, width, height))
            .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
        PixelFormat::Mjpeg => frame::decode_mjpeg(buf)
            .map_err(|e| CameraError::CaptureFailed(format!("MJPEG decode failed: {e}"))),
        PixelFormat::Rgb24 => {
            let expected = width as usize * height as usize * 3;
            if buf.len() < expected {
                return Err(CameraError::CaptureFailed(format!(
                    "RGB3 buffer too short: expected {expected}, got {}",
                    buf.len()
                )));
            }
            Ok((buf[..expected].to_vec(), width, height))
        }
    }
}

/// Try each index in order and return the first source that opens.
///
/// Failures are logged and skipped; if every index fails the result is
/// `CameraError::Unavailable` listing what was tried.
pub fn open_first_available<S, F>(indices: &[u32], mut opener: F) -> Result<(u32, S), CameraError>
where
    F: FnMut(u32) -> Result<S, CameraError>,
{
    for &index in indices {
        match opener(index) {
            Ok(source) => {
                tracing::info!(index, "camera selected");
                return Ok((index, source));
            }
            Err(e) => tracing::warn!(index, error = %e, "camera index unavailable"),
        }
    }
    Err(CameraError::Unavailable {
        tried: indices.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSource {
        index: u32,
        served: usize,
    }

    impl FrameSource for FakeSource {
        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            self.served += 1;
            Ok(Frame::solid(4, 4, [10, 20, 30]))
        }

        fn describe(&self) -> String {
            format!("fake{}", self.index)
        }
    }

    #[test]
    fn test_fallback_selects_third_index() {
        let mut attempts = Vec::new();
        let (index, source) = open_first_available(&[0, 1, 2], |i| {
            attempts.push(i);
            if i < 2 {
                Err(CameraError::DeviceNotFound(format!("/dev/video{i}")))
            } else {
                Ok(FakeSource { index: i, served: 0 })
            }
        })
        .unwrap();
        assert_eq!(index, 2);
        assert_eq!(source.describe(), "fake2");
        assert_eq!(attempts, vec![0, 1, 2]);
    }

    #[test]
    fn test_fallback_stops_at_first_success() {
        let mut attempts = 0;
        let (index, _) = open_first_available(&[0, 1, 2], |i| {
            attempts += 1;
            Ok::<_, CameraError>(FakeSource { index: i, served: 0 })
        })
        .unwrap();
        assert_eq!(index, 0);
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_fallback_all_fail() {
        let result = open_first_available::<FakeSource, _>(&[0, 1, 2], |_| Err(CameraError::DeviceBusy));
        match result {
            Err(CameraError::Unavailable { tried }) => assert_eq!(tried, vec![0, 1, 2]),
            _ => panic!("expected Unavailable"),
        }
    }

    #[test]
    fn test_discard_consumes_frames() {
        let mut source = FakeSource { index: 0, served: 0 };
        source.discard(4).unwrap();
        assert_eq!(source.served, 4);
    }

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), None);
    }

    #[test]
    fn test_rgb24_passthrough_and_short_buffer() {
        let buf = vec![7u8; 2 * 2 * 3];
        let (rgb, w, h) = to_rgb(&buf, PixelFormat::Rgb24, 2, 2).unwrap();
        assert_eq!((rgb.len(), w, h), (12, 2, 2));
        assert!(to_rgb(&buf[..5], PixelFormat::Rgb24, 2, 2).is_err());
    }

    #[test]
    fn test_open_missing_device() {
        let result = Camera::open("/dev/video-does-not-exist");
        assert!(matches!(result, Err(CameraError::DeviceNotFound(_))));
    }
}
