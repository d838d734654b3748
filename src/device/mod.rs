//! Camera device backends.
//!
//! The worker talks to hardware through [`CameraDevice`]; implementations
//! cover real V4L2 devices (behind the `device-v4l2` feature) and
//! synthetic `stub://` sources used in tests and broker-only development
//! setups. Raw buffers come out in the device's native pixel format and
//! are converted to RGB by [`convert`].

pub mod convert;
pub mod synthetic;
#[cfg(feature = "device-v4l2")]
pub mod v4l2;

use std::fmt;

use anyhow::{bail, Result};

use crate::controls::ControlDesc;

/// Pixel layout of raw device buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb24,
    Yuyv,
    Mjpeg,
}

impl PixelFormat {
    pub fn fourcc(&self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "RGB3",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Mjpeg => "MJPG",
        }
    }

    pub fn from_fourcc(fourcc: &str) -> Option<PixelFormat> {
        match fourcc {
            "RGB3" => Some(PixelFormat::Rgb24),
            "YUYV" => Some(PixelFormat::Yuyv),
            "MJPG" => Some(PixelFormat::Mjpeg),
            _ => None,
        }
    }
}

/// One capture format a device offers.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceFormat {
    pub pixel: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl fmt::Display for DeviceFormat {
    /// The label shown in the format chooser.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}px {} {} fps",
            self.width,
            self.height,
            self.pixel.fourcc(),
            self.fps
        )
    }
}

/// A raw buffer off the device and the format it was captured in.
pub struct CaptureFrame {
    pub data: Vec<u8>,
    pub format: DeviceFormat,
}

/// Driver seam. The owning worker is the only caller, so implementations
/// can keep mutable capture state without locking.
pub trait CameraDevice: Send {
    /// Stable identifier, also the calibration storage key (`video0`).
    fn id(&self) -> &str;

    /// Human description for the published record.
    fn description(&self) -> String;

    /// Source string the device was opened from.
    fn source(&self) -> String;

    fn open(&mut self) -> Result<()>;

    fn close(&mut self);

    fn formats(&mut self) -> Result<Vec<DeviceFormat>>;

    fn current_format(&self) -> DeviceFormat;

    /// Applying a format tears down and rebuilds the capture stream.
    fn set_format(&mut self, format: &DeviceFormat) -> Result<()>;

    /// Blocks until the device delivers the next frame.
    fn next_frame(&mut self) -> Result<CaptureFrame>;

    fn controls(&mut self) -> Result<Vec<ControlDesc>>;

    fn control_value(&mut self, id: u32) -> Result<i64>;

    fn set_control(&mut self, id: u32, value: i64) -> Result<()>;
}

/// Opens a device for a configured source string.
pub fn open_device(source: &str) -> Result<Box<dyn CameraDevice>> {
    if let Some(pattern) = source.strip_prefix("stub://") {
        return Ok(Box::new(synthetic::SyntheticDevice::new(pattern)?));
    }
    if source.starts_with("/dev/") {
        #[cfg(feature = "device-v4l2")]
        {
            return Ok(Box::new(v4l2::V4l2Device::new(source)?));
        }
        #[cfg(not(feature = "device-v4l2"))]
        bail!("camera source '{source}' needs the device-v4l2 feature");
    }
    bail!("unrecognized camera source '{source}'")
}

/// Filesystem key for a source string, used for storage directories and
/// table paths: `/dev/video0` becomes `video0`, `stub://checker` becomes
/// `checker`.
pub fn storage_key(source: &str) -> String {
    let trimmed = source
        .strip_prefix("stub://")
        .or_else(|| source.strip_prefix("/dev/"))
        .unwrap_or(source);
    let key: String = trimmed
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    key.trim_matches('_').to_string()
}

/// Capture device nodes present on this host, in name order.
pub fn discover_sources() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/dev") else {
        return Vec::new();
    };
    let mut sources: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| {
            name.strip_prefix("video")
                .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        })
        .map(|name| format!("/dev/{name}"))
        .collect();
    sources.sort();
    sources
}
