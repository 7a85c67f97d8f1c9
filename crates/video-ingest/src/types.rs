use std::{fmt, time::Instant};

use anyhow::Error;
use thiserror::Error;

/// Pixel layout of a captured buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

/// Image buffer as returned by a camera device, before sequencing.
#[derive(Clone, Debug)]
pub struct RawImage {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub format: FrameFormat,
}

impl RawImage {
    /// A zero-sized or truncated buffer counts as a failed read.
    pub fn is_empty(&self) -> bool {
        let expected = self.width.max(0) as usize * self.height.max(0) as usize;
        expected == 0 || self.data.len() < expected * self.format.bytes_per_pixel()
    }
}

/// Captured frame tagged with its position in the capture stream.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub format: FrameFormat,
    /// Monotonic per-manager sequence number, starting at 1.
    pub sequence: u64,
    /// Wall-clock capture time in milliseconds since the epoch.
    pub timestamp_ms: i64,
    /// Monotonic capture instant used for rate calculations.
    pub captured_at: Instant,
}

/// Video backend a device index can be opened through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Backend {
    V4l2,
    DirectShow,
    MediaFoundation,
    AvFoundation,
    Any,
}

impl Backend {
    /// Backends worth trying on the current OS, most specific first.
    pub fn preferred() -> Vec<Backend> {
        if cfg!(target_os = "linux") {
            vec![Backend::V4l2, Backend::Any]
        } else if cfg!(target_os = "windows") {
            vec![Backend::DirectShow, Backend::MediaFoundation, Backend::Any]
        } else if cfg!(target_os = "macos") {
            vec![Backend::AvFoundation, Backend::Any]
        } else {
            vec![Backend::Any]
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Backend::V4l2 => "V4L2",
            Backend::DirectShow => "DirectShow",
            Backend::MediaFoundation => "MediaFoundation",
            Backend::AvFoundation => "AVFoundation",
            Backend::Any => "ANY",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Device properties the manager configures after opening.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CameraProperty {
    FrameWidth,
    FrameHeight,
    Fps,
    BufferSize,
    Autofocus,
}

impl CameraProperty {
    pub fn label(self) -> &'static str {
        match self {
            CameraProperty::FrameWidth => "width",
            CameraProperty::FrameHeight => "height",
            CameraProperty::Fps => "fps",
            CameraProperty::BufferSize => "buffer-size",
            CameraProperty::Autofocus => "autofocus",
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open camera #{index} with backend {backend}")]
    Open { index: i32, backend: Backend },
    #[error("no working camera found after {attempts} attempts")]
    NotFound { attempts: usize },
    #[error("camera is not open")]
    NotOpen,
    #[error("camera returned an empty frame")]
    EmptyFrame,
    #[error("camera rejected {} = {value}", .property.label())]
    Property {
        property: CameraProperty,
        value: f64,
    },
    #[error(transparent)]
    Other(#[from] Error),
}
