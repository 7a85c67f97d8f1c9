//! Camera capability: opening a device through a backend, reading frames,
//! and best-effort property configuration.

use crate::types::{Backend, CameraProperty, CaptureError, RawImage};

/// An opened video device.
///
/// Implementations are only ever touched from the capture thread, so they do
/// not need to be `Sync`.
pub trait CameraDevice {
    /// Grab and decode the next frame.
    fn read(&mut self) -> Result<RawImage, CaptureError>;

    /// Apply a property. `Ok(false)` means the driver ignored the request.
    fn set(&mut self, property: CameraProperty, value: f64) -> Result<bool, CaptureError>;

    /// Read back the value the driver actually uses.
    fn get(&self, property: CameraProperty) -> Result<f64, CaptureError>;

    /// Release the underlying device. Must be safe to call more than once.
    fn release(&mut self);
}

/// Factory for [`CameraDevice`]s keyed by (index, backend).
pub trait CameraOpener {
    type Device: CameraDevice;

    fn open(&mut self, index: i32, backend: Backend) -> Result<Self::Device, CaptureError>;

    /// Backends probed for every index, in order.
    fn backends(&self) -> Vec<Backend> {
        Backend::preferred()
    }
}

/// Opener for builds without a camera backend; every probe fails, which
/// leaves the agent in degraded mode.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnavailableOpener;

/// Device type for [`UnavailableOpener`]; never constructed.
#[derive(Debug)]
pub enum NoDevice {}

impl CameraDevice for NoDevice {
    fn read(&mut self) -> Result<RawImage, CaptureError> {
        match *self {}
    }

    fn set(&mut self, _property: CameraProperty, _value: f64) -> Result<bool, CaptureError> {
        match *self {}
    }

    fn get(&self, _property: CameraProperty) -> Result<f64, CaptureError> {
        match *self {}
    }

    fn release(&mut self) {
        match *self {}
    }
}

impl CameraOpener for UnavailableOpener {
    type Device = NoDevice;

    fn open(&mut self, index: i32, backend: Backend) -> Result<NoDevice, CaptureError> {
        Err(CaptureError::Open { index, backend })
    }
}

#[cfg(feature = "opencv")]
pub use self::opencv_backend::{OpenCvCamera, OpenCvOpener};

#[cfg(feature = "opencv")]
mod opencv_backend {
    use opencv::{
        core::{Mat, MatTraitConst, MatTraitConstManual},
        videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
    };

    use super::{CameraDevice, CameraOpener};
    use crate::types::{Backend, CameraProperty, CaptureError, FrameFormat, RawImage};

    /// Opens devices through OpenCV's `VideoCapture`.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct OpenCvOpener;

    pub struct OpenCvCamera {
        cap: VideoCapture,
        frame: Mat,
    }

    fn backend_id(backend: Backend) -> i32 {
        match backend {
            Backend::V4l2 => videoio::CAP_V4L2,
            Backend::DirectShow => videoio::CAP_DSHOW,
            Backend::MediaFoundation => videoio::CAP_MSMF,
            Backend::AvFoundation => videoio::CAP_AVFOUNDATION,
            Backend::Any => videoio::CAP_ANY,
        }
    }

    fn property_id(property: CameraProperty) -> i32 {
        match property {
            CameraProperty::FrameWidth => videoio::CAP_PROP_FRAME_WIDTH,
            CameraProperty::FrameHeight => videoio::CAP_PROP_FRAME_HEIGHT,
            CameraProperty::Fps => videoio::CAP_PROP_FPS,
            CameraProperty::BufferSize => videoio::CAP_PROP_BUFFERSIZE,
            CameraProperty::Autofocus => videoio::CAP_PROP_AUTOFOCUS,
        }
    }

    impl CameraOpener for OpenCvOpener {
        type Device = OpenCvCamera;

        fn open(&mut self, index: i32, backend: Backend) -> Result<OpenCvCamera, CaptureError> {
            let mut cap = VideoCapture::new(index, backend_id(backend))
                .map_err(|e| CaptureError::Other(e.into()))?;
            if !cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                let _ = cap.release();
                return Err(CaptureError::Open { index, backend });
            }
            Ok(OpenCvCamera {
                cap,
                frame: Mat::default(),
            })
        }
    }

    impl CameraDevice for OpenCvCamera {
        fn read(&mut self) -> Result<RawImage, CaptureError> {
            let grabbed = self
                .cap
                .read(&mut self.frame)
                .map_err(|e| CaptureError::Other(e.into()))?;
            if !grabbed {
                return Err(CaptureError::EmptyFrame);
            }
            let size = self
                .frame
                .size()
                .map_err(|e| CaptureError::Other(e.into()))?;
            if size.width <= 0 || size.height <= 0 {
                return Err(CaptureError::EmptyFrame);
            }
            let data = if self.frame.is_continuous() {
                self.frame
                    .data_bytes()
                    .map_err(|e| CaptureError::Other(e.into()))?
                    .to_vec()
            } else {
                self.frame
                    .try_clone()
                    .and_then(|m| m.data_bytes().map(<[u8]>::to_vec))
                    .map_err(|e| CaptureError::Other(e.into()))?
            };
            Ok(RawImage {
                data,
                width: size.width,
                height: size.height,
                format: FrameFormat::Bgr8,
            })
        }

        fn set(&mut self, property: CameraProperty, value: f64) -> Result<bool, CaptureError> {
            self.cap
                .set(property_id(property), value)
                .map_err(|e| CaptureError::Other(e.into()))
        }

        fn get(&self, property: CameraProperty) -> Result<f64, CaptureError> {
            self.cap
                .get(property_id(property))
                .map_err(|e| CaptureError::Other(e.into()))
        }

        fn release(&mut self) {
            let _ = self.cap.release();
        }
    }
}
