//! Camera acquisition for the fire agent.
//!
//! - `camera`: the device capability traits and the OpenCV implementation
//!   (behind the `opencv` feature).
//! - `manager`: [`CameraManager`], which owns the handle on the capture thread.
//! - `types`: frames, backends, properties and [`CaptureError`].

pub mod camera;
pub mod manager;
pub mod types;

#[cfg(feature = "opencv")]
pub use camera::{OpenCvCamera, OpenCvOpener};
pub use camera::{CameraDevice, CameraOpener, NoDevice, UnavailableOpener};
pub use manager::{
    CameraInfo, CameraManager, CameraSettings, FailureOutcome, InitOutcome, ReinitPolicy,
};
pub use types::{Backend, CameraProperty, CaptureError, Frame, FrameFormat, RawImage};
