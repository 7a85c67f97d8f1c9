//! Detection model types and classifier backends.
//!
//! The TorchScript detector is only built with the `with-tch` feature; the
//! rest of the crate has no native dependencies.

pub mod aggregate;
pub mod classifier;
pub mod detection;

#[cfg(feature = "with-tch")]
pub mod detector;

pub use aggregate::{DominantDetection, Severity, dominant, target_detections};
pub use classifier::{Classifier, ClassifierError};
pub use detection::{BoundingBox, Detection, DetectionSet, non_maximum_suppression};

#[cfg(feature = "with-tch")]
pub use tch;
