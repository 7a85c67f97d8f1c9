use thiserror::Error;
use video_ingest::Frame;

use crate::detection::DetectionSet;

/// Opaque frame classifier.
///
/// Called only from the capture thread, once per gated frame.
pub trait Classifier: Send {
    fn classify(
        &mut self,
        frame: &Frame,
        confidence_threshold: f32,
    ) -> Result<DetectionSet, ClassifierError>;
}

impl<F> Classifier for F
where
    F: FnMut(&Frame, f32) -> Result<DetectionSet, ClassifierError> + Send,
{
    fn classify(
        &mut self,
        frame: &Frame,
        confidence_threshold: f32,
    ) -> Result<DetectionSet, ClassifierError> {
        self(frame, confidence_threshold)
    }
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("unexpected frame buffer size: got {got} bytes, expected {expected}")]
    FrameSize { got: usize, expected: usize },
    #[error("unexpected model output shape: {0:?}")]
    OutputShape(Vec<i64>),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
