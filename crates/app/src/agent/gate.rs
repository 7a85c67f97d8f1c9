use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Instant,
};

use ml_core::{
    Classifier, ClassifierError, DominantDetection, Severity, dominant, target_detections,
};
use tracing::{debug, warn};
use video_ingest::Frame;

use crate::agent::{
    data::OverlayBox,
    faults::{FaultCounters, FaultKind},
};

/// What the gate did with a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateDecision {
    Classified,
    /// Not this frame's turn; the previous result stays current.
    Skipped,
    /// Classifier failed or panicked; treated as no detections.
    Failed,
    /// No classifier configured.
    Disabled,
}

/// Frame-skip throttling in front of the classifier.
pub struct InferenceGate {
    classifier: Option<Box<dyn Classifier>>,
    skip_factor: u64,
    confidence_threshold: f32,
    target_label: String,
    frames_seen: u64,
    classified: u64,
    current: DominantDetection,
    overlay: Vec<OverlayBox>,
    faults: Arc<FaultCounters>,
}

impl InferenceGate {
    pub fn new(
        classifier: Option<Box<dyn Classifier>>,
        skip_factor: u32,
        confidence_threshold: f32,
        target_label: impl Into<String>,
        faults: Arc<FaultCounters>,
    ) -> Self {
        Self {
            classifier,
            skip_factor: u64::from(skip_factor.max(1)),
            confidence_threshold,
            target_label: target_label.into(),
            frames_seen: 0,
            classified: 0,
            current: DominantDetection::None,
            overlay: Vec::new(),
            faults,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.classifier.is_some()
    }

    /// Count the frame and classify it if `count % K == 0`.
    pub fn process(&mut self, frame: &Frame) -> GateDecision {
        self.frames_seen = self.frames_seen.wrapping_add(1);
        let Some(classifier) = self.classifier.as_mut() else {
            return GateDecision::Disabled;
        };
        if self.frames_seen % self.skip_factor != 0 {
            return GateDecision::Skipped;
        }

        let started = Instant::now();
        let threshold = self.confidence_threshold;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            classifier.classify(frame, threshold)
        }));
        metrics::histogram!("agent_classify_seconds").record(started.elapsed().as_secs_f64());

        let detections = match outcome {
            Ok(Ok(detections)) => detections,
            Ok(Err(err)) => {
                self.record_failure(frame.sequence, &err);
                return GateDecision::Failed;
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                self.record_failure(
                    frame.sequence,
                    &ClassifierError::Other(anyhow::anyhow!("classifier panicked: {message}")),
                );
                return GateDecision::Failed;
            }
        };

        self.classified = self.classified.wrapping_add(1);
        self.overlay = target_detections(&detections, &self.target_label)
            .map(|d| OverlayBox {
                bbox: d.bbox,
                area: d.area,
                confidence: d.confidence,
                severity: Severity::from_area(d.area),
            })
            .collect();
        self.current = dominant(&detections, &self.target_label);
        if let Some(found) = self.current.detection() {
            debug!(
                frame = frame.sequence,
                area = found.area,
                confidence = found.confidence,
                candidates = detections.len(),
                "Target detected"
            );
        }
        GateDecision::Classified
    }

    fn record_failure(&mut self, sequence: u64, err: &ClassifierError) {
        self.faults.record(FaultKind::Classifier);
        warn!("Classifier failed on frame #{sequence}: {err}");
        self.current = DominantDetection::None;
        self.overlay.clear();
    }

    /// Latest dominant detection, carried across skipped frames.
    pub fn current(&self) -> &DominantDetection {
        &self.current
    }

    /// Target-class boxes from the latest classified frame.
    pub fn overlay(&self) -> &[OverlayBox] {
        &self.overlay
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn classified(&self) -> u64 {
        self.classified
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use ml_core::{BoundingBox, Detection, DetectionSet};
    use video_ingest::FrameFormat;

    use super::*;

    fn frame(sequence: u64) -> Frame {
        Frame {
            data: vec![0; 12],
            width: 2,
            height: 2,
            format: FrameFormat::Bgr8,
            sequence,
            timestamp_ms: 0,
            captured_at: Instant::now(),
        }
    }

    fn fire(w: i32, h: i32, confidence: f32) -> Detection {
        Detection::new(BoundingBox::new(0, 0, w, h), confidence, "fire")
    }

    fn counting_classifier(calls: Arc<AtomicUsize>) -> Box<dyn Classifier> {
        Box::new(
            move |_frame: &Frame, _threshold: f32| -> Result<DetectionSet, ClassifierError> {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![fire(10, 10, 0.8)])
            },
        )
    }

    #[test]
    fn classifies_every_kth_frame() {
        let calls = Arc::new(AtomicUsize::new(0));
        let faults = Arc::new(FaultCounters::new());
        let mut gate =
            InferenceGate::new(Some(counting_classifier(calls.clone())), 3, 0.5, "fire", faults);

        let decisions: Vec<_> = (1..=6).map(|seq| gate.process(&frame(seq))).collect();

        assert_eq!(
            decisions,
            vec![
                GateDecision::Skipped,
                GateDecision::Skipped,
                GateDecision::Classified,
                GateDecision::Skipped,
                GateDecision::Skipped,
                GateDecision::Classified,
            ]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(gate.frames_seen(), 6);
        assert_eq!(gate.classified(), 2);
    }

    #[test]
    fn skip_factor_one_classifies_everything() {
        let calls = Arc::new(AtomicUsize::new(0));
        let faults = Arc::new(FaultCounters::new());
        let mut gate =
            InferenceGate::new(Some(counting_classifier(calls.clone())), 1, 0.5, "fire", faults);
        for seq in 1..=4 {
            assert_eq!(gate.process(&frame(seq)), GateDecision::Classified);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn previous_result_survives_skipped_frames() {
        let calls = Arc::new(AtomicUsize::new(0));
        let faults = Arc::new(FaultCounters::new());
        let mut gate = InferenceGate::new(Some(counting_classifier(calls)), 2, 0.5, "fire", faults);

        gate.process(&frame(1));
        assert!(!gate.current().is_found());
        gate.process(&frame(2));
        assert_eq!(gate.current().area(), 100);
        assert_eq!(gate.process(&frame(3)), GateDecision::Skipped);
        assert_eq!(gate.current().area(), 100);
    }

    #[test]
    fn errors_and_panics_mean_no_detection() {
        let script = Mutex::new(0u32);
        let classifier = move |_frame: &Frame,
                               _threshold: f32|
              -> Result<DetectionSet, ClassifierError> {
            let mut call = script.lock().expect("lock");
            *call += 1;
            match *call {
                1 => Ok(vec![fire(50, 50, 0.9)]),
                2 => Err(ClassifierError::OutputShape(vec![1, 2])),
                3 => Ok(vec![fire(50, 50, 0.9)]),
                _ => panic!("model exploded"),
            }
        };
        let faults = Arc::new(FaultCounters::new());
        let mut gate =
            InferenceGate::new(Some(Box::new(classifier)), 1, 0.5, "fire", faults.clone());

        assert_eq!(gate.process(&frame(1)), GateDecision::Classified);
        assert!(gate.current().is_found());
        assert_eq!(gate.process(&frame(2)), GateDecision::Failed);
        assert!(!gate.current().is_found());
        assert!(gate.overlay().is_empty());

        assert_eq!(gate.process(&frame(3)), GateDecision::Classified);
        assert_eq!(gate.process(&frame(4)), GateDecision::Failed);
        assert!(!gate.current().is_found());
        assert_eq!(faults.count(FaultKind::Classifier), 2);
    }

    #[test]
    fn missing_classifier_disables_detection() {
        let faults = Arc::new(FaultCounters::new());
        let mut gate = InferenceGate::new(None, 1, 0.5, "fire", faults);
        assert!(!gate.is_enabled());
        assert_eq!(gate.process(&frame(1)), GateDecision::Disabled);
        assert_eq!(*gate.current(), DominantDetection::None);
    }

    #[test]
    fn overlay_keeps_only_target_class() {
        let classifier = |_frame: &Frame,
                          _threshold: f32|
         -> Result<DetectionSet, ClassifierError> {
            Ok(vec![
                fire(40, 50, 0.7),
                Detection::new(BoundingBox::new(0, 0, 300, 300), 0.99, "smoke"),
                fire(90, 100, 0.9),
            ])
        };
        let faults = Arc::new(FaultCounters::new());
        let mut gate = InferenceGate::new(Some(Box::new(classifier)), 1, 0.5, "FIRE", faults);

        gate.process(&frame(1));

        let areas: Vec<u64> = gate.overlay().iter().map(|b| b.area).collect();
        assert_eq!(areas, vec![2_000, 9_000]);
        assert_eq!(gate.current().area(), 9_000);
        assert_eq!(gate.current().severity(), Some(Severity::Medium));
    }
}
