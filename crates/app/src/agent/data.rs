use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use ml_core::{BoundingBox, DominantDetection, Severity};
use serde::Serialize;
use video_ingest::Frame;

/// Command sent to the actuator.
#[derive(Clone, Debug, PartialEq)]
pub struct ActuationCommand {
    pub area: u64,
    /// Rounded to two decimals.
    pub confidence: f32,
    pub enqueued_at: Instant,
}

impl ActuationCommand {
    pub fn new(area: u64, confidence: f32) -> Self {
        Self {
            area,
            confidence: round2(confidence.max(0.0)),
            enqueued_at: Instant::now(),
        }
    }

    /// "All clear": returns the actuator to its inactive state.
    pub fn zero() -> Self {
        Self::new(0, 0.0)
    }

    pub fn is_zero(&self) -> bool {
        self.area == 0
    }
}

pub(crate) fn round2(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}

/// Box drawn on a streamed frame.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayBox {
    pub bbox: BoundingBox,
    pub area: u64,
    pub confidence: f32,
    pub severity: Severity,
}

/// Everything the stream worker needs to render one frame.
#[derive(Clone, Debug)]
pub struct StreamJob {
    pub frame: Frame,
    pub boxes: Vec<OverlayBox>,
    pub dominant: DominantDetection,
    pub fps: f32,
}

/// Encoded frame ready for the control channel.
#[derive(Clone, Debug)]
pub struct StreamPayload {
    /// Base64 JPEG.
    pub frame: String,
    pub timestamp_ms: i64,
}

/// Value of `camera-status.status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Connected,
    Active,
    Inactive,
    Disconnected,
}

impl CameraStatus {
    pub fn for_enabled(enabled: bool) -> Self {
        if enabled {
            CameraStatus::Active
        } else {
            CameraStatus::Inactive
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CameraStatusEvent {
    pub status: CameraStatus,
    pub enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FireDetectionEvent {
    pub area: u64,
    pub confidence: f32,
    pub detected: bool,
}

impl From<&DominantDetection> for FireDetectionEvent {
    fn from(dominant: &DominantDetection) -> Self {
        Self {
            area: dominant.area(),
            confidence: dominant.confidence(),
            detected: dominant.is_found(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VideoFrameEvent {
    pub frame: String,
}

/// Rolling window of recent capture instants.
#[derive(Clone, Debug)]
pub struct FpsWindow {
    stamps: VecDeque<Instant>,
    capacity: usize,
}

impl FpsWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            stamps: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, at: Instant) {
        if self.stamps.len() == self.capacity {
            self.stamps.pop_front();
        }
        self.stamps.push_back(at);
    }

    /// (count - 1) / (newest - oldest); 0 with fewer than two samples.
    pub fn fps(&self) -> f32 {
        let (Some(oldest), Some(newest)) = (self.stamps.front(), self.stamps.back()) else {
            return 0.0;
        };
        if self.stamps.len() < 2 {
            return 0.0;
        }
        let span = newest.duration_since(*oldest).as_secs_f32();
        if span <= 0.0 {
            return 0.0;
        }
        (self.stamps.len() - 1) as f32 / span
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }
}

/// Minimum-interval gate for producer-side throttling.
#[derive(Clone, Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True (and arms the timer) when at least `interval` has passed since
    /// the last accepted call.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_rounded_to_two_decimals() {
        assert_eq!(ActuationCommand::new(10, 0.876).confidence, 0.88);
        assert_eq!(ActuationCommand::new(10, 0.9).confidence, 0.9);
        assert!(ActuationCommand::zero().is_zero());
    }

    #[test]
    fn fps_needs_two_samples() {
        let mut window = FpsWindow::new(30);
        assert_eq!(window.fps(), 0.0);
        window.push(Instant::now());
        assert_eq!(window.fps(), 0.0);
    }

    #[test]
    fn fps_over_window() {
        let start = Instant::now();
        let mut window = FpsWindow::new(3);
        for i in 0..5u64 {
            window.push(start + Duration::from_millis(100 * i));
        }

        assert_eq!(window.len(), 3);
        let fps = window.fps();
        assert!((fps - 10.0).abs() < 0.01, "fps was {fps}");
    }

    #[test]
    fn throttle_spaces_calls() {
        let start = Instant::now();
        let mut throttle = Throttle::new(Duration::from_secs(1));

        assert!(throttle.ready(start));
        assert!(!throttle.ready(start + Duration::from_millis(999)));
        assert!(throttle.ready(start + Duration::from_secs(1)));
        assert!(!throttle.ready(start + Duration::from_millis(1500)));
    }

    #[test]
    fn status_events_serialise_like_the_dashboard_expects() {
        let event = CameraStatusEvent {
            status: CameraStatus::for_enabled(true),
            enabled: true,
        };
        assert_eq!(
            serde_json::to_value(&event).expect("json"),
            serde_json::json!({"status": "active", "enabled": true})
        );

        let none = FireDetectionEvent::from(&DominantDetection::None);
        assert_eq!(
            serde_json::to_value(&none).expect("json"),
            serde_json::json!({"area": 0, "confidence": 0.0, "detected": false})
        );
    }
}
