//! Reduction of a frame's detections to the single result that drives
//! actuation and the overlay.

use std::fmt;

use crate::detection::{Detection, DetectionSet};

/// Outcome of aggregating one frame.
///
/// `None` means no target-class detection at all. It is not the same as a
/// `Found` detection whose box happens to have zero area.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DominantDetection {
    #[default]
    None,
    Found(Detection),
}

impl DominantDetection {
    pub fn is_found(&self) -> bool {
        matches!(self, DominantDetection::Found(_))
    }

    pub fn detection(&self) -> Option<&Detection> {
        match self {
            DominantDetection::Found(detection) => Some(detection),
            DominantDetection::None => None,
        }
    }

    /// Area to report downstream; 0 when nothing was found.
    pub fn area(&self) -> u64 {
        self.detection().map_or(0, |d| d.area)
    }

    /// Confidence to report downstream; 0 when nothing was found.
    pub fn confidence(&self) -> f32 {
        self.detection().map_or(0.0, |d| d.confidence)
    }

    pub fn severity(&self) -> Option<Severity> {
        self.detection().map(|d| Severity::from_area(d.area))
    }
}

/// Detections matching `target_label`, case-insensitively, in input order.
pub fn target_detections<'a>(
    detections: &'a DetectionSet,
    target_label: &'a str,
) -> impl Iterator<Item = &'a Detection> + 'a {
    detections.iter().filter(move |d| d.is_label(target_label))
}

/// Largest-area detection of the target class. On equal areas the first one
/// encountered wins.
pub fn dominant(detections: &DetectionSet, target_label: &str) -> DominantDetection {
    let mut best: Option<&Detection> = None;
    for candidate in target_detections(detections, target_label) {
        match best {
            Some(current) if candidate.area <= current.area => {}
            _ => best = Some(candidate),
        }
    }
    best.cloned()
        .map_or(DominantDetection::None, DominantDetection::Found)
}

/// Cosmetic size bucket for overlay labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Tiny,
    Small,
    Medium,
    Large,
}

impl Severity {
    pub fn from_area(area: u64) -> Self {
        if area > 15_000 {
            Severity::Large
        } else if area > 5_000 {
            Severity::Medium
        } else if area > 1_000 {
            Severity::Small
        } else {
            Severity::Tiny
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Severity::Tiny => "TINY",
            Severity::Small => "SMALL",
            Severity::Medium => "MEDIUM",
            Severity::Large => "LARGE",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
