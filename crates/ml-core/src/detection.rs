use serde::Serialize;

/// Axis-aligned box in frame pixel coordinates (x1, y1) top-left, (x2, y2)
/// bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i64 {
        (self.x2 as i64 - self.x1 as i64).max(0)
    }

    pub fn height(&self) -> i64 {
        (self.y2 as i64 - self.y1 as i64).max(0)
    }

    /// Pixel area; degenerate boxes have area 0.
    pub fn area(&self) -> u64 {
        (self.width() * self.height()) as u64
    }

    /// Intersection over union.
    pub fn iou(&self, other: &Self) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        let intersection = BoundingBox::new(x1, y1, x2, y2).area() as f64;
        let union = self.area() as f64 + other.area() as f64 - intersection;
        if union <= 0.0 {
            0.0
        } else {
            (intersection / union) as f32
        }
    }
}

/// Single labelled detection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Derived from `bbox`; kept alongside so consumers never recompute it
    /// differently.
    pub area: u64,
    pub confidence: f32,
    pub label: String,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32, label: impl Into<String>) -> Self {
        Self {
            area: bbox.area(),
            bbox,
            confidence: confidence.clamp(0.0, 1.0),
            label: label.into(),
        }
    }

    pub fn is_label(&self, label: &str) -> bool {
        self.label.eq_ignore_ascii_case(label)
    }
}

/// Detections for one classified frame, in classifier order.
pub type DetectionSet = Vec<Detection>;

/// Greedy non-maximum suppression: keep the highest-confidence box, drop
/// every remaining box overlapping it by `iou_threshold` or more, repeat.
pub fn non_maximum_suppression(mut detections: DetectionSet, iou_threshold: f32) -> DetectionSet {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: DetectionSet = Vec::with_capacity(detections.len());
    for candidate in detections {
        let overlaps = kept.iter().any(|k| {
            k.label == candidate.label && k.bbox.iou(&candidate.bbox) >= iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}
