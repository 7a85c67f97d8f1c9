use std::{convert::TryFrom, path::Path};

use anyhow::anyhow;
use image::{RgbImage, imageops::FilterType};
use tch::{self, Device, Kind, Tensor};
use video_ingest::{Frame, FrameFormat};

use crate::{
    classifier::{Classifier, ClassifierError},
    detection::{BoundingBox, Detection, DetectionSet, non_maximum_suppression},
};

const NMS_IOU_THRESHOLD: f32 = 0.45;
const MAX_DETECTIONS: usize = 300;

/// TorchScript-exported YOLO detector.
///
/// Expects a single output of shape `[1, 4 + classes, predictions]` where
/// each prediction is `(cx, cy, w, h, class scores...)` in input pixels.
pub struct Detector {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    labels: Vec<String>,
}

impl Detector {
    /// Load a TorchScript module onto `device`.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: (i64, i64),
        labels: Vec<String>,
    ) -> anyhow::Result<Self> {
        if labels.is_empty() {
            anyhow::bail!("detector needs at least one class label");
        }
        let mut module = tch::CModule::load_on_device(model_path, device)?;
        module.set_eval();
        Ok(Self {
            module,
            device,
            input_size,
            labels,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Converts a BGR frame into a normalised `[1, 3, H, W]` tensor at the
    /// detector input size.
    fn frame_to_tensor(&self, frame: &Frame) -> Result<Tensor, ClassifierError> {
        let FrameFormat::Bgr8 = frame.format;
        let expected = (frame.width.max(0) as usize) * (frame.height.max(0) as usize) * 3;
        if frame.data.len() != expected {
            return Err(ClassifierError::FrameSize {
                got: frame.data.len(),
                expected,
            });
        }

        let mut rgb = Vec::with_capacity(expected);
        for px in frame.data.chunks_exact(3) {
            rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
        let image = RgbImage::from_raw(frame.width as u32, frame.height as u32, rgb)
            .ok_or_else(|| anyhow!("failed to wrap frame as an RGB image"))?;

        let (in_w, in_h) = self.input_size;
        let resized = if (frame.width as i64, frame.height as i64) == (in_w, in_h) {
            image
        } else {
            image::imageops::resize(&image, in_w as u32, in_h as u32, FilterType::Triangle)
        };

        let tensor = Tensor::from_slice(resized.as_raw())
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, in_h, in_w, 3])
            .permute([0, 3, 1, 2])
            / 255.0;
        Ok(tensor)
    }
}

impl Classifier for Detector {
    fn classify(
        &mut self,
        frame: &Frame,
        confidence_threshold: f32,
    ) -> Result<DetectionSet, ClassifierError> {
        let input = self.frame_to_tensor(frame)?;
        let output = tch::no_grad(|| self.module.forward_ts(&[input]))
            .map_err(|e| ClassifierError::Other(e.into()))?;

        let shape = output.size();
        let classes = self.labels.len() as i64;
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 4 + classes {
            return Err(ClassifierError::OutputShape(shape));
        }

        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> =
            Vec::<Vec<f32>>::try_from(&preds).map_err(|e| ClassifierError::Other(e.into()))?;

        let (in_w, in_h) = self.input_size;
        let scale_x = frame.width as f32 / in_w as f32;
        let scale_y = frame.height as f32 / in_h as f32;

        let mut detections = Vec::new();
        for row in rows {
            let Some((class_id, score)) = row[4..4 + classes as usize]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            if score < confidence_threshold {
                continue;
            }
            let (cx, cy) = (row[0] * scale_x, row[1] * scale_y);
            let (w, h) = (row[2] * scale_x, row[3] * scale_y);
            let bbox = BoundingBox::new(
                (cx - w / 2.0) as i32,
                (cy - h / 2.0) as i32,
                (cx + w / 2.0) as i32,
                (cy + h / 2.0) as i32,
            );
            detections.push(Detection::new(bbox, score, self.labels[class_id].clone()));
        }

        let mut kept = non_maximum_suppression(detections, NMS_IOU_THRESHOLD);
        kept.truncate(MAX_DETECTIONS);
        Ok(kept)
    }
}
