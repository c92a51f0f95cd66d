#![cfg(feature = "backend-tract")]

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectError, DetectorBackend};
use crate::detect::result::{BoundingBox, ClassNames, DetectedBox, Detection};

const NMS_IOU_THRESHOLD: f32 = 0.45;

/// Tract-based backend for YOLO-style ONNX detectors.
///
/// Expects a single output shaped `[1, 4 + classes, anchors]` with
/// `(cx, cy, w, h)` in model-input pixels followed by per-class scores.
/// Frames are stretched to the model input; boxes are scaled back and clamped
/// to the source image.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    confidence_threshold: f32,
    names: Arc<ClassNames>,
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    cx: f32,
    cy: f32,
    w: f32,
    h: f32,
    score: f32,
    class_id: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for square `input_size` inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32, names: ClassNames) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            confidence_threshold: 0.25,
            names: Arc::new(names),
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let side = self.input_size;
        let resized = image::imageops::resize(image, side, side, FilterType::Triangle);
        let side = side as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        input.into_tensor()
    }

    fn decode(&self, outputs: TVec<TValue>) -> Result<Vec<Candidate>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            return Err(anyhow!("unexpected detector output shape {:?}", shape));
        }
        let classes = shape[1] - 4;
        let anchors = shape[2];

        let mut candidates = Vec::new();
        for i in 0..anchors {
            let mut best = (0u32, f32::NEG_INFINITY);
            for c in 0..classes {
                let score = view[[0, 4 + c, i]];
                if score > best.1 {
                    best = (c as u32, score);
                }
            }
            if best.1 < self.confidence_threshold {
                continue;
            }
            candidates.push(Candidate {
                cx: view[[0, 0, i]],
                cy: view[[0, 1, i]],
                w: view[[0, 2, i]],
                h: view[[0, 3, i]],
                score: best.1,
                class_id: best.0,
            });
        }
        Ok(non_max_suppression(candidates, NMS_IOU_THRESHOLD))
    }

    fn to_boxes(&self, candidates: Vec<Candidate>, width: u32, height: u32) -> Vec<DetectedBox> {
        let sx = width as f32 / self.input_size as f32;
        let sy = height as f32 / self.input_size as f32;
        let clamp = |v: f32, max: u32| v.round().clamp(0.0, max as f32) as u32;
        candidates
            .into_iter()
            .filter_map(|c| {
                let x1 = clamp((c.cx - c.w / 2.0) * sx, width);
                let y1 = clamp((c.cy - c.h / 2.0) * sy, height);
                let x2 = clamp((c.cx + c.w / 2.0) * sx, width);
                let y2 = clamp((c.cy + c.h / 2.0) * sy, height);
                let bbox = BoundingBox::new(x1, y1, x2, y2).ok()?;
                Some(DetectedBox {
                    bbox,
                    class_id: c.class_id,
                    score: c.score,
                })
            })
            .collect()
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Detection, DetectError> {
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| DetectError::Inference(e.to_string()))?;
        let candidates = self.decode(outputs)?;
        let boxes = self.to_boxes(candidates, image.width(), image.height());
        Ok(Detection::new(boxes, self.names.clone()))
    }

    fn warm_up(&mut self) -> Result<(), DetectError> {
        let blank = RgbImage::new(self.input_size, self.input_size);
        self.detect(&blank).map(|_| ())
    }
}

/// Greedy per-class NMS; survivors are ordered by descending score.
fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::new();
    for cand in candidates {
        let overlaps = kept
            .iter()
            .any(|k| k.class_id == cand.class_id && iou(k, &cand) > iou_threshold);
        if !overlaps {
            kept.push(cand);
        }
    }
    kept
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let ix = ((a.cx + a.w / 2.0).min(b.cx + b.w / 2.0) - (a.cx - a.w / 2.0).max(b.cx - b.w / 2.0))
        .max(0.0);
    let iy = ((a.cy + a.h / 2.0).min(b.cy + b.h / 2.0) - (a.cy - a.h / 2.0).max(b.cy - b.h / 2.0))
        .max(0.0);
    let inter = ix * iy;
    let union = a.w * a.h + b.w * b.h - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(cx: f32, score: f32, class_id: u32) -> Candidate {
        Candidate {
            cx,
            cy: 50.0,
            w: 20.0,
            h: 20.0,
            score,
            class_id,
        }
    }

    #[test]
    fn nms_drops_overlapping_boxes_of_same_class() {
        let kept = non_max_suppression(
            vec![cand(50.0, 0.6, 0), cand(52.0, 0.9, 0), cand(52.0, 0.5, 1), cand(200.0, 0.4, 0)],
            0.45,
        );
        let scores: Vec<f32> = kept.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![0.9, 0.5, 0.4]);
    }
}
