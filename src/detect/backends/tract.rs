#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{Context, Result};
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectError;
use crate::detect::result::DetectedObject;
use crate::BoundingBox;

use super::objects::ObjectModel;

const SCORE_THRESHOLD: f32 = 0.25;
const BOX_FIELDS: usize = 4;

/// COCO class ids the surface classifier cares about.
const COCO_LABELS: &[(usize, &str)] = &[
    (13, "bench"),
    (39, "bottle"),
    (41, "cup"),
    (56, "chair"),
    (58, "potted plant"),
    (60, "dining table"),
    (62, "tv"),
    (63, "laptop"),
    (64, "mouse"),
    (66, "keyboard"),
    (67, "cell phone"),
    (73, "book"),
];

/// Local YOLOv8-style ONNX detector run through tract.
///
/// Expects input `[1, 3, N, N]` (RGB, 0..1) and output `[1, 4 + classes, K]`
/// with centre-format boxes in input pixels. No network I/O.
pub struct TractObjectModel {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
}

impl TractObjectModel {
    pub fn load(model_path: &Path, input_size: u32) -> Result<Self> {
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        Ok(Self { model, input_size })
    }

    fn build_input(&self, path: &Path) -> Result<Tensor, DetectError> {
        let size = self.input_size;
        let rgb = image::open(path)
            .map_err(|e| DetectError::Image(format!("{}: {}", path.display(), e)))?
            .resize_exact(size, size, FilterType::Triangle)
            .to_rgb8();
        let size = size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            rgb.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }
}

/// Decode a `[1, 4 + classes, K]` prediction tensor.
fn decode_predictions(
    output: &tract_ndarray::ArrayViewD<'_, f32>,
    input_size: f32,
) -> Result<Vec<DetectedObject>, DetectError> {
    let shape = output.shape();
    if shape.len() != 3 || shape[1] <= BOX_FIELDS {
        return Err(DetectError::Model(format!("unexpected output shape {:?}", shape)));
    }
    let (rows, anchors) = (shape[1], shape[2]);
    let mut objects = Vec::new();
    for anchor in 0..anchors {
        let mut best: Option<(usize, f32)> = None;
        for class in 0..rows - BOX_FIELDS {
            let score = output[[0, BOX_FIELDS + class, anchor]];
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((class, score));
            }
        }
        let Some((class, score)) = best else { continue };
        if score < SCORE_THRESHOLD {
            continue;
        }
        let Some(label) = COCO_LABELS
            .iter()
            .find(|(id, _)| *id == class)
            .map(|(_, label)| *label)
        else {
            continue;
        };
        let cx = output[[0, 0, anchor]];
        let cy = output[[0, 1, anchor]];
        let w = output[[0, 2, anchor]];
        let h = output[[0, 3, anchor]];
        let bbox = BoundingBox::new(
            (cx - w / 2.0) / input_size,
            (cy - h / 2.0) / input_size,
            w / input_size,
            h / input_size,
        );
        objects.push(DetectedObject::new(label, score, bbox));
    }
    Ok(objects)
}

impl ObjectModel for TractObjectModel {
    fn detect_objects(&mut self, frame: &Path) -> Result<Vec<DetectedObject>, DetectError> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| DetectError::Model(format!("ONNX inference failed: {}", e)))?;
        let output = outputs
            .first()
            .ok_or_else(|| DetectError::Model("model produced no outputs".to_string()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| DetectError::Model(format!("output tensor was not f32: {}", e)))?;
        decode_predictions(&view, self.input_size as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_classes_above_threshold() {
        // 2 anchors, 80 classes.
        let mut raw = tract_ndarray::Array3::<f32>::zeros((1, 84, 2));
        // Anchor 0: laptop centred at (320, 320), 128x64.
        raw[[0, 0, 0]] = 320.0;
        raw[[0, 1, 0]] = 320.0;
        raw[[0, 2, 0]] = 128.0;
        raw[[0, 3, 0]] = 64.0;
        raw[[0, 4 + 63, 0]] = 0.9;
        // Anchor 1: person (not mapped).
        raw[[0, 4, 1]] = 0.95;
        let view = raw.into_dyn();
        let objects = decode_predictions(&view.view(), 640.0).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].label, "laptop");
        assert!((objects[0].bounding_box.x - 0.4).abs() < 1e-6);
        assert!((objects[0].bounding_box.width - 0.2).abs() < 1e-6);
    }
}
