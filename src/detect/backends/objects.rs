use std::path::Path;

use crate::detect::backend::{DetectError, FrameDetector, FrameInput};
use crate::detect::result::DetectedObject;
use crate::{BoundingBox, DetectedSurface};

/// General-purpose object detector producing labelled boxes.
pub trait ObjectModel: Send {
    fn detect_objects(&mut self, frame: &Path) -> Result<Vec<DetectedObject>, DetectError>;
}

/// Classes that are surfaces themselves.
const DIRECT_CLASSES: &[(&str, &str, f32)] = &[
    ("dining table", "Table", 0.35),
    ("desk", "Desk", 0.35),
    ("bench", "Bench", 0.45),
];

/// Classes that hint at a surface nearby. The flag marks objects that usually
/// sit on a desk.
const SURROUNDING_CLASSES: &[(&str, f32, bool)] = &[
    ("laptop", 0.40, true),
    ("keyboard", 0.40, true),
    ("mouse", 0.40, true),
    ("monitor", 0.40, true),
    ("tv", 0.45, true),
    ("book", 0.40, true),
    ("cup", 0.40, false),
    ("bottle", 0.40, false),
    ("cell phone", 0.40, false),
    ("potted plant", 0.40, false),
];

const SYNTHETIC_DESK_CONFIDENCE: f32 = 0.45;
const SYNTHETIC_DESK_BOX: (f32, f32, f32, f32) = (0.1, 0.55, 0.8, 0.35);

/// Object-classifier strategy.
///
/// A directly detected surface class wins (best score only). Without one, a
/// desk-implying object in view yields a single synthetic desk in the lower
/// part of the frame, marked inferred.
pub struct ObjectClassifierBackend<M> {
    model: M,
}

impl<M: ObjectModel> ObjectClassifierBackend<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }
}

fn surrounding(object: &DetectedObject) -> Option<bool> {
    SURROUNDING_CLASSES
        .iter()
        .find(|(label, min, _)| object.label == *label && object.score >= *min)
        .map(|(_, _, implies_desk)| *implies_desk)
}

/// Map raw objects to at most one surface.
pub fn classify_objects(
    objects: &[DetectedObject],
    frame: &FrameInput<'_>,
) -> Option<DetectedSurface> {
    let direct = objects
        .iter()
        .filter_map(|object| {
            DIRECT_CLASSES
                .iter()
                .find(|(label, _, min)| object.label == *label && object.score >= *min)
                .map(|(_, surface_type, _)| (object, *surface_type))
        })
        .max_by(|(a, _), (b, _)| a.score.total_cmp(&b.score));

    if let Some((object, surface_type)) = direct {
        return Some(
            DetectedSurface::new(
                frame.video_id,
                frame.timestamp_secs,
                surface_type,
                object.score,
                object.bounding_box,
            )
            .with_scene_context(format!("objects:{}", object.label)),
        );
    }

    let context: Vec<&str> = objects
        .iter()
        .filter(|object| surrounding(object).is_some())
        .map(|object| object.label.as_str())
        .collect();
    let implies_desk = objects.iter().any(|object| surrounding(object) == Some(true));
    if !implies_desk {
        return None;
    }

    let (x, y, w, h) = SYNTHETIC_DESK_BOX;
    Some(
        DetectedSurface::new(
            frame.video_id,
            frame.timestamp_secs,
            "Desk",
            SYNTHETIC_DESK_CONFIDENCE,
            BoundingBox::new(x, y, w, h),
        )
        .inferred()
        .with_scene_context(format!("objects:{}", context.join(","))),
    )
}

impl<M: ObjectModel> FrameDetector for ObjectClassifierBackend<M> {
    fn name(&self) -> &'static str {
        "objects"
    }

    fn detect(&mut self, frame: &FrameInput<'_>) -> Result<Vec<DetectedSurface>, DetectError> {
        let objects = self.model.detect_objects(frame.path)?;
        Ok(classify_objects(&objects, frame).into_iter().collect())
    }
}
