use crate::BoundingBox;

/// A labelled object from a general-purpose object detector.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectedObject {
    /// Lower-case class label (`laptop`, `dining table`, ...).
    pub label: String,
    pub score: f32,
    pub bounding_box: BoundingBox,
}

impl DetectedObject {
    pub fn new(label: &str, score: f32, bounding_box: BoundingBox) -> Self {
        Self {
            label: label.to_lowercase(),
            score,
            bounding_box,
        }
    }
}
