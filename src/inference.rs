//! Contextual inference.
//!
//! Some detections are objects that rest on a surface rather than the surface
//! itself. When a frame shows a laptop but no desk, the desk is implied: a
//! surface of the implied type is synthesized directly beneath the object and
//! marked `is_inferred`. Genuine detections are never replaced.

use crate::{BoundingBox, DetectedSurface};

/// Height of a synthesized surface, as a fraction of the frame.
const INFERRED_HEIGHT: f32 = 0.20;
/// Inferred surfaces are wider than the object resting on them.
const INFERRED_WIDTH_SCALE: f32 = 1.5;
/// Lowest top edge for a synthesized surface.
const MAX_INFERRED_Y: f32 = 0.95;

/// `trigger` detected without `implied` => synthesize `implied` at `confidence`.
#[derive(Clone, Debug, PartialEq)]
pub struct ImplicationRule {
    pub trigger: String,
    pub implied: String,
    pub confidence: f32,
}

impl ImplicationRule {
    pub fn new(trigger: &str, implied: &str, confidence: f32) -> Self {
        Self {
            trigger: trigger.to_string(),
            implied: implied.to_string(),
            confidence: crate::clamp_confidence(confidence),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ContextualInference {
    rules: Vec<ImplicationRule>,
}

impl Default for ContextualInference {
    fn default() -> Self {
        Self::new(vec![
            ImplicationRule::new("Laptop", "Desk", 0.75),
            ImplicationRule::new("Keyboard", "Desk", 0.70),
            ImplicationRule::new("Monitor", "Desk", 0.70),
            ImplicationRule::new("Mouse", "Desk", 0.60),
            ImplicationRule::new("Book", "Table", 0.55),
            ImplicationRule::new("Cup", "Table", 0.55),
        ])
    }
}

impl ContextualInference {
    pub fn new(rules: Vec<ImplicationRule>) -> Self {
        Self { rules }
    }

    /// No rules; `apply` is a no-op.
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    /// Add implied surfaces to one frame's detections. At most one surface is
    /// synthesized per implied type, from the first triggering detection.
    /// Returns how many were added.
    pub fn apply(&self, surfaces: &mut Vec<DetectedSurface>) -> usize {
        let mut added = Vec::new();
        for rule in &self.rules {
            let implied_present = surfaces
                .iter()
                .chain(added.iter())
                .any(|s: &DetectedSurface| s.is_type(&rule.implied));
            if implied_present {
                continue;
            }
            let Some(trigger) = surfaces
                .iter()
                .find(|s| !s.is_inferred && s.is_type(&rule.trigger))
            else {
                continue;
            };
            let surface = DetectedSurface::new(
                &trigger.video_id,
                trigger.timestamp_secs,
                &rule.implied,
                rule.confidence,
                beneath(&trigger.bounding_box),
            )
            .inferred()
            .with_scene_context(format!("inferred_from:{}", trigger.surface_type));
            added.push(surface);
        }
        let count = added.len();
        surfaces.extend(added);
        count
    }
}

/// A box starting at the object's bottom edge, wider than the object and
/// centred under it.
fn beneath(object: &BoundingBox) -> BoundingBox {
    let y = object.bottom().min(MAX_INFERRED_Y);
    let height = INFERRED_HEIGHT.min(1.0 - y);
    let width = (object.width * INFERRED_WIDTH_SCALE).min(1.0);
    let centre = object.x + object.width / 2.0;
    let x = (centre - width / 2.0).clamp(0.0, 1.0 - width);
    BoundingBox::new(x, y, width, height)
}
