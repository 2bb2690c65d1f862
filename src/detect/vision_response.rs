//! Vision model request/response contract.
//!
//! The model is asked to answer with exactly this JSON shape:
//!
//! ```json
//! {
//!   "surfaces_found": true,
//!   "frame_description": "home office, desk in foreground",
//!   "surfaces": [
//!     {"location": {"x": 10, "y": 60, "width": 80, "height": 30},
//!      "surface_type": "Desk", "confidence": 0.8, "reasoning": "..."}
//!   ],
//!   "recommended_placement": null,
//!   "no_surface_reason": null
//! }
//! ```
//!
//! Locations are 0..100 percentages. Parsing is deliberately lenient: Markdown
//! fences are stripped, entries missing numeric fields are dropped, and
//! `surfaces_found = false` means "no detections" rather than an error.

use serde::Deserialize;
use serde_json::Value;

use super::backend::DetectError;
use crate::{BoundingBox, DetectedSurface};

/// Fixed instruction sent with every frame.
pub const SURFACE_PROMPT: &str = "You are analyzing a single frame from a video to find \
flat, open areas where a product could be virtually placed: desks, tables, counters, \
shelves, walls, monitors and similar surfaces. Only report areas that are clearly visible \
and unobstructed. Respond with JSON only, no prose, using exactly this shape: \
{\"surfaces_found\": boolean, \"frame_description\": string, \"surfaces\": [{\"location\": \
{\"x\": number, \"y\": number, \"width\": number, \"height\": number}, \"surface_type\": \
string, \"confidence\": number, \"reasoning\": string}], \"recommended_placement\": object \
or null, \"no_surface_reason\": string (only when surfaces_found is false)}. Location values \
are percentages (0-100) of the frame width and height measured from the top-left corner. \
Confidence is between 0 and 1.";

const DEFAULT_SURFACE_TYPE: &str = "Surface";
const MAX_DESCRIPTION_CHARS: usize = 240;

#[derive(Debug, Deserialize)]
struct RawVisionResponse {
    #[serde(default)]
    surfaces_found: bool,
    #[serde(default)]
    frame_description: Option<String>,
    #[serde(default)]
    surfaces: Vec<Value>,
    #[serde(default)]
    recommended_placement: Option<Value>,
    #[serde(default)]
    no_surface_reason: Option<String>,
}

/// One usable surface entry from the model.
#[derive(Clone, Debug, PartialEq)]
pub struct VisionSurface {
    pub surface_type: String,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
    pub reasoning: Option<String>,
}

/// Parsed model answer for one frame.
#[derive(Clone, Debug, Default)]
pub struct VisionReport {
    pub surfaces_found: bool,
    pub frame_description: Option<String>,
    pub surfaces: Vec<VisionSurface>,
    pub recommended_placement: Option<Value>,
    pub no_surface_reason: Option<String>,
    /// Entries dropped for missing or non-numeric fields.
    pub discarded: usize,
}

impl VisionReport {
    /// Convert to surfaces for one frame. `surfaces_found = false` yields none.
    pub fn into_surfaces(self, video_id: &str, timestamp_secs: f64) -> Vec<DetectedSurface> {
        if !self.surfaces_found {
            return Vec::new();
        }
        let context = self
            .frame_description
            .map(|d| d.chars().take(MAX_DESCRIPTION_CHARS).collect::<String>());
        self.surfaces
            .into_iter()
            .map(|s| {
                let surface = DetectedSurface::new(
                    video_id,
                    timestamp_secs,
                    &s.surface_type,
                    s.confidence,
                    s.bounding_box,
                );
                match &context {
                    Some(ctx) => surface.with_scene_context(ctx.clone()),
                    None => surface,
                }
            })
            .collect()
    }
}

/// Remove Markdown code-fence wrapping and any prose around the JSON object.
pub fn strip_code_fences(text: &str) -> &str {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("```") {
        // Drop the info string (`json`, `JSON`, ...) on the opening fence line.
        body = match rest.find('\n') {
            Some(newline) => &rest[newline + 1..],
            None => rest,
        };
        body = body.trim_end();
        if let Some(inner) = body.strip_suffix("```") {
            body = inner;
        }
        body = body.trim();
    }
    if !body.starts_with('{') {
        if let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) {
            if start < end {
                body = &body[start..=end];
            }
        }
    }
    body
}

/// Parse the model's text answer.
pub fn parse_vision_report(text: &str) -> Result<VisionReport, DetectError> {
    let body = strip_code_fences(text);
    if body.is_empty() {
        return Err(DetectError::Malformed("empty response".to_string()));
    }
    let raw: RawVisionResponse = serde_json::from_str(body)
        .map_err(|e| DetectError::Malformed(format!("invalid surface JSON: {}", e)))?;

    let total = raw.surfaces.len();
    let surfaces: Vec<VisionSurface> = raw.surfaces.iter().filter_map(parse_surface).collect();
    let discarded = total - surfaces.len();

    Ok(VisionReport {
        surfaces_found: raw.surfaces_found && !surfaces.is_empty(),
        frame_description: raw.frame_description.filter(|d| !d.trim().is_empty()),
        surfaces,
        recommended_placement: raw.recommended_placement.filter(|v| !v.is_null()),
        no_surface_reason: raw.no_surface_reason,
        discarded,
    })
}

fn parse_surface(value: &Value) -> Option<VisionSurface> {
    let location = value.get("location")?;
    let x = number(location.get("x")?)?;
    let y = number(location.get("y")?)?;
    let width = number(location.get("width")?)?;
    let height = number(location.get("height")?)?;
    if width <= 0.0 || height <= 0.0 {
        return None;
    }

    let mut confidence = number(value.get("confidence")?)?;
    // Some answers report confidence as a percentage.
    if confidence > 1.0 {
        confidence /= 100.0;
    }

    let surface_type = value
        .get("surface_type")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SURFACE_TYPE)
        .to_string();

    Some(VisionSurface {
        surface_type,
        confidence: crate::clamp_confidence(confidence),
        bounding_box: BoundingBox::from_percent(x, y, width, height),
        reasoning: value
            .get("reasoning")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn number(value: &Value) -> Option<f32> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FENCED: &str = "```json\n{\"surfaces_found\": true, \"frame_description\": \"office\", \
        \"surfaces\": [{\"location\": {\"x\": 10, \"y\": 60, \"width\": 80, \"height\": 30}, \
        \"surface_type\": \"Desk\", \"confidence\": 0.82, \"reasoning\": \"clear top\"}], \
        \"recommended_placement\": null}\n```";

    #[test]
    fn strips_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
        assert_eq!(strip_code_fences("Sure! {\"a\":1} hope that helps"), "{\"a\":1}");
    }

    #[test]
    fn parses_fenced_answer_and_converts_percentages() {
        let report = parse_vision_report(FENCED).unwrap();
        assert!(report.surfaces_found);
        assert_eq!(report.surfaces.len(), 1);
        let surfaces = report.into_surfaces("vid", 4.0);
        assert_eq!(surfaces.len(), 1);
        let s = &surfaces[0];
        assert_eq!(s.surface_type, "Desk");
        assert!((s.bounding_box.x - 0.1).abs() < 1e-6);
        assert!((s.bounding_box.y - 0.6).abs() < 1e-6);
        assert!((s.bounding_box.width - 0.8).abs() < 1e-6);
        assert!((s.bounding_box.height - 0.3).abs() < 1e-6);
        assert!((s.confidence - 0.82).abs() < 1e-6);
        assert_eq!(s.scene_context.as_deref(), Some("office"));
        assert!(!s.is_inferred);
    }

    #[test]
    fn discards_entries_missing_numbers() {
        let text = r#"{"surfaces_found": true, "surfaces": [
            {"location": {"x": 10, "y": 10, "width": 20}, "surface_type": "Wall", "confidence": 0.5},
            {"location": {"x": "a", "y": 10, "width": 20, "height": 20}, "confidence": 0.5},
            {"surface_type": "Shelf", "confidence": 0.7},
            {"location": {"x": 0, "y": 50, "width": 100, "height": 50}, "surface_type": "Table"},
            {"location": {"x": 5, "y": 50, "width": 40, "height": 20}, "surface_type": "Shelf", "confidence": 70}
        ]}"#;
        let report = parse_vision_report(text).unwrap();
        assert_eq!(report.discarded, 4);
        assert_eq!(report.surfaces.len(), 1);
        assert_eq!(report.surfaces[0].surface_type, "Shelf");
        assert!((report.surfaces[0].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn surfaces_found_false_is_no_detections() {
        let text = r#"{"surfaces_found": false, "frame_description": "sky",
            "surfaces": [{"location": {"x": 0, "y": 0, "width": 10, "height": 10}, "confidence": 0.9}],
            "no_surface_reason": "outdoor shot"}"#;
        let report = parse_vision_report(text).unwrap();
        assert_eq!(report.no_surface_reason.as_deref(), Some("outdoor shot"));
        assert!(report.into_surfaces("vid", 0.0).is_empty());
    }

    #[test]
    fn empty_surface_array_is_no_detections() {
        let report = parse_vision_report(r#"{"surfaces_found": true, "surfaces": []}"#).unwrap();
        assert!(!report.surfaces_found);
        assert!(report.into_surfaces("vid", 0.0).is_empty());
    }

    #[test]
    fn malformed_json_is_error() {
        assert!(matches!(
            parse_vision_report("```json\n{\"surfaces_found\": tru\n```"),
            Err(DetectError::Malformed(_))
        ));
        assert!(matches!(parse_vision_report("   "), Err(DetectError::Malformed(_))));
    }

    #[test]
    fn out_of_range_location_is_clamped() {
        let text = r#"{"surfaces_found": true, "surfaces": [
            {"location": {"x": 90, "y": 95, "width": 40, "height": 30}, "surface_type": "Table", "confidence": 0.6}
        ]}"#;
        let surfaces = parse_vision_report(text).unwrap().into_surfaces("vid", 0.0);
        assert!(surfaces[0].bounding_box.is_normalized());
    }

    #[test]
    fn location_on_right_edge_is_kept_inside_frame() {
        let text = r#"{"surfaces_found": true, "surfaces": [
            {"location": {"x": 100, "y": 50, "width": 10, "height": 10}, "surface_type": "Wall", "confidence": 0.7}
        ]}"#;
        let surfaces = parse_vision_report(text).unwrap().into_surfaces("vid", 0.0);
        assert_eq!(surfaces.len(), 1);
        let b = &surfaces[0].bounding_box;
        assert!(b.is_normalized());
        assert!(b.width >= crate::MIN_BOX_EXTENT);
        assert!((b.y - 0.5).abs() < 1e-6);
    }
}
