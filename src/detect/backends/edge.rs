use image::GrayImage;

use crate::config::EdgeSettings;
use crate::detect::backend::{DetectError, FrameDetector, FrameInput};
use crate::{BoundingBox, DetectedSurface};

const DENSITY_SCALE: f32 = 10.0;
const DENSITY_WEIGHT: f32 = 0.25;
const CONTINUITY_WEIGHT: f32 = 0.55;
const PLACEMENT_WEIGHT: f32 = 0.20;
const SURFACE_X: f32 = 0.05;
const SURFACE_WIDTH: f32 = 0.90;
const SURFACE_LIFT: f32 = 0.02;
const SURFACE_MAX_HEIGHT: f32 = 0.35;

/// Horizontal-edge measurements for the region of interest of one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EdgeSignal {
    /// Edge pixels / pixels examined.
    pub edge_density: f32,
    /// Longest contiguous edge run / frame width.
    pub continuity: f32,
    /// Row holding the longest run, as a fraction of frame height.
    pub best_row_fraction: f32,
    pub roi_origin: f32,
    pub confidence: f32,
    /// The longest run exceeds `min_line_fraction`.
    pub is_candidate: bool,
}

/// Measure horizontal edges in the lower part of a luma frame, starting at
/// `roi_origin` (fraction of height). Returns `None` when the region is too
/// small to compare adjacent rows.
pub fn analyze_luma(luma: &GrayImage, roi_origin: f32, settings: &EdgeSettings) -> Option<EdgeSignal> {
    let (width, height) = luma.dimensions();
    if width == 0 || height < 2 {
        return None;
    }
    let start = ((height as f32 * roi_origin.clamp(0.0, 1.0)) as u32).min(height - 2);
    let threshold = i16::from(settings.gradient_threshold);

    let mut edge_pixels: u64 = 0;
    let mut examined: u64 = 0;
    let mut best_run: u32 = 0;
    let mut best_row = start;

    for y in start..height - 1 {
        let mut run: u32 = 0;
        let mut row_best: u32 = 0;
        for x in 0..width {
            let here = i16::from(luma.get_pixel(x, y)[0]);
            let below = i16::from(luma.get_pixel(x, y + 1)[0]);
            examined += 1;
            if (below - here).abs() > threshold {
                edge_pixels += 1;
                run += 1;
                row_best = row_best.max(run);
            } else {
                run = 0;
            }
        }
        // Strictly greater keeps the first (upper) row on ties.
        if row_best > best_run {
            best_run = row_best;
            best_row = y;
        }
    }

    if examined == 0 {
        return None;
    }

    let edge_density = edge_pixels as f32 / examined as f32;
    let continuity = best_run as f32 / width as f32;
    let roi_middle = start + (height - start) / 2;
    let placement = if best_run > 0 && best_row >= roi_middle {
        1.0
    } else {
        0.0
    };
    let density_score = (edge_density * DENSITY_SCALE).min(1.0);
    let confidence = DENSITY_WEIGHT * density_score
        + CONTINUITY_WEIGHT * continuity
        + PLACEMENT_WEIGHT * placement;

    Some(EdgeSignal {
        edge_density,
        continuity,
        best_row_fraction: best_row as f32 / height as f32,
        roi_origin,
        confidence: crate::clamp_confidence(confidence),
        is_candidate: continuity > settings.min_line_fraction,
    })
}

/// Turn a signal into a surface when it clears the orientation threshold.
pub fn surface_from_signal(
    signal: &EdgeSignal,
    frame: &FrameInput<'_>,
    threshold: f32,
) -> Option<DetectedSurface> {
    if !signal.is_candidate || signal.confidence < threshold {
        return None;
    }
    let y = (signal.best_row_fraction - SURFACE_LIFT).max(0.0);
    let height = SURFACE_MAX_HEIGHT.min(1.0 - y);
    let surface = DetectedSurface::new(
        frame.video_id,
        frame.timestamp_secs,
        "Desk",
        signal.confidence,
        BoundingBox::new(SURFACE_X, y, SURFACE_WIDTH, height),
    )
    .with_scene_context("horizontal_edge");
    Some(surface)
}

/// Offline heuristic: a long, continuous horizontal edge in the lower part of
/// the frame is taken as the front edge of a desk or table.
///
/// Needs no network or model file, so it is always registered.
#[derive(Debug, Default)]
pub struct EdgeHeuristicBackend {
    settings: EdgeSettings,
}

impl EdgeHeuristicBackend {
    pub fn new(settings: EdgeSettings) -> Self {
        Self { settings }
    }
}

impl FrameDetector for EdgeHeuristicBackend {
    fn name(&self) -> &'static str {
        "edge"
    }

    fn detect(&mut self, frame: &FrameInput<'_>) -> Result<Vec<DetectedSurface>, DetectError> {
        let luma = image::open(frame.path)
            .map_err(|e| DetectError::Image(format!("{}: {}", frame.path.display(), e)))?
            .to_luma8();
        let Some(signal) = analyze_luma(&luma, frame.geometry.roi_origin(), &self.settings) else {
            return Ok(Vec::new());
        };
        let threshold = self.settings.threshold(frame.geometry.is_vertical);
        Ok(surface_from_signal(&signal, frame, threshold)
            .into_iter()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::classify_orientation;
    use image::Luma;
    use std::path::Path;

    fn split_image(width: u32, height: u32, boundary_row: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |_, y| {
            if y < boundary_row {
                Luma([20])
            } else {
                Luma([220])
            }
        })
    }

    fn input<'a>(path: &'a Path, width: u32, height: u32) -> FrameInput<'a> {
        FrameInput {
            video_id: "vid",
            path,
            index: 0,
            timestamp_secs: 6.0,
            geometry: classify_orientation(width, height),
        }
    }

    #[test]
    fn strong_low_edge_is_candidate() {
        let luma = split_image(200, 100, 70);
        let signal = analyze_luma(&luma, 0.30, &EdgeSettings::default()).unwrap();
        assert!(signal.is_candidate);
        assert!((signal.continuity - 1.0).abs() < 1e-6);
        assert!((signal.best_row_fraction - 0.69).abs() < 1e-6);
        assert!(signal.confidence > EdgeSettings::default().horizontal_threshold);
    }

    #[test]
    fn run_must_exceed_min_line_fraction() {
        let partial = |bright_cols: u32| {
            GrayImage::from_fn(100, 100, move |x, y| {
                if y >= 70 && x < bright_cols {
                    Luma([220])
                } else {
                    Luma([20])
                }
            })
        };
        let settings = EdgeSettings::default();

        let at_limit = analyze_luma(&partial(30), 0.30, &settings).unwrap();
        assert!((at_limit.continuity - 0.30).abs() < 1e-6);
        assert!(!at_limit.is_candidate);

        let above = analyze_luma(&partial(31), 0.30, &settings).unwrap();
        assert!(above.is_candidate);
    }

    #[test]
    fn flat_frame_has_no_candidate() {
        let luma = GrayImage::from_pixel(120, 80, Luma([128]));
        let signal = analyze_luma(&luma, 0.30, &EdgeSettings::default()).unwrap();
        assert!(!signal.is_candidate);
        assert_eq!(signal.edge_density, 0.0);
        assert_eq!(signal.confidence, 0.0);
    }

    #[test]
    fn edge_above_roi_is_ignored() {
        let luma = split_image(200, 100, 10);
        let signal = analyze_luma(&luma, 0.30, &EdgeSettings::default()).unwrap();
        assert!(!signal.is_candidate);
    }

    #[test]
    fn tiny_frame_has_no_signal() {
        let luma = GrayImage::from_pixel(10, 1, Luma([0]));
        assert!(analyze_luma(&luma, 0.30, &EdgeSettings::default()).is_none());
    }

    #[test]
    fn threshold_depends_on_orientation() {
        let signal = EdgeSignal {
            edge_density: 0.01,
            continuity: 0.5,
            best_row_fraction: 0.6,
            roi_origin: 0.45,
            confidence: 0.40,
            is_candidate: true,
        };
        let path = Path::new("unused.jpg");
        let settings = EdgeSettings::default();

        let vertical = input(path, 720, 1280);
        assert!(vertical.geometry.is_vertical);
        let surface = surface_from_signal(&signal, &vertical, settings.threshold(true)).unwrap();
        assert!((surface.bounding_box.y - 0.58).abs() < 1e-6);
        assert!((surface.bounding_box.height - 0.35).abs() < 1e-6);
        assert_eq!(surface.surface_type, "Desk");
        assert!(!surface.is_inferred);

        let horizontal = input(path, 1280, 720);
        assert!(surface_from_signal(&signal, &horizontal, settings.threshold(false)).is_none());
    }

    #[test]
    fn detects_desk_edge_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame_0001.png");
        split_image(160, 90, 65).save(&path).unwrap();

        let mut backend = EdgeHeuristicBackend::default();
        let surfaces = backend.detect(&input(&path, 160, 90)).unwrap();
        assert_eq!(surfaces.len(), 1);
        let surface = &surfaces[0];
        assert_eq!(surface.video_id, "vid");
        assert_eq!(surface.timestamp_secs, 6.0);
        assert!(surface.bounding_box.is_normalized());
        assert_eq!(surface.scene_context.as_deref(), Some("horizontal_edge"));
    }

    #[test]
    fn unreadable_frame_is_image_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.jpg");
        let mut backend = EdgeHeuristicBackend::default();
        assert!(matches!(
            backend.detect(&input(&path, 160, 90)),
            Err(DetectError::Image(_))
        ));
    }
}
