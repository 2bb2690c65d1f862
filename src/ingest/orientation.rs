//! Orientation classification.
//!
//! Phone recordings (aspect < 1.0) put desks and tables low in the frame and
//! yield weaker gradient cues, so vertical footage gets a lower region-of-interest
//! origin and a lower acceptance threshold.

use anyhow::{Context, Result};
use std::path::Path;

/// ROI origin (fraction of frame height) for horizontal footage.
pub const HORIZONTAL_ROI_ORIGIN: f32 = 0.30;
/// ROI origin for vertical footage; biased toward the lower portion.
pub const VERTICAL_ROI_ORIGIN: f32 = 0.45;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub is_vertical: bool,
}

impl FrameGeometry {
    /// Fraction of frame height where the analyzed region begins.
    pub fn roi_origin(&self) -> f32 {
        roi_origin(self.is_vertical)
    }
}

pub fn roi_origin(is_vertical: bool) -> f32 {
    if is_vertical {
        VERTICAL_ROI_ORIGIN
    } else {
        HORIZONTAL_ROI_ORIGIN
    }
}

/// Classify by aspect ratio: `width / height < 1.0` is vertical.
pub fn classify_orientation(width: u32, height: u32) -> FrameGeometry {
    let is_vertical = height > 0 && (width as f64 / height as f64) < 1.0;
    FrameGeometry {
        width,
        height,
        is_vertical,
    }
}

/// Read a frame's header and classify it.
pub fn probe_geometry(path: &Path) -> Result<FrameGeometry> {
    let (width, height) = image::image_dimensions(path)
        .with_context(|| format!("read frame dimensions from {}", path.display()))?;
    Ok(classify_orientation(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portrait_is_vertical() {
        let g = classify_orientation(1080, 1920);
        assert!(g.is_vertical);
        assert_eq!(g.roi_origin(), VERTICAL_ROI_ORIGIN);
    }

    #[test]
    fn landscape_and_square_are_horizontal() {
        assert!(!classify_orientation(1920, 1080).is_vertical);
        assert!(!classify_orientation(720, 720).is_vertical);
        assert_eq!(classify_orientation(1920, 1080).roi_origin(), HORIZONTAL_ROI_ORIGIN);
    }

    #[test]
    fn zero_height_is_horizontal() {
        assert!(!classify_orientation(10, 0).is_vertical);
    }

    #[test]
    fn probe_reads_png_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame_0001.png");
        image::GrayImage::new(30, 60).save(&path).unwrap();
        let g = probe_geometry(&path).unwrap();
        assert_eq!((g.width, g.height), (30, 60));
        assert!(g.is_vertical);
    }

    #[test]
    fn probe_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame_0001.jpg");
        std::fs::write(&path, b"garbage").unwrap();
        assert!(probe_geometry(&path).is_err());
    }
}
