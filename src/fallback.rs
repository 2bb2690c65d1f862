use crate::config::FallbackSettings;
use crate::{BoundingBox, DetectedSurface};

pub const FALLBACK_SURFACE_TYPE: &str = "Potential Surface";
const FALLBACK_BOX: (f32, f32, f32, f32) = (0.1, 0.65, 0.8, 0.35);

/// Frame that was analyzed during a scan.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnalyzedFrame {
    pub timestamp_secs: f64,
    pub surfaces: usize,
}

/// Low-confidence placeholders for scans that found too little.
///
/// Runs once per video after every frame has been processed. Placeholders go
/// to frames that produced nothing, in capture order, until the count reaches
/// `min_surfaces + buffer` or those frames run out.
#[derive(Clone, Copy, Debug, Default)]
pub struct FallbackSynthesizer {
    settings: FallbackSettings,
}

impl FallbackSynthesizer {
    pub fn new(settings: FallbackSettings) -> Self {
        Self { settings }
    }

    pub fn is_needed(&self, genuine_count: usize) -> bool {
        genuine_count < self.settings.min_surfaces
    }

    pub fn synthesize(
        &self,
        video_id: &str,
        genuine_count: usize,
        frames: &[AnalyzedFrame],
    ) -> Vec<DetectedSurface> {
        if !self.is_needed(genuine_count) {
            return Vec::new();
        }
        let target = self.settings.min_surfaces + self.settings.buffer;
        let wanted = target.saturating_sub(genuine_count);
        let (x, y, w, h) = FALLBACK_BOX;
        frames
            .iter()
            .filter(|frame| frame.surfaces == 0)
            .take(wanted)
            .map(|frame| {
                DetectedSurface::new(
                    video_id,
                    frame.timestamp_secs,
                    FALLBACK_SURFACE_TYPE,
                    self.settings.confidence,
                    BoundingBox::new(x, y, w, h),
                )
                .inferred()
                .with_scene_context("fallback")
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(counts: &[usize]) -> Vec<AnalyzedFrame> {
        counts
            .iter()
            .enumerate()
            .map(|(i, &surfaces)| AnalyzedFrame {
                timestamp_secs: i as f64 * 2.0,
                surfaces,
            })
            .collect()
    }

    #[test]
    fn fills_up_to_minimum_on_empty_frames() {
        let synth = FallbackSynthesizer::default();
        let out = synth.synthesize("vid", 0, &frames(&[0, 0, 0, 0, 0]));
        assert_eq!(out.len(), 3);
        for (i, s) in out.iter().enumerate() {
            assert!(s.is_inferred);
            assert_eq!(s.surface_type, FALLBACK_SURFACE_TYPE);
            assert!((s.confidence - 0.25).abs() < 1e-6);
            assert_eq!(s.timestamp_secs, i as f64 * 2.0);
            assert!(s.bounding_box.is_normalized());
        }
    }

    #[test]
    fn limited_by_frame_count() {
        let synth = FallbackSynthesizer::default();
        assert_eq!(synth.synthesize("vid", 0, &frames(&[0, 0])).len(), 2);
    }

    #[test]
    fn skips_frames_with_surfaces_and_counts_genuine() {
        let synth = FallbackSynthesizer::default();
        let out = synth.synthesize("vid", 1, &frames(&[1, 0, 0, 0]));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].timestamp_secs, 2.0);
    }

    #[test]
    fn not_triggered_at_minimum() {
        let synth = FallbackSynthesizer::default();
        assert!(!synth.is_needed(3));
        assert!(synth.synthesize("vid", 3, &frames(&[1, 1, 1, 0])).is_empty());
    }

    #[test]
    fn buffer_extends_target() {
        let synth = FallbackSynthesizer::new(FallbackSettings {
            min_surfaces: 2,
            buffer: 2,
            confidence: 0.2,
        });
        assert_eq!(synth.synthesize("vid", 0, &frames(&[0; 6])).len(), 4);
    }
}
