use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::detect::backend::{DetectError, FrameDetector, FrameInput};
use crate::{BoundingBox, DetectedSurface};

type DetectFn = Box<dyn FnMut(&FrameInput<'_>) -> Result<Vec<DetectedSurface>, DetectError> + Send>;

/// Scriptable strategy for tests and dry runs. Counts its calls.
pub struct StubBackend {
    detect_fn: DetectFn,
    calls: Arc<AtomicUsize>,
}

impl StubBackend {
    pub fn from_fn<F>(detect_fn: F) -> Self
    where
        F: FnMut(&FrameInput<'_>) -> Result<Vec<DetectedSurface>, DetectError> + Send + 'static,
    {
        Self {
            detect_fn: Box::new(detect_fn),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Never finds anything.
    pub fn empty() -> Self {
        Self::from_fn(|_| Ok(Vec::new()))
    }

    /// One surface of `surface_type` per frame at `confidence`.
    pub fn fixed(surface_type: &'static str, confidence: f32) -> Self {
        Self::from_fn(move |frame| {
            Ok(vec![DetectedSurface::new(
                frame.video_id,
                frame.timestamp_secs,
                surface_type,
                confidence,
                BoundingBox::new(0.1, 0.6, 0.8, 0.3),
            )])
        })
    }

    /// Shared call counter; stays valid after the stub moves into a registry.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl FrameDetector for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &FrameInput<'_>) -> Result<Vec<DetectedSurface>, DetectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.detect_fn)(frame)
    }
}
