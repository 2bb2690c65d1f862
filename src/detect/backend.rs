use std::path::Path;

use crate::ingest::FrameGeometry;
use crate::DetectedSurface;

/// One frame handed to a detector.
#[derive(Clone, Copy, Debug)]
pub struct FrameInput<'a> {
    pub video_id: &'a str,
    pub path: &'a Path,
    /// Capture order within the scan.
    pub index: usize,
    pub timestamp_secs: f64,
    /// Orientation decided from the scan's first frame.
    pub geometry: FrameGeometry,
}

/// Per-frame detection failure.
///
/// These never abort a scan: the orchestrator retries transient kinds and then
/// absorbs the failure as "no surfaces for this frame".
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("detector call timed out")]
    Timeout,

    #[error("rate limited or quota exhausted: {0}")]
    RateLimited(String),

    #[error("authentication rejected: {0}")]
    Unauthorized(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("request rejected {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed detector response: {0}")]
    Malformed(String),

    #[error("unreadable frame: {0}")]
    Image(String),

    #[error("model failure: {0}")]
    Model(String),
}

impl DetectError {
    /// Timeouts and 5xx responses are worth another attempt; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, DetectError::Timeout | DetectError::Server { .. })
    }
}

/// Detector strategy trait.
///
/// Strategies are pure with respect to the pipeline: they read the frame file,
/// return surfaces, and leave logging, persistence and file cleanup to the
/// orchestrator.
pub trait FrameDetector: Send {
    /// Strategy identifier (`edge`, `vision`, `objects`, ...).
    fn name(&self) -> &'static str;

    /// Run detection on one frame.
    fn detect(&mut self, frame: &FrameInput<'_>) -> Result<Vec<DetectedSurface>, DetectError>;
}
