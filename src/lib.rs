//! Placement Surface Scanner
//!
//! This crate locates physical surfaces (desks, tables, walls, monitors, shelves)
//! inside a video so those regions can be offered as virtual product-placement
//! inventory.
//!
//! # Pipeline
//!
//! A scan runs strictly in this order, one video at a time:
//!
//! 1. **Disk guard**: refuse to start when the scratch volume is short on space.
//! 2. **Extraction**: an external decoder writes evenly spaced still frames.
//! 3. **Orientation**: the first frame decides vertical vs horizontal handling.
//! 4. **Detection**: one pluggable `FrameDetector` strategy per frame, followed by
//!    contextual inference. Every frame file is deleted before the next frame.
//! 5. **Fallback**: low-confidence placeholders when too few surfaces were found.
//! 6. **Persistence**: the video's surface set is replaced (clear-then-insert) and
//!    its status moves to a terminal state.
//!
//! # Module Structure
//!
//! - `config`: File + environment configuration
//! - `disk`: Scratch-space probe
//! - `ingest`: Frame extraction and orientation
//! - `detect`: Detector strategies, registry, retry policy
//! - `inference`: Contextual inference (object => implied surface)
//! - `fallback`: Fallback synthesis
//! - `scan`: Scan orchestrator
//! - `queue`: Single-worker job queue
//! - `storage`: Persistence gateway
//! - `resolver`: Video id => local path capability

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod disk;
pub mod fallback;
pub mod inference;
pub mod ingest;
pub mod queue;
pub mod resolver;
pub mod scan;
pub mod storage;

pub use config::{ScanSettings, ScannerConfig};
pub use detect::{DetectError, DetectorRegistry, FrameDetector, FrameInput, RetryPolicy};
pub use disk::{DiskProbe, FixedDiskProbe, StatvfsProbe};
pub use fallback::FallbackSynthesizer;
pub use inference::{ContextualInference, ImplicationRule};
pub use ingest::{
    classify_orientation, ExtractError, ExtractRequest, ExtractedFrame, FfmpegExtractor,
    FrameExtractor, FrameGeometry,
};
pub use queue::{JobEvent, JobQueue, JobStatus, ScanJob};
pub use resolver::{MapPathResolver, NoopPathResolver, PathResolver};
pub use scan::{ScanError, ScanOrchestrator, ScanOutcome, ScanProgress, ScanRequest, ScanStage};
pub use storage::{InMemorySurfaceStore, SqliteSurfaceStore, SurfaceStore};

// -------------------- Bounding Boxes --------------------

/// Smallest width/height a normalized box may carry.
pub const MIN_BOX_EXTENT: f32 = 0.001;

/// Normalized (0..1) rectangle locating a surface within a frame.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Build a box and clamp it into the unit square.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
        .clamped()
    }

    /// Build a box from 0..100 percentages.
    pub fn from_percent(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::new(x / 100.0, y / 100.0, width / 100.0, height / 100.0)
    }

    /// Clamp into the unit square. Width and height stay strictly positive and
    /// the box never extends past the right or bottom edge.
    pub fn clamped(self) -> Self {
        let (x, width) = clamp_span(finite_or(self.x, 0.0), finite_or(self.width, MIN_BOX_EXTENT));
        let (y, height) = clamp_span(finite_or(self.y, 0.0), finite_or(self.height, MIN_BOX_EXTENT));
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    /// True when the box lies inside the unit square with positive extent.
    pub fn is_normalized(&self) -> bool {
        const EPS: f32 = 1e-4;
        self.x >= 0.0
            && self.y >= 0.0
            && self.width > 0.0
            && self.height > 0.0
            && self.right() <= 1.0 + EPS
            && self.bottom() <= 1.0 + EPS
    }
}

/// Fit `start..start + extent` into 0..=1 with at least `MIN_BOX_EXTENT` of
/// extent. In f32, `1.0 - (1.0 - MIN_BOX_EXTENT)` rounds below the minimum, so
/// the start is pulled back to make room instead of clamping against it.
fn clamp_span(start: f32, extent: f32) -> (f32, f32) {
    let start = start.clamp(0.0, 1.0 - MIN_BOX_EXTENT);
    let max_extent = (1.0 - start).max(MIN_BOX_EXTENT);
    let extent = extent.max(MIN_BOX_EXTENT).min(max_extent);
    (start.min(1.0 - max_extent), extent)
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// Clamp a confidence score into 0..=1 (NaN becomes 0).
pub fn clamp_confidence(confidence: f32) -> f32 {
    finite_or(confidence, 0.0).clamp(0.0, 1.0)
}

// -------------------- Surfaces --------------------

/// A flat region of a frame suitable for virtual product placement.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DetectedSurface {
    pub video_id: String,
    /// Offset into the video, in seconds.
    pub timestamp_secs: f64,
    /// Open vocabulary: Desk, Table, Wall, Monitor, Laptop, Shelf, ...
    pub surface_type: String,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
    /// Set for contextual inference and fallback synthesis.
    pub is_inferred: bool,
    pub scene_context: Option<String>,
    pub frame_url: Option<String>,
}

impl DetectedSurface {
    pub fn new(
        video_id: &str,
        timestamp_secs: f64,
        surface_type: &str,
        confidence: f32,
        bounding_box: BoundingBox,
    ) -> Self {
        Self {
            video_id: video_id.to_string(),
            timestamp_secs,
            surface_type: surface_type.to_string(),
            confidence: clamp_confidence(confidence),
            bounding_box: bounding_box.clamped(),
            is_inferred: false,
            scene_context: None,
            frame_url: None,
        }
    }

    pub fn inferred(mut self) -> Self {
        self.is_inferred = true;
        self
    }

    pub fn with_scene_context(mut self, context: impl Into<String>) -> Self {
        self.scene_context = Some(context.into());
        self
    }

    /// Case-insensitive surface type comparison.
    pub fn is_type(&self, surface_type: &str) -> bool {
        self.surface_type.eq_ignore_ascii_case(surface_type)
    }
}

// -------------------- Video Status --------------------

/// Scan lifecycle of a video.
///
/// `PendingScan -> Scanning -> {Ready(N) | ScanFailed | PendingUpload}`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum VideoStatus {
    PendingScan,
    Scanning,
    Ready { spots: usize },
    ScanFailed,
    PendingUpload,
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoStatus::PendingScan => write!(f, "Pending Scan"),
            VideoStatus::Scanning => write!(f, "Scanning"),
            VideoStatus::Ready { spots } => write!(f, "Ready ({} Spots)", spots),
            VideoStatus::ScanFailed => write!(f, "Scan Failed"),
            VideoStatus::PendingUpload => write!(f, "Pending Upload"),
        }
    }
}

impl FromStr for VideoStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "Pending Scan" => Ok(VideoStatus::PendingScan),
            "Scanning" => Ok(VideoStatus::Scanning),
            "Scan Failed" => Ok(VideoStatus::ScanFailed),
            "Pending Upload" => Ok(VideoStatus::PendingUpload),
            other => {
                let spots = other
                    .strip_prefix("Ready (")
                    .and_then(|rest| rest.strip_suffix(" Spots)"))
                    .ok_or_else(|| anyhow!("unknown video status '{}'", other))?;
                let spots = spots
                    .parse()
                    .map_err(|_| anyhow!("invalid spot count in status '{}'", other))?;
                Ok(VideoStatus::Ready { spots })
            }
        }
    }
}

impl From<VideoStatus> for String {
    fn from(status: VideoStatus) -> Self {
        status.to_string()
    }
}

impl TryFrom<String> for VideoStatus {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// A video row as seen through the storage gateway.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VideoRecord {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub status: VideoStatus,
    /// Local path recorded at upload time, if any.
    pub source_path: Option<String>,
    /// Upload storage key; the last-resort path is `upload_dir/storage_key`.
    pub storage_key: Option<String>,
}

impl VideoRecord {
    pub fn new(id: &str, user_id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            status: VideoStatus::PendingScan,
            source_path: None,
            storage_key: None,
        }
    }
}

// -------------------- Video ID Discipline --------------------

/// Video ids namespace scratch directories and snapshot paths, so they are held
/// to a strict allowlist: 1..128 of `[A-Za-z0-9_-]`.
pub fn validate_video_id(video_id: &str) -> Result<()> {
    static VIDEO_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = VIDEO_ID_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("static video id pattern")
    });
    if !re.is_match(video_id) {
        return Err(anyhow!(
            "video id must match ^[A-Za-z0-9_-]{{1,128}}$ (got '{}')",
            video_id
        ));
    }
    Ok(())
}

// -------------------- Time --------------------

pub(crate) fn now_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_box_clamps_into_unit_square() {
        let b = BoundingBox::new(0.9, -0.2, 0.5, 2.0);
        assert!(b.is_normalized());
        assert!((b.x - 0.9).abs() < 1e-6);
        assert_eq!(b.y, 0.0);
        assert!((b.right() - 1.0).abs() < 1e-6);
        assert!((b.bottom() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn bounding_box_keeps_positive_extent() {
        let b = BoundingBox::new(1.0, 1.0, 0.0, -3.0);
        assert!(b.width > 0.0);
        assert!(b.height > 0.0);
        assert!(b.is_normalized());
    }

    #[test]
    fn bounding_box_at_far_edges() {
        for b in [
            BoundingBox::from_percent(100.0, 50.0, 10.0, 10.0),
            BoundingBox::from_percent(50.0, 100.0, 10.0, 10.0),
            BoundingBox::new(1.0, 1.0, 1.0, 1.0),
            BoundingBox::new(0.9995, 0.9995, 0.5, 0.5),
        ] {
            assert!(b.is_normalized(), "{:?}", b);
            assert!(b.width >= MIN_BOX_EXTENT);
            assert!(b.height >= MIN_BOX_EXTENT);
        }
        let b = BoundingBox::from_percent(100.0, 50.0, 10.0, 10.0);
        assert!((b.right() - 1.0).abs() < 1e-4);
        assert!((b.y - 0.5).abs() < 1e-6);
        assert!((b.height - 0.1).abs() < 1e-6);
    }

    #[test]
    fn bounding_box_from_percent() {
        let b = BoundingBox::from_percent(10.0, 50.0, 80.0, 25.0);
        assert!((b.x - 0.1).abs() < 1e-6);
        assert!((b.y - 0.5).abs() < 1e-6);
        assert!((b.width - 0.8).abs() < 1e-6);
        assert!((b.height - 0.25).abs() < 1e-6);
    }

    #[test]
    fn bounding_box_rejects_nan() {
        let b = BoundingBox::new(f32::NAN, 0.5, f32::INFINITY, 0.2);
        assert!(b.is_normalized());
        assert_eq!(b.x, 0.0);
    }

    #[test]
    fn surface_confidence_is_clamped() {
        let s = DetectedSurface::new("v1", 0.0, "Desk", 1.7, BoundingBox::new(0.0, 0.0, 1.0, 1.0));
        assert_eq!(s.confidence, 1.0);
        let s = DetectedSurface::new("v1", 0.0, "Desk", f32::NAN, s.bounding_box);
        assert_eq!(s.confidence, 0.0);
    }

    #[test]
    fn video_status_round_trips_through_display() {
        for status in [
            VideoStatus::PendingScan,
            VideoStatus::Scanning,
            VideoStatus::Ready { spots: 0 },
            VideoStatus::Ready { spots: 12 },
            VideoStatus::ScanFailed,
            VideoStatus::PendingUpload,
        ] {
            let parsed: VideoStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert_eq!(VideoStatus::Ready { spots: 5 }.to_string(), "Ready (5 Spots)");
        assert!("Ready (x Spots)".parse::<VideoStatus>().is_err());
        assert!("Archived".parse::<VideoStatus>().is_err());
    }

    #[test]
    fn video_id_discipline() {
        assert!(validate_video_id("vid_01-AB").is_ok());
        assert!(validate_video_id("").is_err());
        assert!(validate_video_id("../etc").is_err());
        assert!(validate_video_id("a b").is_err());
    }
}
