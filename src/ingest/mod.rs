//! Frame ingestion for scans.
//!
//! This module provides:
//! - `FrameExtractor`: writes a bounded, evenly spaced set of still frames for a
//!   source video into a caller-owned scratch directory
//! - `FfmpegExtractor`: the production extractor (external `ffmpeg` process)
//! - Orientation classification from the first frame's dimensions
//!
//! The ingestion layer is responsible for:
//! - Refusing missing sources before spawning anything
//! - Bounding the decoder with a hard timeout (the process is killed)
//! - Returning frame paths in capture order
//!
//! The ingestion layer MUST NOT delete frames; ownership of the files passes to
//! the orchestrator.

pub mod ffmpeg;
pub mod orientation;

use std::path::{Path, PathBuf};

pub use ffmpeg::FfmpegExtractor;
pub use orientation::{classify_orientation, probe_geometry, FrameGeometry};

/// Parameters for one extraction run.
#[derive(Clone, Debug)]
pub struct ExtractRequest {
    pub source: PathBuf,
    pub output_dir: PathBuf,
    /// Seconds between frames (decoder runs at `1/interval` fps).
    pub interval_secs: f64,
    pub max_frames: u32,
    /// Longest frame side after scaling.
    pub max_dimension: u32,
    /// JPEG quality, 1..=100.
    pub quality: u8,
}

/// One still frame on disk.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractedFrame {
    pub path: PathBuf,
    /// Capture order, starting at 0.
    pub index: usize,
    pub timestamp_secs: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("source video not found: {0}")]
    SourceMissing(PathBuf),

    #[error("failed to start decoder: {0}")]
    Spawn(std::io::Error),

    #[error("decoder exited with code {exit_code:?}: {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("decoder timed out after {timeout_secs}s")]
    TimedOut { timeout_secs: u64 },

    #[error("I/O error during extraction: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame extraction capability.
pub trait FrameExtractor: Send {
    /// Extract frames into `request.output_dir`, returned in capture order.
    fn extract(&self, request: &ExtractRequest) -> Result<Vec<ExtractedFrame>, ExtractError>;
}

/// List extracted `frame_*.jpg` files in capture order, capped at `max_frames`.
pub(crate) fn collect_frames(
    output_dir: &Path,
    interval_secs: f64,
    max_frames: u32,
) -> Result<Vec<ExtractedFrame>, ExtractError> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(output_dir)? {
        let path = entry?.path();
        let is_frame = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("frame_") && name.ends_with(".jpg"));
        if is_frame {
            paths.push(path);
        }
    }
    // Zero-padded sequence numbers sort lexically in capture order.
    paths.sort();
    paths.truncate(max_frames as usize);

    Ok(paths
        .into_iter()
        .enumerate()
        .map(|(index, path)| ExtractedFrame {
            path,
            index,
            timestamp_secs: index as f64 * interval_secs,
        })
        .collect())
}
