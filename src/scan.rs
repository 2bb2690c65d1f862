//! Scan orchestrator.
//!
//! Drives one video through the pipeline and leaves it in a defined state:
//!
//! ```text
//! PendingScan -> Scanning -> Ready (N Spots) | Scan Failed | Pending Upload
//! ```
//!
//! The orchestrator is the only component that touches the scratch directory
//! and the storage gateway. It never returns an error or lets a panic escape:
//! every exit path produces a `ScanOutcome`, and the scratch directory is
//! removed on all of them.

use serde::Serialize;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, MutexGuard};
use std::time::Instant;

use crate::config::ScanSettings;
use crate::detect::{DetectError, FrameDetector, FrameInput, RetryPolicy, SharedDetector};
use crate::disk::{DiskProbe, StatvfsProbe};
use crate::fallback::{AnalyzedFrame, FallbackSynthesizer};
use crate::inference::ContextualInference;
use crate::ingest::{
    probe_geometry, ExtractError, ExtractRequest, ExtractedFrame, FfmpegExtractor,
    FrameExtractor, FrameGeometry,
};
use crate::resolver::{NoopPathResolver, PathResolver};
use crate::storage::SurfaceStore;
use crate::{now_ms, DetectedSurface, VideoRecord, VideoStatus};

/// One scan invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanRequest {
    pub video_id: String,
    /// Preferred local source; falls back to the resolver and stored metadata.
    pub source_path: Option<PathBuf>,
    /// Scan even when the video is not `PendingScan`.
    pub force: bool,
}

impl ScanRequest {
    pub fn new(video_id: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            source_path: None,
            force: false,
        }
    }

    pub fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("insufficient disk space: {available_mb} MB available, {required_mb} MB required")]
    InsufficientDiskSpace { available_mb: u64, required_mb: u64 },

    #[error("invalid video id: {0}")]
    InvalidVideoId(String),

    #[error("video not found: {0}")]
    VideoNotFound(String),

    #[error("video {video_id} is not eligible for scanning (status: {status})")]
    NotEligible {
        video_id: String,
        status: VideoStatus,
    },

    #[error("source video for {0} is unavailable; re-upload required")]
    SourceUnavailable(String),

    #[error("No frames extracted")]
    NoFrames,

    #[error("frame extraction failed: {0}")]
    Extraction(#[from] ExtractError),

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),

    #[error("scratch directory error: {0}")]
    Scratch(io::Error),

    #[error("scan aborted: {0}")]
    Internal(String),
}

impl ScanError {
    /// Stable snake_case tag for machine consumers.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::InsufficientDiskSpace { .. } => "insufficient_disk_space",
            ScanError::InvalidVideoId(_) => "invalid_video_id",
            ScanError::VideoNotFound(_) => "video_not_found",
            ScanError::NotEligible { .. } => "not_eligible",
            ScanError::SourceUnavailable(_) => "source_unavailable",
            ScanError::NoFrames => "no_frames",
            ScanError::Extraction(_) => "extraction_failed",
            ScanError::Storage(_) => "storage",
            ScanError::Scratch(_) => "scratch",
            ScanError::Internal(_) => "internal",
        }
    }

    /// Status the video is left in after this error; `None` leaves it untouched.
    fn terminal_status(&self) -> Option<VideoStatus> {
        match self {
            ScanError::InsufficientDiskSpace { .. }
            | ScanError::InvalidVideoId(_)
            | ScanError::VideoNotFound(_)
            | ScanError::NotEligible { .. } => None,
            ScanError::SourceUnavailable(_) => Some(VideoStatus::PendingUpload),
            _ => Some(VideoStatus::ScanFailed),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStage {
    Preparing,
    Extracting,
    Analyzing,
    Fallback,
    Completed,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ScanProgress {
    pub stage: ScanStage,
    pub frames_done: usize,
    pub frames_total: usize,
    pub surfaces: usize,
}

/// Structured result of one scan. Produced for every exit path.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScanOutcome {
    pub success: bool,
    pub video_id: String,
    pub surfaces_detected: usize,
    pub frames_analyzed: usize,
    pub is_vertical: bool,
    /// Status written by this scan; `None` when the video was left untouched.
    pub status: Option<VideoStatus>,
    pub detector: String,
    pub elapsed_ms: u64,
    pub error: Option<String>,
    pub error_kind: Option<String>,
}

/// Running totals shared between the scan body and the outcome builder.
#[derive(Default)]
struct ScanTally {
    frames_analyzed: usize,
    surfaces: usize,
    is_vertical: bool,
}

/// Per-scan scratch directory, removed on drop.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn create(path: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => log::debug!("removed scratch dir {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "failed to remove scratch dir {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Deletes one frame file on drop, whatever happened while it was analyzed.
struct FrameFile<'a>(&'a Path);

impl Drop for FrameFile<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(self.0) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("failed to delete frame {}: {}", self.0.display(), e);
            }
        }
    }
}

pub struct ScanOrchestrator {
    settings: ScanSettings,
    store: Box<dyn SurfaceStore>,
    detector: SharedDetector,
    detector_name: String,
    resolver: Box<dyn PathResolver>,
    extractor: Box<dyn FrameExtractor>,
    disk: Box<dyn DiskProbe>,
    inference: ContextualInference,
    fallback: FallbackSynthesizer,
    retry: RetryPolicy,
}

impl ScanOrchestrator {
    /// Production wiring: ffmpeg extraction, statvfs disk probe, default
    /// inference table, no path resolver.
    pub fn new(settings: ScanSettings, store: Box<dyn SurfaceStore>, detector: SharedDetector) -> Self {
        let detector_name = detector
            .lock()
            .map(|d| d.name().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            extractor: Box::new(FfmpegExtractor::from_settings(&settings.extraction)),
            fallback: FallbackSynthesizer::new(settings.fallback),
            settings,
            store,
            detector,
            detector_name,
            resolver: Box::new(NoopPathResolver),
            disk: Box::new(StatvfsProbe),
            inference: ContextualInference::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_resolver(mut self, resolver: impl PathResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn with_extractor(mut self, extractor: impl FrameExtractor + 'static) -> Self {
        self.extractor = Box::new(extractor);
        self
    }

    pub fn with_disk_probe(mut self, disk: impl DiskProbe + 'static) -> Self {
        self.disk = Box::new(disk);
        self
    }

    pub fn with_inference(mut self, inference: ContextualInference) -> Self {
        self.inference = inference;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn detector_name(&self) -> &str {
        &self.detector_name
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Scan without progress reporting.
    pub fn scan(&mut self, request: &ScanRequest) -> ScanOutcome {
        self.process_video_scan(request, &mut |_| {})
    }

    /// Run one scan to a terminal state. Never fails and never panics outward.
    pub fn process_video_scan(
        &mut self,
        request: &ScanRequest,
        progress: &mut dyn FnMut(ScanProgress),
    ) -> ScanOutcome {
        let started = Instant::now();
        let mut tally = ScanTally::default();
        log::info!(
            "scan {}: starting with detector '{}'{}",
            request.video_id,
            self.detector_name,
            if request.force { " (forced)" } else { "" }
        );

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_scan(request, &mut tally, &mut *progress)
        }))
        .unwrap_or_else(|payload| Err(ScanError::Internal(panic_message(payload.as_ref()))));

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(status) => {
                log::info!(
                    "scan {}: {} after {} frames in {} ms",
                    request.video_id,
                    status,
                    tally.frames_analyzed,
                    elapsed_ms
                );
                progress(ScanProgress {
                    stage: ScanStage::Completed,
                    frames_done: tally.frames_analyzed,
                    frames_total: tally.frames_analyzed,
                    surfaces: tally.surfaces,
                });
                ScanOutcome {
                    success: true,
                    video_id: request.video_id.clone(),
                    surfaces_detected: tally.surfaces,
                    frames_analyzed: tally.frames_analyzed,
                    is_vertical: tally.is_vertical,
                    status: Some(status),
                    detector: self.detector_name.clone(),
                    elapsed_ms,
                    error: None,
                    error_kind: None,
                }
            }
            Err(err) => {
                let status = err.terminal_status();
                if let Some(status) = status {
                    if let Err(e) = self.store.update_video_status(&request.video_id, status) {
                        log::error!(
                            "scan {}: failed to record status '{}': {:#}",
                            request.video_id,
                            status,
                            e
                        );
                    }
                }
                match &err {
                    ScanError::SourceUnavailable(_) | ScanError::InsufficientDiskSpace { .. } => {
                        log::warn!("scan {}: {}", request.video_id, err)
                    }
                    _ => log::error!("scan {}: {}", request.video_id, err),
                }
                progress(ScanProgress {
                    stage: ScanStage::Failed,
                    frames_done: tally.frames_analyzed,
                    frames_total: tally.frames_analyzed,
                    surfaces: tally.surfaces,
                });
                ScanOutcome {
                    success: false,
                    video_id: request.video_id.clone(),
                    surfaces_detected: tally.surfaces,
                    frames_analyzed: tally.frames_analyzed,
                    is_vertical: tally.is_vertical,
                    status,
                    detector: self.detector_name.clone(),
                    elapsed_ms,
                    error: Some(err.to_string()),
                    error_kind: Some(err.kind().to_string()),
                }
            }
        }
    }

    fn run_scan(
        &mut self,
        request: &ScanRequest,
        tally: &mut ScanTally,
        progress: &mut dyn FnMut(ScanProgress),
    ) -> Result<VideoStatus, ScanError> {
        let video_id = request.video_id.as_str();
        crate::validate_video_id(video_id)
            .map_err(|_| ScanError::InvalidVideoId(video_id.to_string()))?;
        progress(ScanProgress {
            stage: ScanStage::Preparing,
            frames_done: 0,
            frames_total: 0,
            surfaces: 0,
        });

        let video = self
            .store
            .get_video_by_id(video_id)
            .map_err(ScanError::Storage)?
            .ok_or_else(|| ScanError::VideoNotFound(video_id.to_string()))?;
        if !request.force && video.status != VideoStatus::PendingScan {
            return Err(ScanError::NotEligible {
                video_id: video_id.to_string(),
                status: video.status,
            });
        }

        let available_mb = self.disk.available_mb(&self.settings.scratch_dir);
        if available_mb < self.settings.min_free_mb {
            return Err(ScanError::InsufficientDiskSpace {
                available_mb,
                required_mb: self.settings.min_free_mb,
            });
        }

        self.store
            .clear_detected_surfaces(video_id)
            .map_err(ScanError::Storage)?;
        self.store
            .update_video_status(video_id, VideoStatus::Scanning)
            .map_err(ScanError::Storage)?;

        let source = self
            .resolve_source(request, &video)
            .ok_or_else(|| ScanError::SourceUnavailable(video_id.to_string()))?;
        log::info!("scan {}: source {}", video_id, source.display());

        let scratch = ScratchDir::create(
            self.settings
                .scratch_dir
                .join(format!("scan_{}_{}", video_id, now_ms())),
        )
        .map_err(ScanError::Scratch)?;

        progress(ScanProgress {
            stage: ScanStage::Extracting,
            frames_done: 0,
            frames_total: 0,
            surfaces: 0,
        });
        let extraction = &self.settings.extraction;
        let frames = self.extractor.extract(&ExtractRequest {
            source,
            output_dir: scratch.path.clone(),
            interval_secs: extraction.interval_secs,
            max_frames: extraction.max_frames,
            max_dimension: extraction.max_dimension,
            quality: extraction.quality,
        })?;
        if frames.is_empty() {
            return Err(ScanError::NoFrames);
        }
        log::info!("scan {}: extracted {} frames", video_id, frames.len());

        let geometry = probe_geometry(&frames[0].path).unwrap_or_else(|e| {
            log::warn!(
                "scan {}: could not read first frame dimensions ({:#}); assuming horizontal",
                video_id,
                e
            );
            FrameGeometry {
                width: 0,
                height: 0,
                is_vertical: false,
            }
        });
        tally.is_vertical = geometry.is_vertical;
        log::debug!(
            "scan {}: {}x{} {}",
            video_id,
            geometry.width,
            geometry.height,
            if geometry.is_vertical { "vertical" } else { "horizontal" }
        );

        let analyzed = self.analyze_frames(video_id, &frames, geometry, tally, progress)?;

        let genuine = tally.surfaces;
        if self.fallback.is_needed(genuine) {
            progress(ScanProgress {
                stage: ScanStage::Fallback,
                frames_done: frames.len(),
                frames_total: frames.len(),
                surfaces: genuine,
            });
            let synthesized = self.fallback.synthesize(video_id, genuine, &analyzed);
            log::info!(
                "scan {}: {} genuine surfaces below minimum; adding {} fallback candidates",
                video_id,
                genuine,
                synthesized.len()
            );
            for surface in &synthesized {
                self.store
                    .insert_detected_surface(surface)
                    .map_err(ScanError::Storage)?;
                tally.surfaces += 1;
            }
        }

        let status = VideoStatus::Ready {
            spots: tally.surfaces,
        };
        self.store
            .update_video_status(video_id, status)
            .map_err(ScanError::Storage)?;
        drop(scratch);
        Ok(status)
    }

    fn analyze_frames(
        &mut self,
        video_id: &str,
        frames: &[ExtractedFrame],
        geometry: FrameGeometry,
        tally: &mut ScanTally,
        progress: &mut dyn FnMut(ScanProgress),
    ) -> Result<Vec<AnalyzedFrame>, ScanError> {
        let detector = Arc::clone(&self.detector);
        let mut detector = lock_detector(&detector);
        let mut analyzed = Vec::with_capacity(frames.len());

        for frame in frames {
            let _cleanup = FrameFile(&frame.path);
            let input = FrameInput {
                video_id,
                path: &frame.path,
                index: frame.index,
                timestamp_secs: frame.timestamp_secs,
                geometry,
            };

            let mut surfaces = self.detect_frame(&mut *detector, &input);
            let inferred = self.inference.apply(&mut surfaces);
            if !surfaces.is_empty() {
                if let Some(url) = self.snapshot(video_id, frame) {
                    for surface in &mut surfaces {
                        surface.frame_url = Some(url.clone());
                    }
                }
            }
            for surface in &surfaces {
                self.store
                    .insert_detected_surface(surface)
                    .map_err(ScanError::Storage)?;
            }
            log::debug!(
                "scan {}: frame {} at {:.1}s -> {} surfaces ({} inferred)",
                video_id,
                frame.index,
                frame.timestamp_secs,
                surfaces.len(),
                inferred
            );

            tally.frames_analyzed += 1;
            tally.surfaces += surfaces.len();
            analyzed.push(AnalyzedFrame {
                timestamp_secs: frame.timestamp_secs,
                surfaces: surfaces.len(),
            });
            progress(ScanProgress {
                stage: ScanStage::Analyzing,
                frames_done: tally.frames_analyzed,
                frames_total: frames.len(),
                surfaces: tally.surfaces,
            });
        }
        Ok(analyzed)
    }

    /// Detection with bounded retry. Failures are absorbed as "no surfaces".
    fn detect_frame(
        &self,
        detector: &mut dyn FrameDetector,
        input: &FrameInput<'_>,
    ) -> Vec<DetectedSurface> {
        let result = self.retry.run(
            || detector.detect(input),
            |attempt, err, delay| {
                log::warn!(
                    "scan {}: frame {} attempt {} failed ({}); retrying in {} ms",
                    input.video_id,
                    input.index,
                    attempt,
                    err,
                    delay.as_millis()
                )
            },
        );
        match result {
            Ok(surfaces) => surfaces,
            Err(err) => {
                log::warn!(
                    "scan {}: frame {} skipped: {}",
                    input.video_id,
                    input.index,
                    describe_detect_error(&err)
                );
                Vec::new()
            }
        }
    }

    /// Source lookup order: request path, resolver, recorded source path,
    /// then `upload_dir/storage_key`. Only existing files count.
    fn resolve_source(&self, request: &ScanRequest, video: &VideoRecord) -> Option<PathBuf> {
        let candidates = [
            request.source_path.clone(),
            self.resolver.resolve(&video.id),
            video.source_path.as_ref().map(PathBuf::from),
            video
                .storage_key
                .as_ref()
                .map(|key| self.settings.upload_dir.join(key)),
        ];
        candidates.into_iter().flatten().find(|path| {
            let found = path.is_file();
            if !found {
                log::debug!("scan {}: no source at {}", video.id, path.display());
            }
            found
        })
    }

    /// Keep a copy of a frame that produced surfaces. Returns its public URL.
    fn snapshot(&self, video_id: &str, frame: &ExtractedFrame) -> Option<String> {
        let snapshots = self.settings.snapshots.as_ref()?;
        let file_name = format!("frame_{:04}.jpg", frame.index);
        let dir = snapshots.dir.join(video_id);
        let copied = fs::create_dir_all(&dir).and_then(|_| fs::copy(&frame.path, dir.join(&file_name)));
        match copied {
            Ok(_) => Some(format!(
                "{}/{}/{}",
                snapshots.base_url.trim_end_matches('/'),
                video_id,
                file_name
            )),
            Err(e) => {
                log::warn!(
                    "scan {}: failed to keep snapshot of frame {}: {}",
                    video_id,
                    frame.index,
                    e
                );
                None
            }
        }
    }
}

fn lock_detector(detector: &SharedDetector) -> MutexGuard<'_, dyn FrameDetector + 'static> {
    detector.lock().unwrap_or_else(|poisoned| {
        log::warn!("detector lock poisoned by an earlier panic; continuing");
        poisoned.into_inner()
    })
}

fn describe_detect_error(err: &DetectError) -> String {
    match err {
        DetectError::RateLimited(_) => format!("{} (quota)", err),
        DetectError::Unauthorized(_) => format!("{} (check API key)", err),
        _ => err.to_string(),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panic: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panic: {}", msg)
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_and_statuses() {
        let no_frames = ScanError::NoFrames;
        assert_eq!(no_frames.to_string(), "No frames extracted");
        assert_eq!(no_frames.kind(), "no_frames");
        assert_eq!(no_frames.terminal_status(), Some(VideoStatus::ScanFailed));

        let disk = ScanError::InsufficientDiskSpace {
            available_mb: 10,
            required_mb: 500,
        };
        assert_eq!(disk.terminal_status(), None);
        assert!(disk.to_string().contains("disk space"));

        let source = ScanError::SourceUnavailable("vid".into());
        assert_eq!(source.terminal_status(), Some(VideoStatus::PendingUpload));
        assert!(source.to_string().contains("re-upload required"));
    }

    #[test]
    fn request_builders() {
        let req = ScanRequest::new("vid").with_source("/tmp/a.mp4").forced();
        assert!(req.force);
        assert_eq!(req.source_path, Some(PathBuf::from("/tmp/a.mp4")));
    }

    #[test]
    fn scratch_dir_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("scan_x_1");
        {
            let scratch = ScratchDir::create(path.clone()).unwrap();
            fs::write(scratch.path.join("frame_0001.jpg"), b"x").unwrap();
        }
        assert!(!path.exists());
    }

    #[test]
    fn panic_payloads_are_described() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "panic: boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "panic: bang");
    }
}
