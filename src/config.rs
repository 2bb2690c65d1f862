use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DB_PATH: &str = "scanner.db";
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_DETECTOR: &str = "edge";
const DEFAULT_INTERVAL_SECS: f64 = 2.0;
const DEFAULT_MAX_FRAMES: u32 = 30;
const DEFAULT_MAX_DIMENSION: u32 = 1280;
const DEFAULT_QUALITY: u8 = 85;
const DEFAULT_EXTRACTION_TIMEOUT_SECS: u64 = 300;
const DEFAULT_FFMPEG_PATH: &str = "ffmpeg";
const DEFAULT_MIN_FREE_MB: u64 = 500;
const DEFAULT_GRADIENT_THRESHOLD: u8 = 30;
const DEFAULT_MIN_LINE_FRACTION: f32 = 0.30;
const DEFAULT_HORIZONTAL_THRESHOLD: f32 = 0.45;
const DEFAULT_VERTICAL_THRESHOLD: f32 = 0.35;
const DEFAULT_MIN_SURFACES: usize = 3;
const DEFAULT_FALLBACK_BUFFER: usize = 0;
const DEFAULT_FALLBACK_CONFIDENCE: f32 = 0.25;
const DEFAULT_VISION_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_VISION_MODEL: &str = "gemini-1.5-flash";
const DEFAULT_VISION_TIMEOUT_SECS: u64 = 30;
const DEFAULT_VISION_MAX_RETRIES: u32 = 3;
const DEFAULT_VISION_RETRY_BASE_MS: u64 = 1_000;
const DEFAULT_VISION_MAX_DIMENSION: u32 = 1024;
const DEFAULT_OBJECTS_INPUT_SIZE: u32 = 640;

/// Detector strategy names accepted by `detector`.
pub const DETECTOR_NAMES: [&str; 3] = ["edge", "vision", "objects"];

#[derive(Debug, Deserialize, Default)]
struct ScannerConfigFile {
    db_path: Option<String>,
    scratch_dir: Option<PathBuf>,
    upload_dir: Option<PathBuf>,
    detector: Option<String>,
    extraction: Option<ExtractionConfigFile>,
    disk: Option<DiskConfigFile>,
    edge: Option<EdgeConfigFile>,
    fallback: Option<FallbackConfigFile>,
    vision: Option<VisionConfigFile>,
    objects: Option<ObjectsConfigFile>,
    resolver: Option<ResolverConfigFile>,
    snapshots: Option<SnapshotConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ExtractionConfigFile {
    interval_secs: Option<f64>,
    max_frames: Option<u32>,
    max_dimension: Option<u32>,
    quality: Option<u8>,
    timeout_secs: Option<u64>,
    ffmpeg_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DiskConfigFile {
    min_free_mb: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct EdgeConfigFile {
    gradient_threshold: Option<u8>,
    min_line_fraction: Option<f32>,
    horizontal_threshold: Option<f32>,
    vertical_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct FallbackConfigFile {
    min_surfaces: Option<usize>,
    buffer: Option<usize>,
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct VisionConfigFile {
    endpoint: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    retry_base_ms: Option<u64>,
    max_dimension: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ObjectsConfigFile {
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ResolverConfigFile {
    paths_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct SnapshotConfigFile {
    dir: Option<PathBuf>,
    base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub db_path: String,
    pub scratch_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub detector: String,
    pub extraction: ExtractionSettings,
    pub min_free_mb: u64,
    pub edge: EdgeSettings,
    pub fallback: FallbackSettings,
    pub vision: VisionSettings,
    pub objects: ObjectSettings,
    pub paths_file: Option<PathBuf>,
    pub snapshots: Option<SnapshotSettings>,
}

#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub interval_secs: f64,
    pub max_frames: u32,
    pub max_dimension: u32,
    /// JPEG quality, 1..=100.
    pub quality: u8,
    pub timeout: Duration,
    pub ffmpeg_path: String,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
            max_frames: DEFAULT_MAX_FRAMES,
            max_dimension: DEFAULT_MAX_DIMENSION,
            quality: DEFAULT_QUALITY,
            timeout: Duration::from_secs(DEFAULT_EXTRACTION_TIMEOUT_SECS),
            ffmpeg_path: DEFAULT_FFMPEG_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EdgeSettings {
    /// Minimum absolute luma difference between vertically adjacent pixels.
    pub gradient_threshold: u8,
    /// Longest contiguous edge run / row width required for a candidate row.
    pub min_line_fraction: f32,
    pub horizontal_threshold: f32,
    pub vertical_threshold: f32,
}

impl EdgeSettings {
    /// Acceptance threshold for the given orientation.
    pub fn threshold(&self, is_vertical: bool) -> f32 {
        if is_vertical {
            self.vertical_threshold
        } else {
            self.horizontal_threshold
        }
    }
}

impl Default for EdgeSettings {
    fn default() -> Self {
        Self {
            gradient_threshold: DEFAULT_GRADIENT_THRESHOLD,
            min_line_fraction: DEFAULT_MIN_LINE_FRACTION,
            horizontal_threshold: DEFAULT_HORIZONTAL_THRESHOLD,
            vertical_threshold: DEFAULT_VERTICAL_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FallbackSettings {
    /// Fallback runs when fewer surfaces than this were found.
    pub min_surfaces: usize,
    /// Extra placeholders beyond `min_surfaces`.
    pub buffer: usize,
    pub confidence: f32,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            min_surfaces: DEFAULT_MIN_SURFACES,
            buffer: DEFAULT_FALLBACK_BUFFER,
            confidence: DEFAULT_FALLBACK_CONFIDENCE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VisionSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub max_dimension: u32,
}

impl Default for VisionSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_VISION_ENDPOINT.to_string(),
            model: DEFAULT_VISION_MODEL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(DEFAULT_VISION_TIMEOUT_SECS),
            max_retries: DEFAULT_VISION_MAX_RETRIES,
            retry_base: Duration::from_millis(DEFAULT_VISION_RETRY_BASE_MS),
            max_dimension: DEFAULT_VISION_MAX_DIMENSION,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObjectSettings {
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
}

impl Default for ObjectSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            input_size: DEFAULT_OBJECTS_INPUT_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub dir: PathBuf,
    pub base_url: String,
}

/// The subset of configuration a single scan needs.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub scratch_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub min_free_mb: u64,
    pub extraction: ExtractionSettings,
    pub edge: EdgeSettings,
    pub fallback: FallbackSettings,
    pub snapshots: Option<SnapshotSettings>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            min_free_mb: DEFAULT_MIN_FREE_MB,
            extraction: ExtractionSettings::default(),
            edge: EdgeSettings::default(),
            fallback: FallbackSettings::default(),
            snapshots: None,
        }
    }
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("placement-scanner")
}

impl ScannerConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SCANNER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ScannerConfigFile) -> Self {
        let extraction_file = file.extraction.unwrap_or_default();
        let defaults = ExtractionSettings::default();
        let extraction = ExtractionSettings {
            interval_secs: extraction_file
                .interval_secs
                .unwrap_or(defaults.interval_secs),
            max_frames: extraction_file.max_frames.unwrap_or(defaults.max_frames),
            max_dimension: extraction_file
                .max_dimension
                .unwrap_or(defaults.max_dimension),
            quality: extraction_file.quality.unwrap_or(defaults.quality),
            timeout: extraction_file
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            ffmpeg_path: extraction_file.ffmpeg_path.unwrap_or(defaults.ffmpeg_path),
        };

        let edge_file = file.edge.unwrap_or_default();
        let edge_defaults = EdgeSettings::default();
        let edge = EdgeSettings {
            gradient_threshold: edge_file
                .gradient_threshold
                .unwrap_or(edge_defaults.gradient_threshold),
            min_line_fraction: edge_file
                .min_line_fraction
                .unwrap_or(edge_defaults.min_line_fraction),
            horizontal_threshold: edge_file
                .horizontal_threshold
                .unwrap_or(edge_defaults.horizontal_threshold),
            vertical_threshold: edge_file
                .vertical_threshold
                .unwrap_or(edge_defaults.vertical_threshold),
        };

        let fallback_file = file.fallback.unwrap_or_default();
        let fallback_defaults = FallbackSettings::default();
        let fallback = FallbackSettings {
            min_surfaces: fallback_file
                .min_surfaces
                .unwrap_or(fallback_defaults.min_surfaces),
            buffer: fallback_file.buffer.unwrap_or(fallback_defaults.buffer),
            confidence: fallback_file
                .confidence
                .unwrap_or(fallback_defaults.confidence),
        };

        let vision_file = file.vision.unwrap_or_default();
        let vision_defaults = VisionSettings::default();
        let vision = VisionSettings {
            endpoint: vision_file.endpoint.unwrap_or(vision_defaults.endpoint),
            model: vision_file.model.unwrap_or(vision_defaults.model),
            api_key: vision_file.api_key,
            timeout: vision_file
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(vision_defaults.timeout),
            max_retries: vision_file
                .max_retries
                .unwrap_or(vision_defaults.max_retries),
            retry_base: vision_file
                .retry_base_ms
                .map(Duration::from_millis)
                .unwrap_or(vision_defaults.retry_base),
            max_dimension: vision_file
                .max_dimension
                .unwrap_or(vision_defaults.max_dimension),
        };

        let objects_file = file.objects.unwrap_or_default();
        let objects = ObjectSettings {
            model_path: objects_file.model_path,
            input_size: objects_file
                .input_size
                .unwrap_or(DEFAULT_OBJECTS_INPUT_SIZE),
        };

        let snapshots = file.snapshots.and_then(|snap| {
            snap.dir.map(|dir| SnapshotSettings {
                dir,
                base_url: snap.base_url.unwrap_or_else(|| "/snapshots".to_string()),
            })
        });

        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            scratch_dir: file.scratch_dir.unwrap_or_else(default_scratch_dir),
            upload_dir: file
                .upload_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR)),
            detector: file
                .detector
                .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
            extraction,
            min_free_mb: file
                .disk
                .and_then(|disk| disk.min_free_mb)
                .unwrap_or(DEFAULT_MIN_FREE_MB),
            edge,
            fallback,
            vision,
            objects,
            paths_file: file.resolver.and_then(|resolver| resolver.paths_file),
            snapshots,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("SCANNER_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("SCANNER_SCRATCH_DIR") {
            if !dir.trim().is_empty() {
                self.scratch_dir = PathBuf::from(dir);
            }
        }
        if let Ok(detector) = std::env::var("SCANNER_DETECTOR") {
            if !detector.trim().is_empty() {
                self.detector = detector.trim().to_string();
            }
        }
        if let Ok(min_free) = std::env::var("SCANNER_MIN_FREE_MB") {
            self.min_free_mb = min_free
                .trim()
                .parse()
                .map_err(|_| anyhow!("SCANNER_MIN_FREE_MB must be an integer number of MB"))?;
        }
        if let Ok(key) = std::env::var("SCANNER_VISION_API_KEY") {
            if !key.trim().is_empty() {
                self.vision.api_key = Some(key.trim().to_string());
            }
        }
        if let Ok(path) = std::env::var("SCANNER_PATHS_FILE") {
            if !path.trim().is_empty() {
                self.paths_file = Some(PathBuf::from(path));
            }
        }
        if let Ok(path) = std::env::var("SCANNER_FFMPEG_PATH") {
            if !path.trim().is_empty() {
                self.extraction.ffmpeg_path = path;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.detector = self.detector.to_lowercase();
        if !DETECTOR_NAMES.contains(&self.detector.as_str()) {
            return Err(anyhow!(
                "detector must be one of {:?} (got '{}')",
                DETECTOR_NAMES,
                self.detector
            ));
        }
        if !(self.extraction.interval_secs.is_finite() && self.extraction.interval_secs > 0.0) {
            return Err(anyhow!("extraction.interval_secs must be greater than zero"));
        }
        if self.extraction.max_frames == 0 {
            return Err(anyhow!("extraction.max_frames must be greater than zero"));
        }
        if self.extraction.max_dimension == 0 {
            return Err(anyhow!("extraction.max_dimension must be greater than zero"));
        }
        if !(1..=100).contains(&self.extraction.quality) {
            return Err(anyhow!("extraction.quality must be within 1..=100"));
        }
        if self.extraction.timeout.is_zero() {
            return Err(anyhow!("extraction.timeout_secs must be greater than zero"));
        }
        for (name, value) in [
            ("edge.min_line_fraction", self.edge.min_line_fraction),
            ("edge.horizontal_threshold", self.edge.horizontal_threshold),
            ("edge.vertical_threshold", self.edge.vertical_threshold),
            ("fallback.confidence", self.fallback.confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within 0..=1", name));
            }
        }
        let lowest_threshold = self
            .edge
            .horizontal_threshold
            .min(self.edge.vertical_threshold);
        if self.fallback.confidence >= lowest_threshold {
            return Err(anyhow!(
                "fallback.confidence ({}) must stay below the detection thresholds ({})",
                self.fallback.confidence,
                lowest_threshold
            ));
        }
        if self.vision.timeout.is_zero() {
            return Err(anyhow!("vision.timeout_secs must be greater than zero"));
        }
        if self.vision.max_dimension == 0 {
            return Err(anyhow!("vision.max_dimension must be greater than zero"));
        }
        if self.objects.input_size == 0 {
            return Err(anyhow!("objects.input_size must be greater than zero"));
        }
        Ok(())
    }

    /// Settings consumed by the scan orchestrator.
    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            scratch_dir: self.scratch_dir.clone(),
            upload_dir: self.upload_dir.clone(),
            min_free_mb: self.min_free_mb,
            extraction: self.extraction.clone(),
            edge: self.edge,
            fallback: self.fallback,
            snapshots: self.snapshots.clone(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self::from_file(ScannerConfigFile::default())
    }
}

fn read_config_file(path: &Path) -> Result<ScannerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut cfg = ScannerConfig::from_file(ScannerConfigFile::default());
        cfg.validate().unwrap();
        assert_eq!(cfg.detector, "edge");
        assert_eq!(cfg.fallback.min_surfaces, 3);
        assert!(cfg.snapshots.is_none());
    }

    #[test]
    fn rejects_fallback_confidence_at_threshold() {
        let mut cfg = ScannerConfig::from_file(ScannerConfigFile::default());
        cfg.fallback.confidence = cfg.edge.vertical_threshold;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_detector() {
        let mut cfg = ScannerConfig::from_file(ScannerConfigFile::default());
        cfg.detector = "lidar".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_interval() {
        let mut cfg = ScannerConfig::from_file(ScannerConfigFile::default());
        cfg.extraction.interval_secs = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_vision_max_dimension() {
        let mut cfg = ScannerConfig::from_file(ScannerConfigFile::default());
        cfg.vision.max_dimension = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("vision.max_dimension"));
    }

    #[test]
    fn rejects_zero_objects_input_size() {
        let mut cfg = ScannerConfig::from_file(ScannerConfigFile::default());
        cfg.objects.input_size = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("objects.input_size"));
    }

    #[test]
    fn edge_threshold_follows_orientation() {
        let edge = EdgeSettings::default();
        assert_eq!(edge.threshold(true), DEFAULT_VERTICAL_THRESHOLD);
        assert_eq!(edge.threshold(false), DEFAULT_HORIZONTAL_THRESHOLD);
    }
}
