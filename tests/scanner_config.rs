use placement_scanner::ScannerConfig;
use std::io::Write;
use std::sync::Mutex;
use tempfile::NamedTempFile;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SCANNER_CONFIG",
        "SCANNER_DB_PATH",
        "SCANNER_SCRATCH_DIR",
        "SCANNER_DETECTOR",
        "SCANNER_MIN_FREE_MB",
        "SCANNER_VISION_API_KEY",
        "SCANNER_PATHS_FILE",
        "SCANNER_FFMPEG_PATH",
    ] {
        std::env::remove_var(key);
    }
}

fn lock_env() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[test]
fn json_file_with_env_overrides() {
    let _guard = lock_env();
    clear_env();

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(
        br#"{
  "db_path": "from_file.db",
  "detector": "Vision",
  "extraction": { "interval_secs": 1.5, "max_frames": 12 },
  "fallback": { "min_surfaces": 4, "buffer": 2 },
  "snapshots": { "dir": "/srv/snapshots" }
}"#,
    )
    .unwrap();

    std::env::set_var("SCANNER_CONFIG", file.path());
    std::env::set_var("SCANNER_DB_PATH", "from_env.db");
    std::env::set_var("SCANNER_MIN_FREE_MB", "64");
    std::env::set_var("SCANNER_VISION_API_KEY", " secret-key ");

    let cfg = ScannerConfig::load().unwrap();
    assert_eq!(cfg.db_path, "from_env.db");
    assert_eq!(cfg.detector, "vision");
    assert_eq!(cfg.extraction.interval_secs, 1.5);
    assert_eq!(cfg.extraction.max_frames, 12);
    assert_eq!(cfg.fallback.min_surfaces, 4);
    assert_eq!(cfg.fallback.buffer, 2);
    assert_eq!(cfg.min_free_mb, 64);
    assert_eq!(cfg.vision.api_key.as_deref(), Some("secret-key"));
    let snapshots = cfg.snapshots.expect("snapshots configured");
    assert_eq!(snapshots.base_url, "/snapshots");

    clear_env();
}

#[test]
fn toml_file_is_detected_by_extension() {
    let _guard = lock_env();
    clear_env();

    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(
        br#"
detector = "objects"
upload_dir = "/data/uploads"

[disk]
min_free_mb = 250

[edge]
gradient_threshold = 40
vertical_threshold = 0.5

[objects]
model_path = "/models/yolo.onnx"
"#,
    )
    .unwrap();

    std::env::set_var("SCANNER_CONFIG", file.path());
    std::env::set_var("SCANNER_FFMPEG_PATH", "/opt/ffmpeg/bin/ffmpeg");

    let cfg = ScannerConfig::load().unwrap();
    assert_eq!(cfg.detector, "objects");
    assert_eq!(cfg.upload_dir, std::path::PathBuf::from("/data/uploads"));
    assert_eq!(cfg.min_free_mb, 250);
    assert_eq!(cfg.edge.gradient_threshold, 40);
    assert_eq!(cfg.edge.vertical_threshold, 0.5);
    assert_eq!(
        cfg.objects.model_path.as_deref(),
        Some(std::path::Path::new("/models/yolo.onnx"))
    );
    assert_eq!(cfg.extraction.ffmpeg_path, "/opt/ffmpeg/bin/ffmpeg");

    clear_env();
}

#[test]
fn defaults_without_config_file() {
    let _guard = lock_env();
    clear_env();

    let cfg = ScannerConfig::load().unwrap();
    assert_eq!(cfg.detector, "edge");
    assert_eq!(cfg.min_free_mb, 500);
    assert_eq!(cfg.fallback.min_surfaces, 3);
    assert_eq!(cfg.fallback.confidence, 0.25);
    assert!(cfg.vision.api_key.is_none());
    assert!(cfg.paths_file.is_none());

    clear_env();
}

#[test]
fn rejects_unknown_detector_from_env() {
    let _guard = lock_env();
    clear_env();

    std::env::set_var("SCANNER_DETECTOR", "sonar");
    let err = ScannerConfig::load().unwrap_err();
    assert!(err.to_string().contains("detector must be one of"));

    clear_env();
}

#[test]
fn rejects_malformed_min_free_mb() {
    let _guard = lock_env();
    clear_env();

    std::env::set_var("SCANNER_MIN_FREE_MB", "lots");
    let err = ScannerConfig::load().unwrap_err();
    assert!(err.to_string().contains("SCANNER_MIN_FREE_MB"));

    clear_env();
}

#[test]
fn rejects_fallback_confidence_above_thresholds() {
    let _guard = lock_env();
    clear_env();

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(br#"{ "fallback": { "confidence": 0.6 } }"#)
        .unwrap();
    std::env::set_var("SCANNER_CONFIG", file.path());

    let err = ScannerConfig::load().unwrap_err();
    assert!(err.to_string().contains("fallback.confidence"));

    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = lock_env();
    clear_env();

    std::env::set_var("SCANNER_CONFIG", "/nonexistent/scanner.json");
    let err = ScannerConfig::load().unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));

    clear_env();
}
