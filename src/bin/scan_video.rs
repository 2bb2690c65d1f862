//! scan_video - scan one video for placement surfaces and print the outcome.
//!
//! The outcome is written to stdout as JSON; progress goes to stderr. The
//! process exits non-zero when the scan did not succeed.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::io::IsTerminal;
use std::path::PathBuf;

use placement_scanner::{
    DetectedSurface, DetectorRegistry, MapPathResolver, RetryPolicy, ScanOrchestrator,
    ScanOutcome, ScanRequest, ScannerConfig, SqliteSurfaceStore, SurfaceStore, VideoRecord,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(name = "scan_video", about = "Scan a video for placement surfaces")]
struct Args {
    /// Video id (as registered in the database).
    video_id: String,

    /// Local video file; otherwise resolved from the paths file or upload metadata.
    #[arg(long)]
    source: Option<PathBuf>,

    /// Database path (overrides config).
    #[arg(long, env = "SCANNER_DB_PATH")]
    db: Option<String>,

    /// Detector strategy: edge, vision or objects (overrides config).
    #[arg(long)]
    detector: Option<String>,

    /// Register the video first when it is not in the database.
    #[arg(long)]
    register: bool,

    /// Owner recorded by --register.
    #[arg(long, default_value = "local")]
    user_id: String,

    /// Title recorded by --register.
    #[arg(long)]
    title: Option<String>,

    /// Rescan even if the video is not pending.
    #[arg(long)]
    force: bool,

    /// Include the persisted surfaces in the JSON output.
    #[arg(long)]
    show_surfaces: bool,

    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

#[derive(Serialize)]
struct Report<'a> {
    #[serde(flatten)]
    outcome: &'a ScanOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    surfaces: Option<Vec<DetectedSurface>>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, false);

    let mut cfg = {
        let _stage = ui.stage("Load configuration");
        ScannerConfig::load()?
    };
    if let Some(db) = &args.db {
        cfg.db_path = db.clone();
    }
    if let Some(detector) = &args.detector {
        cfg.detector = detector.trim().to_lowercase();
    }

    let mut store = SqliteSurfaceStore::open(&cfg.db_path)?;
    if args.register && store.get_video_by_id(&args.video_id)?.is_none() {
        let mut video = VideoRecord::new(
            &args.video_id,
            &args.user_id,
            args.title.as_deref().unwrap_or(&args.video_id),
        );
        video.source_path = args
            .source
            .as_ref()
            .map(|path| path.to_string_lossy().into_owned());
        store
            .insert_video(&video)
            .with_context(|| format!("failed to register video {}", args.video_id))?;
        log::info!("registered video {} for user {}", video.id, video.user_id);
    }

    let (detector_name, detector) = {
        let _stage = ui.stage("Prepare detector");
        let registry = DetectorRegistry::from_config(&cfg)?;
        registry.resolve(&cfg.detector)?
    };
    log::info!("using detector '{}'", detector_name);

    let mut orchestrator = ScanOrchestrator::new(cfg.scan_settings(), Box::new(store), detector)
        .with_retry_policy(RetryPolicy::from_settings(&cfg.vision));
    if let Some(paths_file) = &cfg.paths_file {
        orchestrator = orchestrator.with_resolver(MapPathResolver::from_json_file(paths_file)?);
    }

    let mut request = ScanRequest::new(args.video_id.as_str());
    request.source_path = args.source.clone();
    request.force = args.force;

    let mut view = ui.scan_progress(&args.video_id);
    let outcome = orchestrator.process_video_scan(&request, &mut |progress| view.update(progress));

    let surfaces = if args.show_surfaces {
        Some(SqliteSurfaceStore::open(&cfg.db_path)?.surfaces_for_video(&args.video_id)?)
    } else {
        None
    };
    let report = Report {
        outcome: &outcome,
        surfaces,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}
