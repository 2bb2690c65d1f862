//! scannerd - placement scanner daemon
//!
//! This daemon:
//! 1. Polls the database for a user's videos in `Pending Scan`
//! 2. Feeds them to the single-worker job queue
//! 3. Logs job completion events
//! 4. Drains queued jobs and exits on Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use placement_scanner::{
    DetectorRegistry, JobEvent, JobQueue, MapPathResolver, RetryPolicy, ScanOrchestrator,
    ScannerConfig, SqliteSurfaceStore, SurfaceStore,
};

#[derive(Parser, Debug)]
#[command(name = "scannerd", about = "Placement scanner daemon")]
struct Args {
    /// Owner whose pending videos are scanned.
    #[arg(long, env = "SCANNER_USER_ID")]
    user_id: String,

    /// Seconds between database polls.
    #[arg(long, env = "SCANNER_POLL_SECS", default_value_t = 30)]
    poll_secs: u64,

    /// Maximum videos fetched per poll.
    #[arg(long, default_value_t = 10)]
    batch: usize,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = ScannerConfig::load()?;

    let registry = DetectorRegistry::from_config(&cfg)?;
    log::info!("detectors available: {:?}", registry.list());
    let (detector_name, detector) = registry.resolve(&cfg.detector)?;

    let mut orchestrator = ScanOrchestrator::new(
        cfg.scan_settings(),
        Box::new(SqliteSurfaceStore::open(&cfg.db_path)?),
        detector,
    )
    .with_retry_policy(RetryPolicy::from_settings(&cfg.vision));
    if let Some(paths_file) = &cfg.paths_file {
        let resolver = MapPathResolver::from_json_file(paths_file)?;
        log::info!("loaded {} video paths from {}", resolver.len(), paths_file.display());
        orchestrator = orchestrator.with_resolver(resolver);
    }

    let mut poller = SqliteSurfaceStore::open(&cfg.db_path)?;
    let queue = JobQueue::start(orchestrator);
    let events = queue.subscribe();

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!(
        "scannerd running: user {}, detector '{}', db {}, poll every {}s",
        args.user_id,
        detector_name,
        cfg.db_path,
        args.poll_secs
    );

    // video id -> job id, for videos queued but not yet finished
    let mut in_flight: HashMap<String, String> = HashMap::new();
    let poll_interval = Duration::from_secs(args.poll_secs.max(1));

    loop {
        match poller.get_pending_videos(&args.user_id, args.batch) {
            Ok(videos) => {
                for video in videos {
                    if in_flight.contains_key(&video.id) {
                        continue;
                    }
                    match queue.submit(&video.id, None) {
                        Ok(job_id) => {
                            in_flight.insert(video.id, job_id);
                        }
                        Err(err) => log::warn!("could not queue video {}: {}", video.id, err),
                    }
                }
            }
            Err(err) => log::error!("failed to poll pending videos: {:#}", err),
        }

        while let Ok(event) = events.try_recv() {
            log_event(&event);
            in_flight.retain(|_, job_id| job_id.as_str() != event.job_id());
        }

        match shutdown_rx.recv_timeout(poll_interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    log::info!(
        "shutdown signal received, finishing {} queued scans...",
        queue.active_count()
    );
    queue.shutdown()?;
    while let Ok(event) = events.try_recv() {
        log_event(&event);
    }
    Ok(())
}

fn log_event(event: &JobEvent) {
    let outcome = event.outcome();
    match event {
        JobEvent::Completed { job_id, .. } => log::info!(
            "job {} done: video {} has {} surfaces from {} frames",
            job_id,
            outcome.video_id,
            outcome.surfaces_detected,
            outcome.frames_analyzed
        ),
        JobEvent::Failed { job_id, .. } => log::warn!(
            "job {} failed: video {}: {}",
            job_id,
            outcome.video_id,
            outcome.error.as_deref().unwrap_or("unknown error")
        ),
    }
}
