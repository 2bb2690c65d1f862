use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use placement_scanner::{ScanProgress, ScanStage};

#[derive(Clone, Copy, Debug)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

/// Terminal feedback for the CLIs: spinners and a frame bar on a TTY, plain
/// `==>` lines otherwise. Always writes to stderr so stdout stays machine-readable.
#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
    disable_pretty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool, disable_pretty: bool) -> Self {
        Self {
            mode,
            is_tty,
            disable_pretty,
        }
    }

    pub fn from_args(ui_flag: Option<&str>, is_tty: bool, disable_pretty: bool) -> Self {
        let mode = match ui_flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        };
        Self::new(mode, is_tty, disable_pretty)
    }

    fn use_pretty(&self) -> bool {
        self.is_tty
            && match self.mode {
                UiMode::Pretty => true,
                UiMode::Auto => !self.disable_pretty,
                UiMode::Plain => false,
            }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.use_pretty() {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    /// Renders orchestrator progress reports for one scan.
    pub fn scan_progress(&self, video_id: &str) -> ScanProgressView {
        ScanProgressView {
            video_id: video_id.to_string(),
            pretty: self.use_pretty(),
            bar: None,
            last_stage: None,
            started: Instant::now(),
        }
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let message = format!("✔ {} ({})", self.name, format_duration(elapsed));
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

pub struct ScanProgressView {
    video_id: String,
    pretty: bool,
    bar: Option<ProgressBar>,
    last_stage: Option<ScanStage>,
    started: Instant,
}

impl ScanProgressView {
    pub fn update(&mut self, progress: ScanProgress) {
        let stage_changed = self.last_stage != Some(progress.stage);
        self.last_stage = Some(progress.stage);

        match progress.stage {
            ScanStage::Analyzing if self.pretty => {
                let bar = self.bar.get_or_insert_with(|| {
                    let bar = ProgressBar::new(progress.frames_total as u64);
                    bar.set_draw_target(ProgressDrawTarget::stderr());
                    let style = ProgressStyle::with_template(
                        "{bar:30} {pos}/{len} frames {msg}",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar());
                    bar.set_style(style);
                    bar
                });
                bar.set_position(progress.frames_done as u64);
                bar.set_message(format!("{} surfaces", progress.surfaces));
            }
            ScanStage::Analyzing => {
                eprintln!(
                    "    frame {}/{} ({} surfaces)",
                    progress.frames_done, progress.frames_total, progress.surfaces
                );
            }
            ScanStage::Completed | ScanStage::Failed => {
                if let Some(bar) = self.bar.take() {
                    bar.finish_and_clear();
                }
                let mark = if progress.stage == ScanStage::Completed {
                    "✔"
                } else {
                    "✘"
                };
                eprintln!(
                    "{} scan {} ({} frames, {} surfaces, {})",
                    mark,
                    self.video_id,
                    progress.frames_done,
                    progress.surfaces,
                    format_duration(self.started.elapsed())
                );
            }
            stage if stage_changed => eprintln!("==> {}", stage_label(stage)),
            _ => {}
        }
    }
}

fn stage_label(stage: ScanStage) -> &'static str {
    match stage {
        ScanStage::Preparing => "Preparing scan",
        ScanStage::Extracting => "Extracting frames",
        ScanStage::Analyzing => "Analyzing frames",
        ScanStage::Fallback => "Adding fallback candidates",
        ScanStage::Completed => "Completed",
        ScanStage::Failed => "Failed",
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
