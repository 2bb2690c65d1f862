//! Frame extraction through an external `ffmpeg` process.
//!
//! The decoder writes `frame_%04d.jpg` into the scratch directory at
//! `1/interval` fps, scaled so the longest side is at most `max_dimension`.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use super::{collect_frames, ExtractError, ExtractRequest, ExtractedFrame, FrameExtractor};
use crate::config::ExtractionSettings;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_STDERR_CHARS: usize = 2_000;

/// `ffmpeg`-backed extractor with a hard wall-clock timeout.
#[derive(Clone, Debug)]
pub struct FfmpegExtractor {
    binary: String,
    timeout: Duration,
}

impl FfmpegExtractor {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &ExtractionSettings) -> Self {
        Self::new(settings.ffmpeg_path.clone(), settings.timeout)
    }

    fn run(&self, args: &[String]) -> Result<(), ExtractError> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(ExtractError::Spawn)?;

        // Drain stderr on a side thread so a chatty decoder cannot block on a full pipe.
        let stderr = child.stderr.take();
        let stderr_reader = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf);
            }
            buf
        });

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stderr_reader.join();
                return Err(ExtractError::TimedOut {
                    timeout_secs: self.timeout.as_secs(),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let stderr = stderr_reader.join().unwrap_or_default();
        if !status.success() {
            return Err(ExtractError::Failed {
                exit_code: status.code(),
                stderr: truncate_chars(stderr.trim(), MAX_STDERR_CHARS),
            });
        }
        Ok(())
    }
}

impl FrameExtractor for FfmpegExtractor {
    fn extract(&self, request: &ExtractRequest) -> Result<Vec<ExtractedFrame>, ExtractError> {
        if !request.source.is_file() {
            return Err(ExtractError::SourceMissing(request.source.clone()));
        }
        std::fs::create_dir_all(&request.output_dir)?;

        let args = decode_args(request);
        self.run(&args)?;

        collect_frames(
            &request.output_dir,
            request.interval_secs,
            request.max_frames,
        )
    }
}

/// Build the decoder argument list for a request.
pub fn decode_args(request: &ExtractRequest) -> Vec<String> {
    let fps = 1.0 / request.interval_secs;
    let dim = request.max_dimension;
    let filter = format!(
        "fps={fps:.6},scale=w='min({dim},iw)':h='min({dim},ih)':force_original_aspect_ratio=decrease"
    );
    let pattern: PathBuf = request.output_dir.join("frame_%04d.jpg");

    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-y".to_string(),
        "-i".to_string(),
        request.source.to_string_lossy().to_string(),
        "-vf".to_string(),
        filter,
        "-frames:v".to_string(),
        request.max_frames.to_string(),
        "-q:v".to_string(),
        jpeg_qscale(request.quality).to_string(),
        pattern.to_string_lossy().to_string(),
    ]
}

/// Map 1..=100 quality onto ffmpeg's JPEG qscale (2 = best, 31 = worst).
fn jpeg_qscale(quality: u8) -> u32 {
    let quality = u32::from(quality.clamp(1, 100));
    2 + (100 - quality) * 29 / 99
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn request(dir: &Path, source: PathBuf) -> ExtractRequest {
        ExtractRequest {
            source,
            output_dir: dir.join("frames"),
            interval_secs: 2.0,
            max_frames: 30,
            max_dimension: 1280,
            quality: 85,
        }
    }

    #[test]
    fn qscale_covers_full_range() {
        assert_eq!(jpeg_qscale(100), 2);
        assert_eq!(jpeg_qscale(1), 31);
        assert_eq!(jpeg_qscale(0), 31);
        assert!(jpeg_qscale(85) < jpeg_qscale(50));
    }

    #[test]
    fn decode_args_carry_rate_scale_and_cap() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), PathBuf::from("/videos/in.mp4"));
        let args = decode_args(&req);
        let vf = &args[args.iter().position(|a| a == "-vf").unwrap() + 1];
        assert!(vf.starts_with("fps=0.500000,"));
        assert!(vf.contains("min(1280,iw)"));
        let frames = &args[args.iter().position(|a| a == "-frames:v").unwrap() + 1];
        assert_eq!(frames, "30");
        assert!(args.last().unwrap().ends_with("frame_%04d.jpg"));
    }

    #[test]
    fn missing_source_fails_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = FfmpegExtractor::new("definitely-not-a-real-binary", Duration::from_secs(5));
        let req = request(dir.path(), dir.path().join("missing.mp4"));
        let err = extractor.extract(&req).unwrap_err();
        assert!(matches!(err, ExtractError::SourceMissing(_)));
        assert!(!req.output_dir.exists());
    }

    #[test]
    fn missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.mp4");
        std::fs::write(&source, b"not really a video").unwrap();
        let extractor = FfmpegExtractor::new("definitely-not-a-real-binary", Duration::from_secs(5));
        let err = extractor.extract(&request(dir.path(), source)).unwrap_err();
        assert!(matches!(err, ExtractError::Spawn(_)));
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.mp4");
        std::fs::write(&source, b"x").unwrap();
        let extractor = FfmpegExtractor::new("false", Duration::from_secs(5));
        let err = extractor.extract(&request(dir.path(), source)).unwrap_err();
        assert!(matches!(err, ExtractError::Failed { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn slow_decoder_is_killed_at_timeout() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-decoder.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 10\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let source = dir.path().join("in.mp4");
        std::fs::write(&source, b"x").unwrap();

        let extractor = FfmpegExtractor::new(
            script.to_string_lossy().to_string(),
            Duration::from_millis(200),
        );
        let started = Instant::now();
        let err = extractor.extract(&request(dir.path(), source)).unwrap_err();
        assert!(matches!(err, ExtractError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
