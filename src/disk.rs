//! Scratch-space probe.
//!
//! The orchestrator consults a `DiskProbe` before any temp directory is created.
//! Probing is best-effort: when the filesystem cannot be queried the probe
//! reports `ASSUMED_AVAILABLE_MB` so a broken probe never blocks scanning.

use std::path::Path;

/// Reported when the free-space query fails.
pub const ASSUMED_AVAILABLE_MB: u64 = 10 * 1024;

/// Reports available space (in MB) on the volume holding `path`.
pub trait DiskProbe: Send {
    fn available_mb(&self, path: &Path) -> u64;
}

/// `statvfs(3)`-backed probe.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatvfsProbe;

impl DiskProbe for StatvfsProbe {
    fn available_mb(&self, path: &Path) -> u64 {
        // The scratch root may not exist yet; walk up to the nearest existing ancestor.
        let probe_path = path.ancestors().find(|p| p.exists()).unwrap_or(path);
        match available_bytes(probe_path) {
            Some(bytes) => bytes / (1024 * 1024),
            None => {
                log::warn!(
                    "disk probe failed for {}; assuming {} MB available",
                    probe_path.display(),
                    ASSUMED_AVAILABLE_MB
                );
                ASSUMED_AVAILABLE_MB
            }
        }
    }
}

#[cfg(unix)]
fn available_bytes(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: `c_path` is NUL-terminated and `stat` points to writable storage
    // of the right size; the struct is only read after a zero return.
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if ret != 0 {
        return None;
    }
    let stat = unsafe { stat.assume_init() };
    #[allow(clippy::unnecessary_cast)]
    let bytes = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
    Some(bytes)
}

#[cfg(not(unix))]
fn available_bytes(_path: &Path) -> Option<u64> {
    None
}

/// Fixed-answer probe for tests and dry runs.
#[derive(Clone, Copy, Debug)]
pub struct FixedDiskProbe(pub u64);

impl DiskProbe for FixedDiskProbe {
    fn available_mb(&self, _path: &Path) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statvfs_probe_reports_space_for_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mb = StatvfsProbe.available_mb(dir.path());
        assert!(mb > 0);
    }

    #[test]
    fn statvfs_probe_walks_up_to_existing_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not").join("created").join("yet");
        assert!(StatvfsProbe.available_mb(&missing) > 0);
    }

    #[test]
    fn fixed_probe_returns_value() {
        assert_eq!(FixedDiskProbe(42).available_mb(Path::new("/")), 42);
    }
}
