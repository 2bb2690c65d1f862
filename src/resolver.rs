use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Maps a video id to a local file, when one is known.
pub trait PathResolver: Send {
    fn resolve(&self, video_id: &str) -> Option<PathBuf>;
}

/// Knows nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPathResolver;

impl PathResolver for NoopPathResolver {
    fn resolve(&self, _video_id: &str) -> Option<PathBuf> {
        None
    }
}

/// Fixed id => path table, usually loaded once at startup.
#[derive(Clone, Debug, Default)]
pub struct MapPathResolver {
    paths: HashMap<String, PathBuf>,
}

impl MapPathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, video_id: impl Into<String>, path: impl Into<PathBuf>) {
        self.paths.insert(video_id.into(), path.into());
    }

    pub fn with(mut self, video_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.insert(video_id, path);
        self
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Load a JSON object of `{"video_id": "/path/to/file.mp4", ...}`.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read paths file {}", path.display()))?;
        let paths: HashMap<String, PathBuf> = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid paths file {}: {}", path.display(), e))?;
        for video_id in paths.keys() {
            crate::validate_video_id(video_id)
                .with_context(|| format!("invalid entry in {}", path.display()))?;
        }
        Ok(Self { paths })
    }
}

impl PathResolver for MapPathResolver {
    fn resolve(&self, video_id: &str) -> Option<PathBuf> {
        self.paths.get(video_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_resolves_known_ids_only() {
        let resolver = MapPathResolver::new().with("vid_1", "/videos/a.mp4");
        assert_eq!(resolver.resolve("vid_1"), Some(PathBuf::from("/videos/a.mp4")));
        assert_eq!(resolver.resolve("vid_2"), None);
        assert_eq!(NoopPathResolver.resolve("vid_1"), None);
    }

    #[test]
    fn loads_json_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paths.json");
        std::fs::write(&path, r#"{"vid_1": "/videos/a.mp4", "vid_2": "b.mov"}"#).unwrap();
        let resolver = MapPathResolver::from_json_file(&path).unwrap();
        assert_eq!(resolver.len(), 2);
        assert_eq!(resolver.resolve("vid_2"), Some(PathBuf::from("b.mov")));
    }

    #[test]
    fn rejects_invalid_ids_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paths.json");
        std::fs::write(&path, r#"{"../vid": "/videos/a.mp4"}"#).unwrap();
        assert!(MapPathResolver::from_json_file(&path).is_err());
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(MapPathResolver::from_json_file(&path).is_err());
    }
}
