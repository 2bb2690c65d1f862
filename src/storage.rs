use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::{now_s, BoundingBox, DetectedSurface, VideoRecord, VideoStatus};

/// Persistence gateway. The scan pipeline touches nothing outside this contract.
pub trait SurfaceStore: Send {
    fn get_video_by_id(&mut self, video_id: &str) -> Result<Option<VideoRecord>>;

    /// Videos of `user_id` still in `PendingScan`, oldest first.
    fn get_pending_videos(&mut self, user_id: &str, limit: usize) -> Result<Vec<VideoRecord>>;

    fn update_video_status(&mut self, video_id: &str, status: VideoStatus) -> Result<()>;

    fn clear_detected_surfaces(&mut self, video_id: &str) -> Result<()>;

    fn insert_detected_surface(&mut self, surface: &DetectedSurface) -> Result<()>;
}

pub struct SqliteSurfaceStore {
    conn: Connection,
}

impl SqliteSurfaceStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS videos (
              id TEXT PRIMARY KEY,
              user_id TEXT NOT NULL,
              title TEXT NOT NULL,
              status TEXT NOT NULL,
              source_path TEXT,
              storage_key TEXT,
              created_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS detected_surfaces (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              video_id TEXT NOT NULL REFERENCES videos(id),
              timestamp_secs REAL NOT NULL,
              surface_type TEXT NOT NULL,
              confidence REAL NOT NULL,
              box_x REAL NOT NULL,
              box_y REAL NOT NULL,
              box_width REAL NOT NULL,
              box_height REAL NOT NULL,
              is_inferred INTEGER NOT NULL,
              scene_context TEXT,
              frame_url TEXT,
              created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_videos_user_status ON videos(user_id, status);
            CREATE INDEX IF NOT EXISTS idx_surfaces_video ON detected_surfaces(video_id);
            "#,
        )?;
        Ok(())
    }

    /// Register a video (upload bookkeeping; not part of the scan contract).
    pub fn insert_video(&mut self, video: &VideoRecord) -> Result<()> {
        crate::validate_video_id(&video.id)?;
        let now = now_s() as i64;
        self.conn.execute(
            r#"
            INSERT INTO videos(id, user_id, title, status, source_path, storage_key, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            "#,
            params![
                video.id,
                video.user_id,
                video.title,
                video.status.to_string(),
                video.source_path,
                video.storage_key,
                now
            ],
        )?;
        Ok(())
    }

    /// Persisted surfaces of one video in insertion order.
    pub fn surfaces_for_video(&mut self, video_id: &str) -> Result<Vec<DetectedSurface>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT video_id, timestamp_secs, surface_type, confidence,
                   box_x, box_y, box_width, box_height, is_inferred, scene_context, frame_url
            FROM detected_surfaces WHERE video_id = ?1 ORDER BY id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![video_id], |row| {
            Ok(DetectedSurface {
                video_id: row.get(0)?,
                timestamp_secs: row.get(1)?,
                surface_type: row.get(2)?,
                confidence: row.get::<_, f64>(3)? as f32,
                bounding_box: BoundingBox {
                    x: row.get::<_, f64>(4)? as f32,
                    y: row.get::<_, f64>(5)? as f32,
                    width: row.get::<_, f64>(6)? as f32,
                    height: row.get::<_, f64>(7)? as f32,
                },
                is_inferred: row.get::<_, i64>(8)? != 0,
                scene_context: row.get(9)?,
                frame_url: row.get(10)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

const VIDEO_COLUMNS: &str = "id, user_id, title, status, source_path, storage_key";

fn video_from_row(row: &Row<'_>) -> rusqlite::Result<(VideoRecord, String)> {
    let status: String = row.get(3)?;
    Ok((
        VideoRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            status: VideoStatus::PendingScan,
            source_path: row.get(4)?,
            storage_key: row.get(5)?,
        },
        status,
    ))
}

fn with_status((mut video, status): (VideoRecord, String)) -> Result<VideoRecord> {
    video.status = status
        .parse()
        .map_err(|e| anyhow!("video {}: {}", video.id, e))?;
    Ok(video)
}

impl SurfaceStore for SqliteSurfaceStore {
    fn get_video_by_id(&mut self, video_id: &str) -> Result<Option<VideoRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM videos WHERE id = ?1", VIDEO_COLUMNS),
                params![video_id],
                video_from_row,
            )
            .optional()?;
        row.map(with_status).transpose()
    }

    fn get_pending_videos(&mut self, user_id: &str, limit: usize) -> Result<Vec<VideoRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM videos WHERE user_id = ?1 AND status = ?2 ORDER BY created_at ASC, rowid ASC LIMIT ?3",
            VIDEO_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![user_id, VideoStatus::PendingScan.to_string(), limit],
            video_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(with_status(row?)?);
        }
        Ok(out)
    }

    fn update_video_status(&mut self, video_id: &str, status: VideoStatus) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE videos SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.to_string(), now_s() as i64, video_id],
        )?;
        if updated == 0 {
            return Err(anyhow!("video '{}' not found", video_id));
        }
        Ok(())
    }

    fn clear_detected_surfaces(&mut self, video_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM detected_surfaces WHERE video_id = ?1",
            params![video_id],
        )?;
        Ok(())
    }

    fn insert_detected_surface(&mut self, surface: &DetectedSurface) -> Result<()> {
        let b = surface.bounding_box;
        self.conn.execute(
            r#"
            INSERT INTO detected_surfaces(
              video_id, timestamp_secs, surface_type, confidence,
              box_x, box_y, box_width, box_height, is_inferred, scene_context, frame_url, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                surface.video_id,
                surface.timestamp_secs,
                surface.surface_type,
                f64::from(surface.confidence),
                f64::from(b.x),
                f64::from(b.y),
                f64::from(b.width),
                f64::from(b.height),
                surface.is_inferred as i64,
                surface.scene_context,
                surface.frame_url,
                now_s() as i64
            ],
        )?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    videos: Vec<VideoRecord>,
    surfaces: HashMap<String, Vec<DetectedSurface>>,
    status_history: Vec<(String, VideoStatus)>,
}

/// In-process store. Clones share state, so a test can keep a handle while the
/// orchestrator owns another.
#[derive(Clone, Default)]
pub struct InMemorySurfaceStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemorySurfaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    pub fn insert_video(&self, video: VideoRecord) -> Result<()> {
        crate::validate_video_id(&video.id)?;
        let mut state = self.lock()?;
        if state.videos.iter().any(|v| v.id == video.id) {
            return Err(anyhow!("video '{}' already exists", video.id));
        }
        state.videos.push(video);
        Ok(())
    }

    pub fn surfaces_for_video(&self, video_id: &str) -> Vec<DetectedSurface> {
        self.lock()
            .map(|state| state.surfaces.get(video_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn video(&self, video_id: &str) -> Option<VideoRecord> {
        self.lock()
            .ok()
            .and_then(|state| state.videos.iter().find(|v| v.id == video_id).cloned())
    }

    /// Every status write, in order.
    pub fn status_history(&self, video_id: &str) -> Vec<VideoStatus> {
        self.lock()
            .map(|state| {
                state
                    .status_history
                    .iter()
                    .filter(|(id, _)| id == video_id)
                    .map(|(_, status)| *status)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl SurfaceStore for InMemorySurfaceStore {
    fn get_video_by_id(&mut self, video_id: &str) -> Result<Option<VideoRecord>> {
        Ok(self.lock()?.videos.iter().find(|v| v.id == video_id).cloned())
    }

    fn get_pending_videos(&mut self, user_id: &str, limit: usize) -> Result<Vec<VideoRecord>> {
        Ok(self
            .lock()?
            .videos
            .iter()
            .filter(|v| v.user_id == user_id && v.status == VideoStatus::PendingScan)
            .take(limit)
            .cloned()
            .collect())
    }

    fn update_video_status(&mut self, video_id: &str, status: VideoStatus) -> Result<()> {
        let mut state = self.lock()?;
        let video = state
            .videos
            .iter_mut()
            .find(|v| v.id == video_id)
            .ok_or_else(|| anyhow!("video '{}' not found", video_id))?;
        video.status = status;
        state.status_history.push((video_id.to_string(), status));
        Ok(())
    }

    fn clear_detected_surfaces(&mut self, video_id: &str) -> Result<()> {
        self.lock()?.surfaces.remove(video_id);
        Ok(())
    }

    fn insert_detected_surface(&mut self, surface: &DetectedSurface) -> Result<()> {
        self.lock()?
            .surfaces
            .entry(surface.video_id.clone())
            .or_default()
            .push(surface.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface(video_id: &str, ts: f64) -> DetectedSurface {
        DetectedSurface::new(video_id, ts, "Desk", 0.6, BoundingBox::new(0.1, 0.6, 0.8, 0.3))
            .with_scene_context("horizontal_edge")
    }

    #[test]
    fn sqlite_video_lifecycle() {
        let mut store = SqliteSurfaceStore::open_in_memory().unwrap();
        let mut video = VideoRecord::new("vid_1", "user_a", "Desk tour");
        video.storage_key = Some("vid_1.mp4".to_string());
        store.insert_video(&video).unwrap();
        store
            .insert_video(&VideoRecord::new("vid_2", "user_b", "Other"))
            .unwrap();

        let loaded = store.get_video_by_id("vid_1").unwrap().unwrap();
        assert_eq!(loaded, video);
        assert!(store.get_video_by_id("missing").unwrap().is_none());

        let pending = store.get_pending_videos("user_a", 10).unwrap();
        assert_eq!(pending.len(), 1);

        store
            .update_video_status("vid_1", VideoStatus::Ready { spots: 4 })
            .unwrap();
        let loaded = store.get_video_by_id("vid_1").unwrap().unwrap();
        assert_eq!(loaded.status, VideoStatus::Ready { spots: 4 });
        assert!(store.get_pending_videos("user_a", 10).unwrap().is_empty());
        assert!(store
            .update_video_status("missing", VideoStatus::ScanFailed)
            .is_err());
    }

    #[test]
    fn sqlite_clear_then_insert_replaces_surfaces() {
        let mut store = SqliteSurfaceStore::open_in_memory().unwrap();
        store
            .insert_video(&VideoRecord::new("vid_1", "user_a", "t"))
            .unwrap();
        for ts in [0.0, 2.0, 4.0] {
            store.insert_detected_surface(&surface("vid_1", ts)).unwrap();
        }
        assert_eq!(store.surfaces_for_video("vid_1").unwrap().len(), 3);

        store.clear_detected_surfaces("vid_1").unwrap();
        store.insert_detected_surface(&surface("vid_1", 6.0)).unwrap();
        let rows = store.surfaces_for_video("vid_1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp_secs, 6.0);
        assert_eq!(rows[0].scene_context.as_deref(), Some("horizontal_edge"));
        assert!((rows[0].confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn sqlite_rejects_bad_video_id() {
        let mut store = SqliteSurfaceStore::open_in_memory().unwrap();
        assert!(store
            .insert_video(&VideoRecord::new("../x", "user_a", "t"))
            .is_err());
    }

    #[test]
    fn pending_videos_respect_limit() {
        let mut store = InMemorySurfaceStore::new();
        for i in 0..5 {
            store
                .insert_video(VideoRecord::new(&format!("v{}", i), "u", "t"))
                .unwrap();
        }
        assert_eq!(store.get_pending_videos("u", 2).unwrap().len(), 2);
        store
            .update_video_status("v0", VideoStatus::Scanning)
            .unwrap();
        let pending = store.get_pending_videos("u", 10).unwrap();
        assert_eq!(pending.len(), 4);
        assert_eq!(store.status_history("v0"), vec![VideoStatus::Scanning]);
    }

    #[test]
    fn memory_clones_share_state() {
        let store = InMemorySurfaceStore::new();
        let mut handle = store.clone();
        handle.insert_detected_surface(&surface("v", 1.0)).unwrap();
        assert_eq!(store.surfaces_for_video("v").len(), 1);
        handle.clear_detected_surfaces("v").unwrap();
        assert!(store.surfaces_for_video("v").is_empty());
    }
}
