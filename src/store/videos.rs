//! Video row queries. Every read is filtered by owner; the pipeline core
//! mutates rows but never deletes them (deletion is an API surface).

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::models::*;
use super::Db;

const VIDEO_COLUMNS: &str = "id, owner_id, prompt, status, current_phase, progress, auto_continue, \
     cost_usd, error_message, spec, assets, chunk_urls, stitched_url, final_video_url, \
     final_music_url, thumbnail_url, phase_outputs, created_at, completed_at";

impl Db {
    pub fn create_video(
        &self,
        owner_id: &str,
        prompt: &str,
        assets: &[String],
        auto_continue: bool,
    ) -> Result<Video> {
        let id = new_video_id();
        let assets_json = serde_json::to_string(assets).context("Failed to encode assets")?;
        self.conn()
            .execute(
                "INSERT INTO videos (id, owner_id, prompt, auto_continue, assets)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, owner_id, prompt, auto_continue, assets_json],
            )
            .context("Failed to insert video")?;
        self.get_video(&id, owner_id)?
            .context("Video not found after insert")
    }

    /// Unfiltered fetch so callers can distinguish "unknown video" from
    /// "owned by someone else". Surfaces must not hand rows from this to
    /// other owners.
    pub fn get_video_by_id(&self, id: &str) -> Result<Option<Video>> {
        let mut stmt = self
            .conn()
            .prepare(&format!(
                "SELECT {} FROM videos WHERE id = ?1",
                VIDEO_COLUMNS
            ))
            .context("Failed to prepare get_video_by_id")?;
        let row = stmt
            .query_row(params![id], VideoRow::from_row)
            .optional()
            .context("Failed to query video")?;
        row.map(VideoRow::into_video).transpose()
    }

    pub fn get_video(&self, id: &str, owner_id: &str) -> Result<Option<Video>> {
        let mut stmt = self
            .conn()
            .prepare(&format!(
                "SELECT {} FROM videos WHERE id = ?1 AND owner_id = ?2",
                VIDEO_COLUMNS
            ))
            .context("Failed to prepare get_video")?;
        let row = stmt
            .query_row(params![id, owner_id], VideoRow::from_row)
            .optional()
            .context("Failed to query video")?;
        row.map(VideoRow::into_video).transpose()
    }

    pub fn update_video_status(&self, id: &str, status: &VideoStatus, phase: u8) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE videos SET status = ?1, current_phase = ?2 WHERE id = ?3",
                params![status.as_string(), phase, id],
            )
            .context("Failed to update video status")?;
        Ok(())
    }

    pub fn update_video_progress(&self, id: &str, progress: f64) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE videos SET progress = ?1 WHERE id = ?2",
                params![progress, id],
            )
            .context("Failed to update video progress")?;
        Ok(())
    }

    pub fn set_video_failed(&self, id: &str, error: &str) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE videos SET status = 'failed', error_message = ?1 WHERE id = ?2",
                params![error, id],
            )
            .context("Failed to mark video failed")?;
        Ok(())
    }

    pub fn set_video_complete(&self, id: &str) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE videos SET status = 'complete', progress = 100,
                 completed_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?1",
                params![id],
            )
            .context("Failed to mark video complete")?;
        Ok(())
    }

    pub fn update_video_spec(&self, id: &str, spec: &serde_json::Value) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE videos SET spec = ?1 WHERE id = ?2",
                params![spec.to_string(), id],
            )
            .context("Failed to update video spec")?;
        Ok(())
    }

    pub fn update_chunk_urls(&self, id: &str, chunk_urls: &[String]) -> Result<()> {
        let json = serde_json::to_string(chunk_urls).context("Failed to encode chunk urls")?;
        self.conn()
            .execute(
                "UPDATE videos SET chunk_urls = ?1 WHERE id = ?2",
                params![json, id],
            )
            .context("Failed to update chunk urls")?;
        Ok(())
    }

    pub fn set_stitched_url(&self, id: &str, url: &str) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE videos SET stitched_url = ?1 WHERE id = ?2",
                params![url, id],
            )
            .context("Failed to update stitched url")?;
        Ok(())
    }

    pub fn set_final_urls(
        &self,
        id: &str,
        final_video_url: &str,
        final_music_url: Option<&str>,
    ) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE videos SET final_video_url = ?1, final_music_url = ?2 WHERE id = ?3",
                params![final_video_url, final_music_url, id],
            )
            .context("Failed to update final urls")?;
        Ok(())
    }

    pub fn set_thumbnail_url(&self, id: &str, url: &str) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE videos SET thumbnail_url = ?1 WHERE id = ?2",
                params![url, id],
            )
            .context("Failed to update thumbnail url")?;
        Ok(())
    }

    pub fn add_video_cost(&self, id: &str, delta: f64) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE videos SET cost_usd = cost_usd + ?1 WHERE id = ?2",
                params![delta, id],
            )
            .context("Failed to add video cost")?;
        Ok(())
    }

    /// Replace one phase-output blob, keyed `phase1_plan` .. `phase6_editing`.
    pub fn set_phase_output(&self, id: &str, key: &str, value: &serde_json::Value) -> Result<()> {
        let current: Option<String> = self
            .conn()
            .query_row(
                "SELECT phase_outputs FROM videos WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read phase outputs")?;
        let mut outputs: serde_json::Map<String, serde_json::Value> = match current {
            Some(raw) => serde_json::from_str(&raw).context("Failed to parse phase outputs")?,
            None => anyhow::bail!("Video {} not found", id),
        };
        outputs.insert(key.to_string(), value.clone());
        self.conn()
            .execute(
                "UPDATE videos SET phase_outputs = ?1 WHERE id = ?2",
                params![serde_json::Value::Object(outputs).to_string(), id],
            )
            .context("Failed to update phase outputs")?;
        Ok(())
    }

    pub fn delete_video(&self, id: &str, owner_id: &str) -> Result<bool> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM videos WHERE id = ?1 AND owner_id = ?2",
                params![id, owner_id],
            )
            .context("Failed to delete video")?;
        Ok(count > 0)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row struct read from SQLite before converting the status
/// label and the JSON columns into typed values.
struct VideoRow {
    id: String,
    owner_id: String,
    prompt: String,
    status: String,
    current_phase: i64,
    progress: f64,
    auto_continue: bool,
    cost_usd: f64,
    error_message: Option<String>,
    spec: Option<String>,
    assets: String,
    chunk_urls: String,
    stitched_url: Option<String>,
    final_video_url: Option<String>,
    final_music_url: Option<String>,
    thumbnail_url: Option<String>,
    phase_outputs: String,
    created_at: String,
    completed_at: Option<String>,
}

impl VideoRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            prompt: row.get(2)?,
            status: row.get(3)?,
            current_phase: row.get(4)?,
            progress: row.get(5)?,
            auto_continue: row.get(6)?,
            cost_usd: row.get(7)?,
            error_message: row.get(8)?,
            spec: row.get(9)?,
            assets: row.get(10)?,
            chunk_urls: row.get(11)?,
            stitched_url: row.get(12)?,
            final_video_url: row.get(13)?,
            final_music_url: row.get(14)?,
            thumbnail_url: row.get(15)?,
            phase_outputs: row.get(16)?,
            created_at: row.get(17)?,
            completed_at: row.get(18)?,
        })
    }

    fn into_video(self) -> Result<Video> {
        let status = VideoStatus::parse(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse video status")?;
        let spec = self
            .spec
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("Failed to parse video spec JSON")?;
        let assets: Vec<String> =
            serde_json::from_str(&self.assets).context("Failed to parse assets JSON")?;
        let chunk_urls: Vec<String> =
            serde_json::from_str(&self.chunk_urls).context("Failed to parse chunk urls JSON")?;
        let phase_outputs: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&self.phase_outputs)
                .context("Failed to parse phase outputs JSON")?;

        Ok(Video {
            id: self.id,
            owner_id: self.owner_id,
            prompt: self.prompt,
            status,
            current_phase: self.current_phase as u8,
            progress: self.progress,
            auto_continue: self.auto_continue,
            cost_usd: self.cost_usd,
            error_message: self.error_message,
            spec,
            assets,
            chunk_urls,
            stitched_url: self.stitched_url,
            final_video_url: self.final_video_url,
            final_music_url: self.final_music_url,
            thumbnail_url: self.thumbnail_url,
            phase_outputs,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_fetch_video() -> Result<()> {
        let db = Db::new_in_memory()?;
        let video = db.create_video("user-1", "Showcase a chrome kettle", &[], true)?;

        assert!(video.id.starts_with("vid-"));
        assert_eq!(video.owner_id, "user-1");
        assert_eq!(video.status, VideoStatus::Queued);
        assert!(video.auto_continue);
        assert!(video.chunk_urls.is_empty());
        assert!(video.phase_outputs.is_empty());

        let fetched = db.get_video(&video.id, "user-1")?.expect("video exists");
        assert_eq!(fetched.prompt, "Showcase a chrome kettle");
        Ok(())
    }

    #[test]
    fn ownership_filter_hides_foreign_videos() -> Result<()> {
        let db = Db::new_in_memory()?;
        let video = db.create_video("user-1", "prompt", &[], false)?;
        assert!(db.get_video(&video.id, "user-2")?.is_none());
        Ok(())
    }

    #[test]
    fn status_and_progress_updates() -> Result<()> {
        let db = Db::new_in_memory()?;
        let video = db.create_video("u", "p", &[], false)?;

        db.update_video_status(&video.id, &VideoStatus::RunningPhase(2), 2)?;
        db.update_video_progress(&video.id, 33.0)?;
        let fetched = db.get_video(&video.id, "u")?.unwrap();
        assert_eq!(fetched.status, VideoStatus::RunningPhase(2));
        assert_eq!(fetched.current_phase, 2);
        assert_eq!(fetched.progress, 33.0);

        db.set_video_complete(&video.id)?;
        let fetched = db.get_video(&video.id, "u")?.unwrap();
        assert_eq!(fetched.status, VideoStatus::Complete);
        assert_eq!(fetched.progress, 100.0);
        assert!(fetched.completed_at.is_some());
        Ok(())
    }

    #[test]
    fn failed_video_records_error() -> Result<()> {
        let db = Db::new_in_memory()?;
        let video = db.create_video("u", "p", &[], false)?;
        db.set_video_failed(&video.id, "video-model error: 503")?;
        let fetched = db.get_video(&video.id, "u")?.unwrap();
        assert_eq!(fetched.status, VideoStatus::Failed);
        assert_eq!(
            fetched.error_message.as_deref(),
            Some("video-model error: 503")
        );
        Ok(())
    }

    #[test]
    fn phase_outputs_merge_per_key() -> Result<()> {
        let db = Db::new_in_memory()?;
        let video = db.create_video("u", "p", &[], false)?;

        db.set_phase_output(&video.id, "phase1_plan", &serde_json::json!({"status": "success"}))?;
        db.set_phase_output(&video.id, "phase3_chunks", &serde_json::json!({"status": "failed"}))?;

        let fetched = db.get_video(&video.id, "u")?.unwrap();
        assert_eq!(fetched.phase_outputs.len(), 2);
        assert_eq!(
            fetched.phase_outputs["phase1_plan"]["status"],
            serde_json::json!("success")
        );
        Ok(())
    }

    #[test]
    fn cost_accumulates() -> Result<()> {
        let db = Db::new_in_memory()?;
        let video = db.create_video("u", "p", &[], false)?;
        db.add_video_cost(&video.id, 0.25)?;
        db.add_video_cost(&video.id, 0.50)?;
        let fetched = db.get_video(&video.id, "u")?.unwrap();
        assert!((fetched.cost_usd - 0.75).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn delete_requires_owner() -> Result<()> {
        let db = Db::new_in_memory()?;
        let video = db.create_video("u", "p", &[], false)?;
        assert!(!db.delete_video(&video.id, "someone-else")?);
        assert!(db.delete_video(&video.id, "u")?);
        assert!(db.get_video(&video.id, "u")?.is_none());
        Ok(())
    }
}
