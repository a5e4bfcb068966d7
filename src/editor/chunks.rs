//! Chunk version tracking for non-destructive editing.
//!
//! All editing state lives inside the video's `phase6_editing` output
//! blob: per-chunk version maps (original + replacements + selection),
//! split history for undo, and a probed-duration cache. Old versions stay
//! queryable; the chunk list only ever points at the selected one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clients::registry;
use crate::phases::VideoSpec;
use crate::store::Video;

pub const EDITING_KEY: &str = "phase6_editing";

fn default_selected() -> String {
    "original".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkVersionEntry {
    pub url: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkVersions {
    #[serde(default)]
    pub original: Option<ChunkVersionEntry>,
    #[serde(default)]
    pub replacements: BTreeMap<String, ChunkVersionEntry>,
    #[serde(default = "default_selected")]
    pub current_selected: String,
}

/// Everything needed to undo one split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitRecord {
    pub original_url: String,
    pub original_index: usize,
    pub split_time: f64,
    pub part1_url: String,
    pub part2_url: String,
    pub part1_index: usize,
    pub part2_index: usize,
    pub created_at: String,
}

/// The `phase6_editing` blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditingState {
    #[serde(default)]
    pub chunk_versions: BTreeMap<String, ChunkVersions>,
    #[serde(default)]
    pub split_history: BTreeMap<String, SplitRecord>,
    #[serde(default)]
    pub chunk_durations: BTreeMap<String, f64>,
}

impl EditingState {
    pub fn chunk_key(index: usize) -> String {
        format!("chunk_{}", index)
    }

    pub fn load(video: &Video) -> Self {
        video
            .phase_outputs
            .get(EDITING_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("editing state serializes")
    }

    pub fn versions_mut(&mut self, index: usize) -> &mut ChunkVersions {
        self.chunk_versions
            .entry(Self::chunk_key(index))
            .or_default()
    }

    pub fn versions(&self, index: usize) -> Option<&ChunkVersions> {
        self.chunk_versions.get(&Self::chunk_key(index))
    }

    /// `replacement_{n}` ids are dense; the next one is max + 1.
    pub fn next_replacement_number(&self, index: usize) -> u32 {
        self.versions(index)
            .map(|v| {
                v.replacements
                    .keys()
                    .filter_map(|k| k.strip_prefix("replacement_"))
                    .filter_map(|n| n.parse::<u32>().ok())
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
            + 1
    }

    /// The split record whose first part sits at `index`, if any.
    pub fn split_at(&self, index: usize) -> Option<(&String, &SplitRecord)> {
        self.split_history
            .iter()
            .find(|(_, record)| record.part1_index == index)
    }

    pub fn cache_duration(&mut self, index: usize, duration: f64) {
        self.chunk_durations
            .insert(Self::chunk_key(index), duration);
    }
}

// ── Read views ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ChunkVersionView {
    pub version_id: String,
    pub url: String,
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub cost: Option<f64>,
    pub created_at: Option<String>,
    pub is_selected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkMetadata {
    pub chunk_index: usize,
    pub url: String,
    pub prompt: Option<String>,
    pub model: String,
    pub cost: f64,
    pub duration: f64,
    pub start_time: f64,
    pub versions: Vec<ChunkVersionView>,
    pub current_version: String,
}

/// All versions of one chunk: the original (current list entry), every
/// replacement, and a synthetic split-part version when the chunk came
/// from a split.
pub fn list_versions(video: &Video, state: &EditingState, index: usize) -> Vec<ChunkVersionView> {
    let mut views = Vec::new();
    let list_url = video.chunk_urls.get(index).cloned();
    let tracked = state.versions(index);
    let selected = tracked
        .map(|v| v.current_selected.clone())
        .unwrap_or_else(default_selected);

    // The tracked original wins over the live list entry: once a
    // replacement is selected, the list points at the replacement.
    let original_url = tracked
        .and_then(|v| v.original.as_ref())
        .map(|o| o.url.clone())
        .or_else(|| list_url.clone());
    if let Some(url) = original_url {
        let original = tracked.and_then(|v| v.original.as_ref());
        views.push(ChunkVersionView {
            version_id: "original".into(),
            url,
            prompt: original.and_then(|o| o.prompt.clone()),
            model: original.and_then(|o| o.model.clone()),
            cost: original.and_then(|o| o.cost),
            created_at: original.and_then(|o| o.created_at.clone()),
            is_selected: selected == "original",
        });
    }

    if let Some(tracked) = tracked {
        for (version_id, entry) in &tracked.replacements {
            views.push(ChunkVersionView {
                version_id: version_id.clone(),
                url: entry.url.clone(),
                prompt: entry.prompt.clone(),
                model: entry.model.clone(),
                cost: entry.cost,
                created_at: entry.created_at.clone(),
                is_selected: selected == *version_id,
            });
        }
    }

    // Chunks born from a split get a marker version pointing at the live
    // list entry, so previews and undo have something to show.
    for record in state.split_history.values() {
        let part = if record.part1_index == index {
            Some("split_part1")
        } else if record.part2_index == index {
            Some("split_part2")
        } else {
            None
        };
        if let (Some(part), Some(url)) = (part, video.chunk_urls.get(index)) {
            let any_selected = views.iter().any(|v| v.is_selected);
            views.push(ChunkVersionView {
                version_id: part.to_string(),
                url: url.clone(),
                prompt: None,
                model: None,
                cost: Some(0.0),
                created_at: Some(record.created_at.clone()),
                is_selected: selected == part || !any_selected,
            });
        }
    }

    views
}

/// Metadata for one chunk: selected-version fields, duration from the
/// probe cache (model config otherwise), and the beat-derived prompt.
pub fn chunk_metadata(
    video: &Video,
    state: &EditingState,
    spec: Option<&VideoSpec>,
    index: usize,
) -> Option<ChunkMetadata> {
    let mut url = video.chunk_urls.get(index)?.clone();
    let model_id = spec.map(|s| s.model.as_str()).unwrap_or("hailuo_fast");
    let model = registry::model_or_default(model_id);

    let versions = list_versions(video, state, index);
    let current_version = versions
        .iter()
        .find(|v| v.is_selected)
        .map(|v| v.version_id.clone())
        .unwrap_or_else(default_selected);

    let mut prompt = None;
    let mut cost = 0.0;
    let mut model_name = model.id.to_string();
    if let Some(selected) = versions.iter().find(|v| v.is_selected) {
        if !selected.url.is_empty() {
            url = selected.url.clone();
        }
        prompt = selected.prompt.clone();
        if let Some(c) = selected.cost {
            cost = c;
        }
        if let Some(m) = &selected.model {
            model_name = m.clone();
        }
    }

    let duration_of = |i: usize| {
        state
            .chunk_durations
            .get(&EditingState::chunk_key(i))
            .copied()
            .unwrap_or(model.actual_chunk_duration)
    };
    let duration = duration_of(index);
    let start_time: f64 = (0..index).map(duration_of).sum();

    if prompt.is_none() {
        if let Some(spec) = spec {
            prompt = spec
                .beats
                .iter()
                .find(|b| b.start <= start_time && start_time < b.start + b.duration)
                .map(|b| crate::scheduler::render_prompt(b, spec));
        }
    }

    Some(ChunkMetadata {
        chunk_index: index,
        url,
        prompt,
        model: model_name,
        cost,
        duration,
        start_time,
        versions,
        current_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Db, VideoStatus};

    fn test_video(chunk_urls: Vec<String>) -> Video {
        let db = Db::new_in_memory().unwrap();
        let mut video = db.create_video("u", "p", &[], false).unwrap();
        video.chunk_urls = chunk_urls;
        video.status = VideoStatus::PausedAtPhase(3);
        video
    }

    #[test]
    fn state_round_trips_through_phase_outputs() {
        let mut video = test_video(vec!["s3://b/chunk_00.mp4".into()]);
        let mut state = EditingState::default();
        state.versions_mut(0).replacements.insert(
            "replacement_1".into(),
            ChunkVersionEntry {
                url: "s3://b/chunk_00_r1.mp4".into(),
                prompt: Some("new prompt".into()),
                model: Some("kling".into()),
                cost: Some(0.28),
                created_at: None,
            },
        );
        state.versions_mut(0).current_selected = "replacement_1".into();

        video
            .phase_outputs
            .insert(EDITING_KEY.into(), state.to_value());
        let loaded = EditingState::load(&video);
        assert_eq!(
            loaded.versions(0).unwrap().current_selected,
            "replacement_1"
        );
        assert_eq!(loaded.next_replacement_number(0), 2);
    }

    #[test]
    fn replacement_numbers_count_up_from_one() {
        let state = EditingState::default();
        assert_eq!(state.next_replacement_number(5), 1);
    }

    #[test]
    fn versions_list_marks_selection() {
        let video = test_video(vec!["s3://b/chunk_00.mp4".into()]);
        let mut state = EditingState::default();
        state.versions_mut(0).replacements.insert(
            "replacement_1".into(),
            ChunkVersionEntry {
                url: "s3://b/chunk_00_r1.mp4".into(),
                prompt: None,
                model: None,
                cost: Some(0.25),
                created_at: None,
            },
        );

        let views = list_versions(&video, &state, 0);
        assert_eq!(views.len(), 2);
        assert!(views[0].is_selected, "original selected by default");
        assert!(!views[1].is_selected);

        state.versions_mut(0).current_selected = "replacement_1".into();
        let views = list_versions(&video, &state, 0);
        assert!(!views[0].is_selected);
        assert!(views[1].is_selected);
    }

    #[test]
    fn split_parts_get_synthetic_versions() {
        let video = test_video(vec![
            "s3://b/chunk_00.mp4".into(),
            "s3://b/chunk_01_part1.mp4".into(),
            "s3://b/chunk_01_part2.mp4".into(),
        ]);
        let mut state = EditingState::default();
        state.split_history.insert(
            EditingState::chunk_key(1),
            SplitRecord {
                original_url: "s3://b/chunk_01.mp4".into(),
                original_index: 1,
                split_time: 2.5,
                part1_url: "s3://b/chunk_01_part1.mp4".into(),
                part2_url: "s3://b/chunk_01_part2.mp4".into(),
                part1_index: 1,
                part2_index: 2,
                created_at: "2026-01-01T00:00:00Z".into(),
            },
        );

        let views = list_versions(&video, &state, 1);
        assert!(views.iter().any(|v| v.version_id == "split_part1"));
        let views = list_versions(&video, &state, 2);
        assert!(views.iter().any(|v| v.version_id == "split_part2"));
        assert!(state.split_at(1).is_some());
        assert!(state.split_at(2).is_none());
    }

    #[test]
    fn metadata_uses_duration_cache_for_start_times() {
        let video = test_video(vec![
            "s3://b/chunk_00.mp4".into(),
            "s3://b/chunk_01.mp4".into(),
            "s3://b/chunk_02.mp4".into(),
        ]);
        let mut state = EditingState::default();
        state.cache_duration(0, 2.5);
        state.cache_duration(1, 2.5);

        let meta = chunk_metadata(&video, &state, None, 2).unwrap();
        assert_eq!(meta.start_time, 5.0);
        // Uncached chunk falls back to the model's chunk duration.
        assert_eq!(meta.duration, 5.0);
        assert_eq!(meta.current_version, "original");
    }

    #[test]
    fn metadata_out_of_range_is_none() {
        let video = test_video(vec!["s3://b/chunk_00.mp4".into()]);
        let state = EditingState::default();
        assert!(chunk_metadata(&video, &state, None, 3).is_none());
    }
}
