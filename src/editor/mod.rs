//! Non-destructive chunk editing (phase 6).
//!
//! An edit request is a sequence of actions applied to an in-memory copy
//! of the chunk list: replace (regenerate), select-version, reorder,
//! delete, split, undo-split. The sequence is atomic from the caller's
//! perspective: one failing action aborts the request and nothing is
//! persisted; partially-uploaded blobs are left behind as garbage. After
//! all actions succeed the composite is re-stitched and the video row
//! updated.

pub mod chunks;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::clients::registry;
use crate::deps::Deps;
use crate::errors::PhaseError;
use crate::object_io::{UploadedBlob, video_key};
use crate::phases::VideoSpec;
use crate::scheduler::compute_beat_to_chunk_map;
use crate::scheduler::CHUNK_OVERLAP_FRACTION;
use crate::store::artifacts::NewArtifact;
use crate::store::{ArtifactType, Video};
use chunks::{EDITING_KEY, EditingState, SplitRecord, list_versions};

// ── Actions ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum EditAction {
    Replace {
        chunk_indices: Vec<usize>,
        #[serde(default)]
        new_prompt: Option<String>,
        #[serde(default)]
        new_model: Option<String>,
    },
    SelectVersion {
        chunk_indices: Vec<usize>,
        version: String,
    },
    Reorder {
        new_order: Vec<usize>,
    },
    Delete {
        chunk_indices: Vec<usize>,
    },
    Split {
        chunk_indices: Vec<usize>,
        #[serde(default)]
        split_time: Option<f64>,
        #[serde(default)]
        split_percentage: Option<f64>,
        #[serde(default)]
        split_frame: Option<u64>,
    },
    UndoSplit {
        chunk_indices: Vec<usize>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct EditOutcome {
    pub updated_chunk_urls: Vec<String>,
    pub stitched_url: String,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostEstimate {
    pub video_id: String,
    pub chunk_indices: Vec<usize>,
    pub model: String,
    pub estimated_cost: f64,
    pub estimated_time_seconds: u64,
    pub cost_per_chunk: BTreeMap<usize, f64>,
}

/// Pure cost arithmetic; no billing side-effects.
pub fn estimate_cost(video_id: &str, chunk_indices: &[usize], model_id: &str) -> CostEstimate {
    let model = registry::model_or_default(model_id);
    let cost_per_chunk: BTreeMap<usize, f64> = chunk_indices
        .iter()
        .map(|&i| (i, model.cost_per_generation))
        .collect();
    CostEstimate {
        video_id: video_id.to_string(),
        chunk_indices: chunk_indices.to_vec(),
        model: model.id.to_string(),
        estimated_cost: model.cost_per_generation * chunk_indices.len() as f64,
        estimated_time_seconds: 45 * chunk_indices.len() as u64,
        cost_per_chunk,
    }
}

// ── Pure list operations ──────────────────────────────────────────────

/// Permute the chunk list; the permutation length must match.
pub fn reorder_urls(urls: &[String], new_order: &[usize]) -> Result<Vec<String>, PhaseError> {
    if new_order.len() != urls.len() {
        return Err(PhaseError::Validation(format!(
            "Reorder permutation has {} entries for {} chunks",
            new_order.len(),
            urls.len()
        )));
    }
    let mut seen = vec![false; urls.len()];
    let mut reordered = Vec::with_capacity(urls.len());
    for &i in new_order {
        if i >= urls.len() || seen[i] {
            return Err(PhaseError::Validation(format!(
                "Reorder permutation is not a bijection (index {})",
                i
            )));
        }
        seen[i] = true;
        reordered.push(urls[i].clone());
    }
    Ok(reordered)
}

/// Remove chunks by index, highest first so indices stay valid.
pub fn delete_urls(urls: &[String], indices: &[usize]) -> Vec<String> {
    let mut sorted: Vec<usize> = indices.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    sorted.dedup();
    let mut updated = urls.to_vec();
    for i in sorted {
        if i < updated.len() {
            updated.remove(i);
        }
    }
    updated
}

/// Replace chunk `i` with its two parts.
pub fn splice_split(urls: &[String], index: usize, part1: &str, part2: &str) -> Vec<String> {
    let mut updated = Vec::with_capacity(urls.len() + 1);
    updated.extend_from_slice(&urls[..index]);
    updated.push(part1.to_string());
    updated.push(part2.to_string());
    updated.extend_from_slice(&urls[index + 1..]);
    updated
}

/// Replace the two parts at `index` with the recorded original.
pub fn unsplice_split(urls: &[String], index: usize, original: &str) -> Vec<String> {
    let mut updated = Vec::with_capacity(urls.len() - 1);
    updated.extend_from_slice(&urls[..index]);
    updated.push(original.to_string());
    updated.extend_from_slice(&urls[index + 2..]);
    updated
}

/// Offset of a split, from whichever of time / percentage / frame the
/// caller provided, clamped inside the clip.
pub fn resolve_split_time(
    duration: f64,
    fps: u32,
    split_time: Option<f64>,
    split_percentage: Option<f64>,
    split_frame: Option<u64>,
) -> Result<f64, PhaseError> {
    let at = if let Some(time) = split_time {
        if time <= 0.0 || time >= duration {
            return Err(PhaseError::Validation(format!(
                "Split time {}s is outside the chunk ({}s)",
                time, duration
            )));
        }
        time
    } else if let Some(pct) = split_percentage {
        if pct <= 0.0 || pct >= 100.0 {
            return Err(PhaseError::Validation(format!(
                "Split percentage must be between 0 and 100, got {}",
                pct
            )));
        }
        duration * (pct / 100.0)
    } else if let Some(frame) = split_frame {
        let max_frame = (duration * fps as f64) as u64;
        if frame == 0 || frame >= max_frame {
            return Err(PhaseError::Validation(format!(
                "Split frame {} is outside the chunk ({} frames)",
                frame, max_frame
            )));
        }
        frame as f64 / fps as f64
    } else {
        return Err(PhaseError::Validation(
            "Must provide split_time, split_percentage, or split_frame".into(),
        ));
    };
    Ok(at.clamp(0.1, duration - 0.1))
}

fn first_index(indices: &[usize]) -> Result<usize, PhaseError> {
    indices
        .first()
        .copied()
        .ok_or_else(|| PhaseError::Validation("Action has no chunk index".into()))
}

// ── Service ───────────────────────────────────────────────────────────

pub struct EditingService<'a> {
    deps: &'a Deps,
}

impl<'a> EditingService<'a> {
    pub fn new(deps: &'a Deps) -> Self {
        Self { deps }
    }

    /// Apply all actions, re-stitch, and persist the new chunk list.
    pub async fn process(
        &self,
        owner_id: &str,
        video_id: &str,
        actions: &[EditAction],
    ) -> Result<EditOutcome, PhaseError> {
        let video = self.load_video(owner_id, video_id).await?;
        let spec: Option<VideoSpec> = video
            .spec
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let mut state = EditingState::load(&video);
        let mut updated = video.chunk_urls.clone();
        let mut total_cost = 0.0;

        for action in actions {
            match action {
                EditAction::Replace {
                    chunk_indices,
                    new_prompt,
                    new_model,
                } => {
                    for &index in chunk_indices {
                        if index >= updated.len() {
                            warn!(index, "replace skipping out-of-range chunk");
                            continue;
                        }
                        let spec = spec.as_ref().ok_or_else(|| {
                            PhaseError::Validation("Video has no spec to regenerate from".into())
                        })?;
                        let replacement_number = state.next_replacement_number(index);
                        let (blob, prompt, model_id, cost) = self
                            .regenerate_chunk_blob(
                                &video,
                                spec,
                                &updated,
                                index,
                                new_prompt.as_deref(),
                                new_model.as_deref(),
                                &format!("r{}", replacement_number),
                            )
                            .await?;

                        let version_id = format!("replacement_{}", replacement_number);
                        let versions = state.versions_mut(index);
                        if versions.original.is_none() {
                            versions.original = Some(chunks::ChunkVersionEntry {
                                url: updated[index].clone(),
                                prompt: None,
                                model: None,
                                cost: None,
                                created_at: None,
                            });
                        }
                        versions.replacements.insert(
                            version_id.clone(),
                            chunks::ChunkVersionEntry {
                                url: blob.blob_url.clone(),
                                prompt: Some(prompt),
                                model: Some(model_id),
                                cost: Some(cost),
                                created_at: Some(chrono::Utc::now().to_rfc3339()),
                            },
                        );
                        versions.current_selected = version_id;

                        self.bump_chunk_artifact(video_id, index, &blob).await?;
                        updated[index] = blob.blob_url.clone();
                        total_cost += cost;
                    }
                }

                EditAction::SelectVersion {
                    chunk_indices,
                    version,
                } => {
                    let index = first_index(chunk_indices)?;
                    let views = list_versions(&video, &state, index);
                    let chosen = views
                        .iter()
                        .find(|v| v.version_id == *version)
                        .ok_or_else(|| {
                            PhaseError::Validation(format!(
                                "Chunk {} has no version '{}'",
                                index, version
                            ))
                        })?;
                    if index < updated.len() {
                        updated[index] = chosen.url.clone();
                    }
                    state.versions_mut(index).current_selected = version.clone();
                }

                EditAction::Reorder { new_order } => {
                    updated = reorder_urls(&updated, new_order)?;
                    state.chunk_durations.clear();
                }

                EditAction::Delete { chunk_indices } => {
                    updated = delete_urls(&updated, chunk_indices);
                    state.chunk_durations.clear();
                }

                EditAction::Split {
                    chunk_indices,
                    split_time,
                    split_percentage,
                    split_frame,
                } => {
                    let index = first_index(chunk_indices)?;
                    let url = updated
                        .get(index)
                        .cloned()
                        .ok_or_else(|| {
                            PhaseError::Validation(format!("Chunk index {} out of range", index))
                        })?;
                    let fps = spec.as_ref().map(|s| s.fps).unwrap_or(24);

                    let (part1, part2, at, duration) = self
                        .split_chunk_blob(&video, index, &url, fps, *split_time, *split_percentage, *split_frame)
                        .await?;

                    state.chunk_durations.clear();
                    state.cache_duration(index, at);
                    state.cache_duration(index + 1, duration - at);
                    state.split_history.insert(
                        EditingState::chunk_key(index),
                        SplitRecord {
                            original_url: url.clone(),
                            original_index: index,
                            split_time: at,
                            part1_url: part1.blob_url.clone(),
                            part2_url: part2.blob_url.clone(),
                            part1_index: index,
                            part2_index: index + 1,
                            created_at: chrono::Utc::now().to_rfc3339(),
                        },
                    );
                    updated = splice_split(&updated, index, &part1.blob_url, &part2.blob_url);
                }

                EditAction::UndoSplit { chunk_indices } => {
                    let index = first_index(chunk_indices)?;
                    let (key, record) = state
                        .split_at(index)
                        .map(|(k, r)| (k.clone(), r.clone()))
                        .ok_or_else(|| {
                            PhaseError::Validation(format!(
                                "Chunk {} is not the first part of a split",
                                index
                            ))
                        })?;
                    if index + 1 >= updated.len() {
                        return Err(PhaseError::Integrity(format!(
                            "Second split part missing at index {}",
                            index + 1
                        )));
                    }
                    updated = unsplice_split(&updated, index, &record.original_url);
                    state.split_history.remove(&key);
                    state.chunk_durations.clear();
                }
            }
        }

        info!(video_id, actions = actions.len(), chunks = updated.len(), "edits applied, re-stitching");
        let stitched_url =
            crate::phases::chunks::stitch_chunks(self.deps, owner_id, video_id, &updated).await?;

        let outcome = EditOutcome {
            updated_chunk_urls: updated.clone(),
            stitched_url: stitched_url.clone(),
            total_cost,
        };
        {
            let video_id = video_id.to_string();
            let state_value = state.to_value();
            let music_url = video.final_music_url.clone();
            self.deps
                .db
                .call(move |db| {
                    db.update_chunk_urls(&video_id, &updated)?;
                    db.set_stitched_url(&video_id, &stitched_url)?;
                    db.set_final_urls(&video_id, &stitched_url, music_url.as_deref())?;
                    db.set_phase_output(&video_id, EDITING_KEY, &state_value)?;
                    if total_cost > 0.0 {
                        db.add_video_cost(&video_id, total_cost)?;
                    }
                    Ok(())
                })
                .await
                .map_err(PhaseError::Other)?;
        }

        Ok(outcome)
    }

    async fn load_video(&self, owner_id: &str, video_id: &str) -> Result<Video, PhaseError> {
        let owner = owner_id.to_string();
        let id = video_id.to_string();
        self.deps
            .db
            .call(move |db| db.get_video(&id, &owner))
            .await
            .map_err(PhaseError::Other)?
            .ok_or_else(|| PhaseError::Validation("Video not found".into()))
    }

    /// Regenerate one chunk's blob. Anchor chunks (per the current beat
    /// map) are conditioned on their storyboard frame; continuations on
    /// the preceding chunk's freshly extracted last frame. Blob keys are
    /// tagged so earlier versions stay addressable.
    pub async fn regenerate_chunk_blob(
        &self,
        video: &Video,
        spec: &VideoSpec,
        chunk_urls: &[String],
        index: usize,
        prompt_override: Option<&str>,
        model_override: Option<&str>,
        blob_tag: &str,
    ) -> Result<(UploadedBlob, String, String, f64), PhaseError> {
        let model = registry::model_or_default(model_override.unwrap_or(&spec.model));
        let chunk_spacing = model.actual_chunk_duration * (1.0 - CHUNK_OVERLAP_FRACTION);
        let beat_map =
            compute_beat_to_chunk_map(&spec.beats, chunk_spacing, chunk_urls.len().max(1));

        let anchor_image = beat_map
            .get(&index)
            .and_then(|&b| spec.beats.get(b))
            .and_then(|beat| beat.image_url.clone());

        let init_ref = match anchor_image {
            Some(url) => url,
            None if index > 0 => {
                let prev_url = chunk_urls.get(index - 1).ok_or_else(|| {
                    PhaseError::Validation(format!("No preceding chunk for index {}", index))
                })?;
                self.extract_last_frame_blob(video, index - 1, prev_url).await?
            }
            None => {
                return Err(PhaseError::Integrity(
                    "Chunk 0 has no storyboard image to regenerate from".into(),
                ));
            }
        };

        let start_time = index as f64 * chunk_spacing;
        let beat = spec
            .beats
            .iter()
            .find(|b| b.start <= start_time && start_time < b.start + b.duration)
            .or_else(|| spec.beats.last())
            .ok_or_else(|| PhaseError::Integrity("Spec has zero beats".into()))?;
        let prompt = prompt_override
            .map(str::to_string)
            .unwrap_or_else(|| crate::scheduler::render_prompt(beat, spec));

        let init_url = if init_ref.starts_with("http") {
            init_ref
        } else {
            self.deps
                .objects
                .presign(&init_ref, self.deps.config.presign_ttl)
                .await?
        };
        let clip = self
            .deps
            .video_model
            .generate(model, &init_url, &prompt, model.actual_chunk_duration, spec.fps)
            .await?;

        let key = video_key(
            &video.owner_id,
            &video.id,
            &format!("chunk_{:02}_{}.mp4", index, blob_tag),
        );
        let blob = self.deps.objects.upload_file(&clip, &key).await?;
        Ok((
            blob,
            prompt,
            model.id.to_string(),
            model.cost_per_generation,
        ))
    }

    async fn extract_last_frame_blob(
        &self,
        video: &Video,
        index: usize,
        chunk_url: &str,
    ) -> Result<String, PhaseError> {
        let clip = self.deps.objects.download_temp(chunk_url).await?;
        let frame = tempfile::Builder::new()
            .prefix("vidforge-frame-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| PhaseError::Media(format!("Failed to create frame file: {}", e)))?
            .into_temp_path();
        self.deps.media.extract_last_frame(&clip, &frame).await?;

        let key = video_key(
            &video.owner_id,
            &video.id,
            &format!("frames/last_frame_{:02}.png", index),
        );
        let blob = self.deps.objects.upload_file(&frame, &key).await?;
        Ok(blob.blob_url)
    }

    async fn split_chunk_blob(
        &self,
        video: &Video,
        index: usize,
        url: &str,
        fps: u32,
        split_time: Option<f64>,
        split_percentage: Option<f64>,
        split_frame: Option<u64>,
    ) -> Result<(UploadedBlob, UploadedBlob, f64, f64), PhaseError> {
        let clip = self.deps.objects.download_temp(url).await?;
        let duration = self.deps.media.probe(&clip).await?.duration;
        let at = resolve_split_time(duration, fps, split_time, split_percentage, split_frame)?;

        let scratch = tempfile::tempdir()
            .map_err(|e| PhaseError::Media(format!("Failed to create scratch dir: {}", e)))?;
        let part1_path = scratch.path().join("part1.mp4");
        let part2_path = scratch.path().join("part2.mp4");
        self.deps.media.split(&clip, at, &part1_path, &part2_path).await?;

        let part1_key = video_key(
            &video.owner_id,
            &video.id,
            &format!("chunk_{:02}_part1.mp4", index),
        );
        let part2_key = video_key(
            &video.owner_id,
            &video.id,
            &format!("chunk_{:02}_part2.mp4", index),
        );
        let part1 = self.deps.objects.upload_file(&part1_path, &part1_key).await?;
        let part2 = self.deps.objects.upload_file(&part2_path, &part2_key).await?;

        info!(index, at, duration, "chunk split");
        Ok((part1, part2, at, duration))
    }

    /// Insert a new artifact version for a regenerated chunk on the
    /// video's most recent phase-3 checkpoint.
    async fn bump_chunk_artifact(
        &self,
        video_id: &str,
        index: usize,
        blob: &UploadedBlob,
    ) -> Result<(), PhaseError> {
        let video_id = video_id.to_string();
        let blob = blob.clone();
        self.deps
            .db
            .call(move |db| {
                let checkpoint = db
                    .list_checkpoints(&video_id, None)?
                    .into_iter()
                    .filter(|cp| cp.phase_number == crate::phases::PHASE_CHUNKS)
                    .next_back();
                let Some(checkpoint) = checkpoint else {
                    return Ok(());
                };
                let key = format!("chunk_{}", index);
                let parent = db.latest_artifact(&checkpoint.id, ArtifactType::VideoChunk, &key)?;
                let version =
                    db.next_artifact_version(&checkpoint.id, ArtifactType::VideoChunk, &key)?;
                db.create_artifact(NewArtifact {
                    checkpoint_id: &checkpoint.id,
                    artifact_type: ArtifactType::VideoChunk,
                    artifact_key: &key,
                    blob_url: &blob.blob_url,
                    blob_key: &blob.blob_key,
                    version,
                    parent_artifact_id: parent.as_ref().map(|a| a.id.as_str()),
                    metadata: Some(&serde_json::json!({"sha256": blob.sha256})),
                    size_bytes: Some(blob.size_bytes),
                })?;
                Ok(())
            })
            .await
            .map_err(PhaseError::Other)
    }
}
