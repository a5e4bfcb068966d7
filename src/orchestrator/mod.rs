//! Request orchestration: generate/continue/edit/status/delete, artifact
//! edits with phase gating, and the per-video pipeline task loop.
//!
//! One pipeline task per video is in flight at a time; the in-flight map
//! is the serialisation point that keeps continues and edits from racing
//! a running phase. Auto-continue (YOLO) keeps the loop advancing through
//! all four phases inside a single task; manual mode pauses after each
//! checkpoint until `/continue`.

pub mod status;

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::deps::Deps;
use crate::editor::chunks::{ChunkVersionEntry, EDITING_KEY, EditingState};
use crate::editor::{CostEstimate, EditAction, EditOutcome, EditingService, estimate_cost};
use crate::errors::PhaseError;
use crate::object_io::{video_key, video_prefix};
use crate::phases::{
    self, AudioSpec, Beat, PhaseContext, PhaseOutput, Product, Style, TERMINAL_PHASE, VideoSpec,
    phase_key,
};
use crate::progress::ProgressDoc;
use crate::store::artifacts::NewArtifact;
use crate::store::{Artifact, ArtifactType, Checkpoint, Video, VideoStatus};

// ── Errors ────────────────────────────────────────────────────────────

/// Caller-facing failures; the API layer maps these onto status codes.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("{0}")]
    Validation(String),

    #[error("Not authorized for this resource")]
    Ownership,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<PhaseError> for RequestError {
    fn from(e: PhaseError) -> Self {
        match e.kind() {
            "validation" => Self::Validation(e.to_string()),
            _ => Self::Internal(anyhow::anyhow!(e)),
        }
    }
}

// ── Requests / responses ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub assets: Vec<String>,
    #[serde(default)]
    pub auto_continue: bool,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub fps: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ContinueResponse {
    pub next_phase: u8,
    pub branch: String,
    pub forked: bool,
}

#[derive(Debug, Deserialize)]
pub struct EditRequest {
    pub actions: Vec<EditAction>,
    #[serde(default)]
    pub estimate_cost_only: bool,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum EditingResponse {
    Estimate(CostEstimate),
    Applied(EditOutcome),
}

#[derive(Debug, Default, Deserialize)]
pub struct SpecPatch {
    #[serde(default)]
    pub style: Option<Style>,
    #[serde(default)]
    pub audio: Option<AudioSpec>,
    #[serde(default)]
    pub beats: Option<Vec<Beat>>,
    #[serde(default)]
    pub product: Option<Product>,
}

#[derive(Debug, Serialize)]
pub struct ArtifactEditResponse {
    pub artifact_id: String,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_url: Option<String>,
}

// ── Orchestrator ──────────────────────────────────────────────────────

pub struct Orchestrator {
    deps: Arc<Deps>,
    running: Arc<tokio::sync::Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl Orchestrator {
    pub fn new(deps: Arc<Deps>) -> Self {
        Self {
            deps,
            running: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn deps(&self) -> &Arc<Deps> {
        &self.deps
    }

    /// True while a pipeline task for this video is in flight. Finished
    /// handles are reaped here.
    pub async fn is_busy(&self, video_id: &str) -> bool {
        let mut running = self.running.lock().await;
        match running.get(video_id) {
            Some(handle) if handle.is_finished() => {
                running.remove(video_id);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Abort all in-flight pipeline tasks (server shutdown).
    pub async fn shutdown(&self) {
        let mut running = self.running.lock().await;
        for (video_id, handle) in running.drain() {
            info!(video_id, "aborting pipeline task on shutdown");
            handle.abort();
        }
    }

    async fn spawn_pipeline(&self, start_phase: u8, ctx: PhaseContext) {
        let deps = Arc::clone(&self.deps);
        let running = Arc::clone(&self.running);
        let video_id = ctx.video_id.clone();
        let handle = tokio::spawn(run_pipeline(deps, start_phase, ctx));
        running.lock().await.insert(video_id, handle);
    }

    // ── Generate ──────────────────────────────────────────────────

    pub async fn generate(
        &self,
        owner_id: &str,
        request: GenerateRequest,
    ) -> Result<Video, RequestError> {
        if request.prompt.trim().is_empty() {
            return Err(RequestError::Validation("Prompt must not be empty".into()));
        }
        let duration = request.duration_seconds.unwrap_or(20.0);
        if duration <= 0.0 || duration > 600.0 {
            return Err(RequestError::Validation(
                "duration_seconds must be within (0, 600]".into(),
            ));
        }

        let seed = phases::plan::seed_spec(
            duration,
            request.model.as_deref().unwrap_or("hailuo_fast"),
            request.fps.unwrap_or(24),
        );
        let video = {
            let owner = owner_id.to_string();
            let prompt = request.prompt.clone();
            let assets = request.assets.clone();
            let auto_continue = request.auto_continue;
            let seed_value = serde_json::to_value(&seed).expect("seed serializes");
            self.deps
                .db
                .call(move |db| {
                    let video = db.create_video(&owner, &prompt, &assets, auto_continue)?;
                    db.update_video_spec(&video.id, &seed_value)?;
                    db.get_video(&video.id, &owner)?
                        .ok_or_else(|| anyhow::anyhow!("Video vanished after insert"))
                })
                .await?
        };

        info!(video_id = %video.id, owner_id, auto_continue = request.auto_continue, "video queued");
        self.spawn_pipeline(
            phases::PHASE_PLAN,
            PhaseContext {
                video_id: video.id.clone(),
                owner_id: owner_id.to_string(),
                branch: "main".to_string(),
                version: 1,
                parent_checkpoint_id: None,
            },
        )
        .await;

        Ok(video)
    }

    // ── Continue ──────────────────────────────────────────────────

    pub async fn continue_from_checkpoint(
        &self,
        owner_id: &str,
        video_id: &str,
        checkpoint_id: &str,
    ) -> Result<ContinueResponse, RequestError> {
        let _video = self.load_video(owner_id, video_id).await?;
        if self.is_busy(video_id).await {
            return Err(RequestError::Validation(
                "A pipeline task is already running for this video".into(),
            ));
        }

        let checkpoint = self.load_checkpoint(owner_id, video_id, checkpoint_id).await?;
        if checkpoint.phase_number >= TERMINAL_PHASE {
            return Err(RequestError::Validation(
                "Checkpoint is at the terminal phase; nothing to continue".into(),
            ));
        }

        let has_edits = {
            let id = checkpoint.id.clone();
            self.deps
                .db
                .call(move |db| db.checkpoint_has_edits(&id))
                .await?
        };
        let pending = checkpoint.status == crate::store::CheckpointStatus::Pending;
        if !pending && !has_edits {
            return Err(RequestError::Validation(
                "Checkpoint is already approved and has no edits to fork from".into(),
            ));
        }

        // Edits fork: the next phase runs on a fresh child branch so the
        // approved lineage stays intact.
        let forked = has_edits;
        let branch = if forked {
            let video_id = video_id.to_string();
            let parent_branch = checkpoint.branch_name.clone();
            let cp_id = checkpoint.id.clone();
            self.deps
                .db
                .call(move |db| {
                    let branch = db.generate_branch_name(&video_id, &parent_branch)?;
                    let mut updates = serde_json::Map::new();
                    updates.insert("next_branch".into(), serde_json::json!(branch));
                    db.update_checkpoint_phase_output(&cp_id, &updates)?;
                    Ok(branch)
                })
                .await?
        } else {
            checkpoint.branch_name.clone()
        };

        let next_phase = checkpoint.phase_number + 1;
        let version = {
            let video_id = video_id.to_string();
            let branch = branch.clone();
            let cp_id = checkpoint.id.clone();
            self.deps
                .db
                .call(move |db| {
                    db.approve_checkpoint(&cp_id)?;
                    db.next_checkpoint_version(&video_id, &branch, next_phase)
                })
                .await?
        };

        info!(video_id, checkpoint_id, next_phase, branch = %branch, forked, "continuing");
        self.spawn_pipeline(
            next_phase,
            PhaseContext {
                video_id: video_id.to_string(),
                owner_id: owner_id.to_string(),
                branch: branch.clone(),
                version,
                parent_checkpoint_id: Some(checkpoint.id.clone()),
            },
        )
        .await;

        Ok(ContinueResponse {
            next_phase,
            branch,
            forked,
        })
    }

    // ── Edit ──────────────────────────────────────────────────────

    pub async fn edit(
        &self,
        owner_id: &str,
        video_id: &str,
        request: EditRequest,
    ) -> Result<EditingResponse, RequestError> {
        let video = self.load_video(owner_id, video_id).await?;

        if request.estimate_cost_only {
            let indices: Vec<usize> = request
                .actions
                .iter()
                .filter_map(|a| match a {
                    EditAction::Replace { chunk_indices, .. } => Some(chunk_indices.clone()),
                    _ => None,
                })
                .flatten()
                .collect();
            let model = request
                .actions
                .iter()
                .find_map(|a| match a {
                    EditAction::Replace {
                        new_model: Some(m), ..
                    } => Some(m.clone()),
                    _ => None,
                })
                .or_else(|| {
                    video
                        .spec
                        .as_ref()
                        .and_then(|s| s["model"].as_str().map(String::from))
                })
                .unwrap_or_else(|| "hailuo_fast".to_string());
            return Ok(EditingResponse::Estimate(estimate_cost(
                video_id, &indices, &model,
            )));
        }

        if request.actions.is_empty() {
            return Err(RequestError::Validation("No actions provided".into()));
        }
        if video.chunk_urls.is_empty() {
            return Err(RequestError::Validation(
                "Video has no chunks to edit yet".into(),
            ));
        }
        if self.is_busy(video_id).await || !video.status.is_settled() {
            return Err(RequestError::Validation(
                "Video is busy; retry when the current task finishes".into(),
            ));
        }

        let prior_status = video.status;
        self.set_status(video_id, VideoStatus::Editing, video.current_phase)
            .await?;

        let service = EditingService::new(&self.deps);
        let result = service.process(owner_id, video_id, &request.actions).await;

        self.set_status(video_id, prior_status, video.current_phase)
            .await?;

        match result {
            Ok(outcome) => Ok(EditingResponse::Applied(outcome)),
            Err(e) => Err(e.into()),
        }
    }

    // ── Artifact edits (phase-gated, no new checkpoint) ───────────

    /// PATCH the plan spec on a phase-1 checkpoint; bumps the `spec`
    /// artifact version.
    pub async fn update_spec_artifact(
        &self,
        owner_id: &str,
        video_id: &str,
        checkpoint_id: &str,
        patch: SpecPatch,
    ) -> Result<ArtifactEditResponse, RequestError> {
        let checkpoint = self
            .gated_checkpoint(owner_id, video_id, checkpoint_id, phases::PHASE_PLAN, "spec")
            .await?;
        let output = PhaseOutput::from_value(&checkpoint.phase_output)
            .map_err(|e| RequestError::Validation(e.to_string()))?;
        let mut spec = output
            .spec()
            .cloned()
            .ok_or_else(|| RequestError::Validation("Checkpoint carries no spec".into()))?;

        if let Some(style) = patch.style {
            spec.style = style;
        }
        if let Some(audio) = patch.audio {
            spec.audio = audio;
        }
        if let Some(product) = patch.product {
            spec.product = product;
        }
        if let Some(beats) = patch.beats {
            let total: f64 = beats.iter().map(|b| b.duration).sum();
            if (total - spec.duration).abs() > 1e-6 {
                return Err(RequestError::Validation(format!(
                    "Beat durations sum to {}s, expected {}s",
                    total, spec.duration
                )));
            }
            spec.beats = beats;
        }

        let version = {
            let cp_id = checkpoint.id.clone();
            self.deps
                .db
                .call(move |db| db.next_artifact_version(&cp_id, ArtifactType::Spec, "spec"))
                .await?
        };

        let mut file = tempfile::Builder::new()
            .prefix("vidforge-spec-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| RequestError::Internal(anyhow::anyhow!(e)))?;
        file.write_all(&serde_json::to_vec_pretty(&spec).map_err(anyhow::Error::from)?)
            .map_err(|e| RequestError::Internal(anyhow::anyhow!(e)))?;
        let path = file.into_temp_path();
        let key = video_key(owner_id, video_id, &format!("spec_v{}.json", version));
        let blob = self.deps.objects.upload_file(&path, &key).await?;

        let artifact = self
            .insert_artifact_version(
                &checkpoint,
                ArtifactType::Spec,
                "spec",
                &blob.blob_url,
                &blob.blob_key,
                version,
                "spec edited",
            )
            .await?;

        // The next phase reads the edited spec from this checkpoint.
        self.write_spec_back(&checkpoint, &spec, &output).await?;

        Ok(ArtifactEditResponse {
            artifact_id: artifact.id,
            version,
            blob_url: None,
        })
    }

    /// Upload a caller-provided storyboard image for one beat on a
    /// phase-2 checkpoint.
    pub async fn upload_beat_image(
        &self,
        owner_id: &str,
        video_id: &str,
        checkpoint_id: &str,
        beat_index: usize,
        image_bytes: Vec<u8>,
    ) -> Result<ArtifactEditResponse, RequestError> {
        let checkpoint = self
            .gated_checkpoint(
                owner_id,
                video_id,
                checkpoint_id,
                phases::PHASE_STORYBOARD,
                "beat image",
            )
            .await?;

        let mut file = tempfile::Builder::new()
            .prefix("vidforge-beat-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| RequestError::Internal(anyhow::anyhow!(e)))?;
        file.write_all(&image_bytes)
            .map_err(|e| RequestError::Internal(anyhow::anyhow!(e)))?;
        let path = file.into_temp_path();

        self.replace_beat_image(
            owner_id,
            video_id,
            &checkpoint,
            beat_index,
            &path,
            &format!("beat {} image replaced", beat_index),
        )
        .await
    }

    /// Regenerate one beat's storyboard frame on a phase-2 checkpoint.
    pub async fn regenerate_beat(
        &self,
        owner_id: &str,
        video_id: &str,
        checkpoint_id: &str,
        beat_index: usize,
        prompt_override: Option<String>,
    ) -> Result<ArtifactEditResponse, RequestError> {
        let checkpoint = self
            .gated_checkpoint(
                owner_id,
                video_id,
                checkpoint_id,
                phases::PHASE_STORYBOARD,
                "beat image",
            )
            .await?;
        let output = PhaseOutput::from_value(&checkpoint.phase_output)
            .map_err(|e| RequestError::Validation(e.to_string()))?;
        let spec = output
            .spec()
            .ok_or_else(|| RequestError::Validation("Checkpoint carries no spec".into()))?;
        let beat = spec
            .beats
            .get(beat_index)
            .ok_or_else(|| RequestError::Validation(format!("No beat {}", beat_index)))?;

        let prompt = prompt_override
            .unwrap_or_else(|| phases::storyboard::build_image_prompt(beat, spec));
        let frame = self
            .deps
            .image_model
            .generate(&prompt, "16:9")
            .await
            .map_err(RequestError::from)?;

        self.replace_beat_image(
            owner_id,
            video_id,
            &checkpoint,
            beat_index,
            &frame,
            &format!("beat {} image regenerated", beat_index),
        )
        .await
    }

    /// Regenerate one chunk on a phase-3 checkpoint: new artifact
    /// version, chunk list entry swapped, no new checkpoint, no
    /// re-stitch (that happens on the next `/edit`).
    pub async fn regenerate_chunk(
        &self,
        owner_id: &str,
        video_id: &str,
        checkpoint_id: &str,
        chunk_index: usize,
        model_override: Option<String>,
    ) -> Result<ArtifactEditResponse, RequestError> {
        let video = self.load_video(owner_id, video_id).await?;
        let checkpoint = self
            .gated_checkpoint(owner_id, video_id, checkpoint_id, phases::PHASE_CHUNKS, "chunk")
            .await?;
        let output = PhaseOutput::from_value(&checkpoint.phase_output)
            .map_err(|e| RequestError::Validation(e.to_string()))?;
        let spec: VideoSpec = output
            .spec()
            .cloned()
            .ok_or_else(|| RequestError::Validation("Checkpoint carries no spec".into()))?;
        if chunk_index >= video.chunk_urls.len() {
            return Err(RequestError::Validation(format!(
                "Chunk index {} out of range",
                chunk_index
            )));
        }

        let version = {
            let cp_id = checkpoint.id.clone();
            let key = format!("chunk_{}", chunk_index);
            self.deps
                .db
                .call(move |db| db.next_artifact_version(&cp_id, ArtifactType::VideoChunk, &key))
                .await?
        };

        let service = EditingService::new(&self.deps);
        let (blob, prompt, model_id, cost) = service
            .regenerate_chunk_blob(
                &video,
                &spec,
                &video.chunk_urls,
                chunk_index,
                None,
                model_override.as_deref(),
                &format!("v{}", version),
            )
            .await
            .map_err(RequestError::from)?;

        let artifact = self
            .insert_artifact_version(
                &checkpoint,
                ArtifactType::VideoChunk,
                &format!("chunk_{}", chunk_index),
                &blob.blob_url,
                &blob.blob_key,
                version,
                &format!("chunk {} regenerated with {}", chunk_index, model_id),
            )
            .await?;

        // Swap the live chunk list entry and track the version for the
        // editor's selector.
        {
            let video_id = video_id.to_string();
            let blob_url = blob.blob_url.clone();
            let mut chunk_urls = video.chunk_urls.clone();
            chunk_urls[chunk_index] = blob_url.clone();
            let mut state = EditingState::load(&video);
            let replacement = format!("replacement_{}", state.next_replacement_number(chunk_index));
            let versions = state.versions_mut(chunk_index);
            if versions.original.is_none() {
                versions.original = Some(ChunkVersionEntry {
                    url: video.chunk_urls[chunk_index].clone(),
                    prompt: None,
                    model: None,
                    cost: None,
                    created_at: None,
                });
            }
            versions.replacements.insert(
                replacement.clone(),
                ChunkVersionEntry {
                    url: blob_url,
                    prompt: Some(prompt),
                    model: Some(model_id),
                    cost: Some(cost),
                    created_at: Some(chrono::Utc::now().to_rfc3339()),
                },
            );
            versions.current_selected = replacement;
            let state_value = state.to_value();
            self.deps
                .db
                .call(move |db| {
                    db.update_chunk_urls(&video_id, &chunk_urls)?;
                    db.set_phase_output(&video_id, EDITING_KEY, &state_value)?;
                    db.add_video_cost(&video_id, cost)?;
                    Ok(())
                })
                .await?;
        }

        Ok(ArtifactEditResponse {
            artifact_id: artifact.id,
            version,
            blob_url: Some(blob.blob_url),
        })
    }

    // ── Delete ────────────────────────────────────────────────────

    /// Remove a video: its object-store prefix and its row (checkpoints
    /// and artifacts cascade).
    pub async fn delete_video(&self, owner_id: &str, video_id: &str) -> Result<(), RequestError> {
        let _video = self.load_video(owner_id, video_id).await?;
        if self.is_busy(video_id).await {
            return Err(RequestError::Validation(
                "Video is busy; retry when the current task finishes".into(),
            ));
        }
        self.deps
            .objects
            .delete_prefix(&video_prefix(owner_id, video_id))
            .await?;
        let deleted = {
            let owner = owner_id.to_string();
            let id = video_id.to_string();
            self.deps.db.call(move |db| db.delete_video(&id, &owner)).await?
        };
        if !deleted {
            return Err(RequestError::NotFound("Video"));
        }
        Ok(())
    }

    // ── Shared helpers ────────────────────────────────────────────

    pub async fn load_video(&self, owner_id: &str, video_id: &str) -> Result<Video, RequestError> {
        let id = video_id.to_string();
        let video = self
            .deps
            .db
            .call(move |db| db.get_video_by_id(&id))
            .await?
            .ok_or(RequestError::NotFound("Video"))?;
        if video.owner_id != owner_id {
            return Err(RequestError::Ownership);
        }
        Ok(video)
    }

    pub async fn load_checkpoint(
        &self,
        owner_id: &str,
        video_id: &str,
        checkpoint_id: &str,
    ) -> Result<Checkpoint, RequestError> {
        let id = checkpoint_id.to_string();
        let checkpoint = self
            .deps
            .db
            .call(move |db| db.get_checkpoint(&id))
            .await?
            .ok_or(RequestError::NotFound("Checkpoint"))?;
        if checkpoint.owner_id != owner_id {
            return Err(RequestError::Ownership);
        }
        if checkpoint.video_id != video_id {
            return Err(RequestError::NotFound("Checkpoint"));
        }
        Ok(checkpoint)
    }

    /// Point one chunk at an existing version without re-stitching.
    pub async fn select_chunk_version(
        &self,
        owner_id: &str,
        video_id: &str,
        chunk_index: usize,
        version: &str,
    ) -> Result<(), RequestError> {
        let video = self.load_video(owner_id, video_id).await?;
        let mut state = EditingState::load(&video);
        let views = crate::editor::chunks::list_versions(&video, &state, chunk_index);
        let chosen = views
            .iter()
            .find(|v| v.version_id == version)
            .ok_or_else(|| {
                RequestError::Validation(format!(
                    "Chunk {} has no version '{}'",
                    chunk_index, version
                ))
            })?;

        let mut chunk_urls = video.chunk_urls.clone();
        if chunk_index < chunk_urls.len() {
            chunk_urls[chunk_index] = chosen.url.clone();
        }
        state.versions_mut(chunk_index).current_selected = version.to_string();

        let id = video_id.to_string();
        let state_value = state.to_value();
        self.deps
            .db
            .call(move |db| {
                db.update_chunk_urls(&id, &chunk_urls)?;
                db.set_phase_output(&id, EDITING_KEY, &state_value)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Load a checkpoint and enforce that its phase matches the edit
    /// kind (spec -> 1, beat image -> 2, chunk -> 3).
    async fn gated_checkpoint(
        &self,
        owner_id: &str,
        video_id: &str,
        checkpoint_id: &str,
        required_phase: u8,
        edit_kind: &str,
    ) -> Result<Checkpoint, RequestError> {
        let checkpoint = self.load_checkpoint(owner_id, video_id, checkpoint_id).await?;
        if checkpoint.phase_number != required_phase {
            return Err(RequestError::Validation(format!(
                "A {} edit applies to phase {} checkpoints, this one is phase {}",
                edit_kind, required_phase, checkpoint.phase_number
            )));
        }
        Ok(checkpoint)
    }

    async fn set_status(
        &self,
        video_id: &str,
        status: VideoStatus,
        phase: u8,
    ) -> Result<(), RequestError> {
        let id = video_id.to_string();
        self.deps
            .db
            .call(move |db| db.update_video_status(&id, &status, phase))
            .await?;
        Ok(())
    }

    async fn insert_artifact_version(
        &self,
        checkpoint: &Checkpoint,
        artifact_type: ArtifactType,
        artifact_key: &str,
        blob_url: &str,
        blob_key: &str,
        version: i64,
        edit_description: &str,
    ) -> Result<Artifact, RequestError> {
        let cp_id = checkpoint.id.clone();
        let key = artifact_key.to_string();
        let url = blob_url.to_string();
        let blob_key = blob_key.to_string();
        let description = edit_description.to_string();
        let artifact = self
            .deps
            .db
            .call(move |db| {
                let parent = db.latest_artifact(&cp_id, artifact_type, &key)?;
                let artifact = db.create_artifact(NewArtifact {
                    checkpoint_id: &cp_id,
                    artifact_type,
                    artifact_key: &key,
                    blob_url: &url,
                    blob_key: &blob_key,
                    version,
                    parent_artifact_id: parent.as_ref().map(|a| a.id.as_str()),
                    metadata: None,
                    size_bytes: None,
                })?;
                db.set_checkpoint_edit_description(&cp_id, &description)?;
                Ok(artifact)
            })
            .await?;
        Ok(artifact)
    }

    async fn replace_beat_image(
        &self,
        owner_id: &str,
        video_id: &str,
        checkpoint: &Checkpoint,
        beat_index: usize,
        image_path: &std::path::Path,
        edit_description: &str,
    ) -> Result<ArtifactEditResponse, RequestError> {
        let output = PhaseOutput::from_value(&checkpoint.phase_output)
            .map_err(|e| RequestError::Validation(e.to_string()))?;
        let mut spec = output
            .spec()
            .cloned()
            .ok_or_else(|| RequestError::Validation("Checkpoint carries no spec".into()))?;
        if beat_index >= spec.beats.len() {
            return Err(RequestError::Validation(format!(
                "No beat {}",
                beat_index
            )));
        }

        let artifact_key = format!("beat_{}", beat_index);
        let version = {
            let cp_id = checkpoint.id.clone();
            let key = artifact_key.clone();
            self.deps
                .db
                .call(move |db| db.next_artifact_version(&cp_id, ArtifactType::BeatImage, &key))
                .await?
        };

        let blob_key = video_key(
            owner_id,
            video_id,
            &format!("beat_{:02}_v{}.png", beat_index, version),
        );
        let blob = self.deps.objects.upload_file(image_path, &blob_key).await?;
        let artifact = self
            .insert_artifact_version(
                checkpoint,
                ArtifactType::BeatImage,
                &artifact_key,
                &blob.blob_url,
                &blob.blob_key,
                version,
                edit_description,
            )
            .await?;

        spec.beats[beat_index].image_url = Some(blob.blob_url.clone());
        self.write_spec_back(checkpoint, &spec, &output).await?;

        Ok(ArtifactEditResponse {
            artifact_id: artifact.id,
            version,
            blob_url: Some(blob.blob_url),
        })
    }

    /// Persist an edited spec into both the checkpoint's phase output and
    /// the video row, so the next dispatched phase sees it.
    async fn write_spec_back(
        &self,
        checkpoint: &Checkpoint,
        spec: &VideoSpec,
        original_output: &PhaseOutput,
    ) -> Result<(), RequestError> {
        let updated_output = match original_output {
            PhaseOutput::Plan(out) => PhaseOutput::Plan(phases::PlanOutput {
                spec: spec.clone(),
                ..out.clone()
            }),
            PhaseOutput::Storyboard(out) => PhaseOutput::Storyboard(phases::StoryboardOutput {
                spec: spec.clone(),
                ..out.clone()
            }),
            PhaseOutput::Chunks(out) => PhaseOutput::Chunks(phases::ChunksOutput {
                spec: spec.clone(),
                ..out.clone()
            }),
            PhaseOutput::Refine(_) => return Ok(()),
        };

        let cp_id = checkpoint.id.clone();
        let video_id = checkpoint.video_id.clone();
        let output_value = updated_output.to_value();
        let spec_value = serde_json::to_value(spec).expect("spec serializes");
        self.deps
            .db
            .call(move |db| {
                let updates = match output_value {
                    serde_json::Value::Object(map) => map,
                    _ => serde_json::Map::new(),
                };
                db.update_checkpoint_phase_output(&cp_id, &updates)?;
                db.update_video_spec(&video_id, &spec_value)?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

// ── Pipeline task loop ────────────────────────────────────────────────

/// Drive phases `start_phase..=4` for one video inside a single task.
/// Manual mode pauses after each checkpoint; auto-continue approves and
/// advances until the terminal phase. Any error marks the video failed.
async fn run_pipeline(deps: Arc<Deps>, start_phase: u8, mut ctx: PhaseContext) {
    let mut phase = start_phase;
    loop {
        {
            let video_id = ctx.video_id.clone();
            let status = VideoStatus::RunningPhase(phase);
            let _ = deps
                .db
                .call(move |db| db.update_video_status(&video_id, &status, phase))
                .await;
        }

        let result = match phase {
            phases::PHASE_PLAN => phases::plan::run(&deps, &ctx).await,
            phases::PHASE_STORYBOARD => phases::storyboard::run(&deps, &ctx).await,
            phases::PHASE_CHUNKS => phases::chunks::run(&deps, &ctx).await,
            phases::PHASE_REFINE => phases::refine::run(&deps, &ctx).await,
            _ => break,
        };

        let completion = match result {
            Ok(completion) => completion,
            Err(e) => {
                record_failure(&deps, &ctx, phase, &e).await;
                break;
            }
        };

        if phase >= TERMINAL_PHASE {
            // Refine already approved itself and completed the video.
            break;
        }

        // The flag is re-read on every boundary so mid-pipeline toggles
        // take effect at the next decision point.
        let video = {
            let video_id = ctx.video_id.clone();
            let owner_id = ctx.owner_id.clone();
            deps.db
                .call(move |db| db.get_video(&video_id, &owner_id))
                .await
                .ok()
                .flatten()
        };
        let Some(video) = video else {
            break;
        };

        if !video.auto_continue {
            let video_id = ctx.video_id.clone();
            let status = VideoStatus::PausedAtPhase(phase);
            let _ = deps
                .db
                .call(move |db| db.update_video_status(&video_id, &status, phase))
                .await;
            deps.progress
                .publish(
                    &ctx.video_id,
                    &ProgressDoc {
                        status: status.as_string(),
                        progress: video.progress,
                        current_phase: Some(phase_key(phase).to_string()),
                        total_cost: Some(video.cost_usd),
                        ..Default::default()
                    },
                )
                .await;
            info!(video_id = %ctx.video_id, phase, "paused at checkpoint");
            break;
        }

        let next_phase = phase + 1;
        let version = {
            let video_id = ctx.video_id.clone();
            let branch = ctx.branch.clone();
            let cp_id = completion.checkpoint.id.clone();
            deps.db
                .call(move |db| {
                    db.approve_checkpoint(&cp_id)?;
                    db.next_checkpoint_version(&video_id, &branch, next_phase)
                })
                .await
        };
        let version = match version {
            Ok(version) => version,
            Err(e) => {
                record_failure(&deps, &ctx, phase, &PhaseError::Other(e)).await;
                break;
            }
        };

        ctx.parent_checkpoint_id = Some(completion.checkpoint.id.clone());
        ctx.version = version;
        phase = next_phase;
    }
}

async fn record_failure(deps: &Deps, ctx: &PhaseContext, phase: u8, e: &PhaseError) {
    error!(video_id = %ctx.video_id, phase, kind = e.kind(), error = %e, "phase failed");
    let message = e.to_string();
    let failure = serde_json::json!({
        "phase": phase_key(phase),
        "status": "failed",
        "error_kind": e.kind(),
        "error_message": message,
    });
    {
        let video_id = ctx.video_id.clone();
        let message = message.clone();
        let _ = deps
            .db
            .call(move |db| {
                db.set_video_failed(&video_id, &message)?;
                db.set_phase_output(&video_id, phase_key(phase), &failure)?;
                Ok(())
            })
            .await;
    }
    deps.progress
        .publish(
            &ctx.video_id,
            &ProgressDoc {
                status: "failed".into(),
                progress: 0.0,
                current_phase: Some(phase_key(phase).to_string()),
                error: Some(message),
                ..Default::default()
            },
        )
        .await;
}
