//! End-to-end scenarios against a real orchestrator wired to an
//! in-memory database and a directory-backed blob store. External model
//! clients are fakes: planning runs for real, storyboard/chunk generation
//! either fail (to exercise failure paths) or return synthetic clips.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempPath;

use vidforge::clients::music::MusicSource;
use vidforge::clients::registry::VideoModelConfig;
use vidforge::clients::{ImageModel, VideoModel};
use vidforge::config::AppConfig;
use vidforge::deps::Deps;
use vidforge::errors::PhaseError;
use vidforge::media::MediaTools;
use vidforge::object_io::ObjectIO;
use vidforge::orchestrator::{EditRequest, EditingResponse, GenerateRequest, Orchestrator, RequestError};
use vidforge::editor::EditAction;
use vidforge::progress::ProgressChannel;
use vidforge::store::{CheckpointStatus, Db, DbHandle, VideoStatus};

// ── Fakes ─────────────────────────────────────────────────────────────

/// Image model that always fails; storyboard phases exercising it hit
/// the external-failure path.
struct FailingImageModel;

#[async_trait]
impl ImageModel for FailingImageModel {
    async fn generate(&self, _: &str, _: &str) -> Result<TempPath, PhaseError> {
        Err(PhaseError::external("image-model", "503 service unavailable"))
    }
}

/// Video model that writes a tiny synthetic clip file.
struct SyntheticVideoModel;

#[async_trait]
impl VideoModel for SyntheticVideoModel {
    async fn generate(
        &self,
        model: &VideoModelConfig,
        init_image_url: &str,
        prompt: &str,
        _duration: f64,
        _fps: u32,
    ) -> Result<TempPath, PhaseError> {
        let file = tempfile::Builder::new()
            .suffix(".mp4")
            .tempfile()
            .map_err(|e| PhaseError::external("video-model", e))?;
        std::fs::write(
            file.path(),
            format!("clip[{}|{}|{}]", model.id, init_image_url, prompt),
        )
        .map_err(|e| PhaseError::external("video-model", e))?;
        Ok(file.into_temp_path())
    }
}

struct Harness {
    orchestrator: Orchestrator,
    deps: Arc<Deps>,
    _blob_root: tempfile::TempDir,
}

fn harness() -> Harness {
    let blob_root = tempfile::tempdir().unwrap();
    let db = DbHandle::new(Db::new_in_memory().unwrap());
    let objects = ObjectIO::local("test-bucket", blob_root.path());
    let media = MediaTools::new();
    let progress = ProgressChannel::new("redis://127.0.0.1:1", Duration::from_secs(3600));
    let deps = Arc::new(Deps {
        db,
        objects: objects.clone(),
        progress,
        media: media.clone(),
        image_model: Arc::new(FailingImageModel),
        video_model: Arc::new(SyntheticVideoModel),
        music: MusicSource::new(objects, media, "music/".into()),
        config: AppConfig::default(),
    });
    Harness {
        orchestrator: Orchestrator::new(Arc::clone(&deps)),
        deps,
        _blob_root: blob_root,
    }
}

/// Poll until `check` returns Some, or panic after ~10 seconds.
async fn wait_for<T, F>(what: &str, mut check: F) -> T
where
    F: AsyncFnMut() -> Option<T>,
{
    for _ in 0..200 {
        if let Some(found) = check().await {
            return found;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn generate_request(auto_continue: bool) -> GenerateRequest {
    serde_json::from_value(serde_json::json!({
        "prompt": "Showcase a chrome kettle",
        "auto_continue": auto_continue,
        "duration_seconds": 20.0,
        "model": "hailuo_fast",
    }))
    .unwrap()
}

// ── Scenarios ─────────────────────────────────────────────────────────

#[tokio::test]
async fn manual_mode_pauses_after_plan_checkpoint() {
    let h = harness();
    let video = h
        .orchestrator
        .generate("user-1", generate_request(false))
        .await
        .unwrap();

    let checkpoint = {
        let db = h.deps.db.clone();
        let video_id = video.id.clone();
        wait_for("plan checkpoint", async || {
            db.call({
                let id = video_id.clone();
                move |db| db.current_checkpoint(&id)
            })
            .await
            .ok()
            .flatten()
        })
        .await
    };
    assert_eq!(checkpoint.phase_number, 1);
    assert_eq!(checkpoint.branch_name, "main");
    assert_eq!(checkpoint.version, 1);
    assert_eq!(checkpoint.status, CheckpointStatus::Pending);

    let paused = {
        let db = h.deps.db.clone();
        let video_id = video.id.clone();
        wait_for("paused status", async || {
            let video = db
                .call({
                    let id = video_id.clone();
                    move |db| db.get_video(&id, "user-1")
                })
                .await
                .ok()
                .flatten()?;
            (video.status == VideoStatus::PausedAtPhase(1)).then_some(video)
        })
        .await
    };
    assert_eq!(paused.progress, 25.0);
    assert!(paused.spec.is_some(), "plan wrote the spec to the row");
    assert!(
        paused.phase_outputs.contains_key("phase1_plan"),
        "plan output recorded"
    );

    // The spec blob landed in the object store under the video prefix.
    let artifacts = h
        .deps
        .db
        .call({
            let cp_id = checkpoint.id.clone();
            move |db| db.list_artifacts(&cp_id)
        })
        .await
        .unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].artifact_key, "spec");
    assert!(
        h.deps
            .objects
            .download_temp(&artifacts[0].blob_url)
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn spec_edit_then_continue_forks_a_branch() {
    let h = harness();
    let video = h
        .orchestrator
        .generate("user-1", generate_request(false))
        .await
        .unwrap();

    let cp1 = {
        let db = h.deps.db.clone();
        let video_id = video.id.clone();
        wait_for("plan checkpoint", async || {
            db.call({
                let id = video_id.clone();
                move |db| db.current_checkpoint(&id)
            })
            .await
            .ok()
            .flatten()
        })
        .await
    };

    // Wait until the pipeline task settles before editing.
    {
        let db = h.deps.db.clone();
        let video_id = video.id.clone();
        wait_for("paused status", async || {
            let video = db
                .call({
                    let id = video_id.clone();
                    move |db| db.get_video(&id, "user-1")
                })
                .await
                .ok()
                .flatten()?;
            (video.status == VideoStatus::PausedAtPhase(1)).then_some(())
        })
        .await;
    }

    // Edit the spec: mood becomes elegant, artifact version becomes 2.
    let patch = serde_json::from_value(serde_json::json!({
        "style": {"aesthetic": "cinematic", "mood": "elegant"},
    }))
    .unwrap();
    let edit = h
        .orchestrator
        .update_spec_artifact("user-1", &video.id, &cp1.id, patch)
        .await
        .unwrap();
    assert_eq!(edit.version, 2);

    let response = h
        .orchestrator
        .continue_from_checkpoint("user-1", &video.id, &cp1.id)
        .await
        .unwrap();
    assert_eq!(response.next_phase, 2);
    assert_eq!(response.branch, "main-1");
    assert!(response.forked);

    // cp1 is approved and carries the fork pointer.
    let cp1_after = h
        .deps
        .db
        .call({
            let id = cp1.id.clone();
            move |db| db.get_checkpoint(&id)
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cp1_after.status, CheckpointStatus::Approved);
    assert_eq!(cp1_after.phase_output["next_branch"], "main-1");
    assert_eq!(cp1_after.phase_output["spec"]["style"]["mood"], "elegant");

    // Phase 2 runs against the failing image model and fails the video.
    let failed = {
        let db = h.deps.db.clone();
        let video_id = video.id.clone();
        wait_for("failed status", async || {
            let video = db
                .call({
                    let id = video_id.clone();
                    move |db| db.get_video(&id, "user-1")
                })
                .await
                .ok()
                .flatten()?;
            (video.status == VideoStatus::Failed).then_some(video)
        })
        .await
    };
    assert!(
        failed
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("image-model")
    );
    assert_eq!(
        failed.phase_outputs["phase2_storyboard"]["error_kind"],
        "external_error"
    );
}

#[tokio::test]
async fn continue_rejects_terminal_phase_and_foreign_callers() {
    let h = harness();

    // Seed a finished pipeline's phase-4 checkpoint by hand.
    let (video_id, cp4_id) = h
        .deps
        .db
        .call(|db| {
            let video = db.create_video("user-1", "prompt", &[], false)?;
            let cp = db.create_checkpoint(vidforge::store::checkpoints::NewCheckpoint {
                video_id: &video.id,
                branch_name: "main",
                phase_number: 4,
                version: 1,
                parent_checkpoint_id: None,
                phase_output: &serde_json::json!({}),
                cost_usd: 0.0,
                owner_id: "user-1",
                edit_description: None,
            })?;
            Ok((video.id, cp.id))
        })
        .await
        .unwrap();

    let err = h
        .orchestrator
        .continue_from_checkpoint("user-1", &video_id, &cp4_id)
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::Validation(_)));

    let err = h
        .orchestrator
        .continue_from_checkpoint("intruder", &video_id, &cp4_id)
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::Ownership));
}

#[tokio::test]
async fn regenerate_anchor_chunk_bumps_version_and_swaps_url() {
    let h = harness();

    // Seed a post-phase-3 video: spec with storyboard images, chunk
    // artifacts, and a chunk list.
    let mut spec = vidforge::phases::plan::build_spec(
        "Showcase a chrome kettle",
        &[],
        &vidforge::phases::plan::seed_spec(20.0, "hailuo_fast", 24),
    )
    .unwrap();
    for (i, beat) in spec.beats.iter_mut().enumerate() {
        beat.image_url = Some(format!("s3://test-bucket/beat_{:02}.png", i));
    }

    let chunk_urls: Vec<String> = (0..4)
        .map(|i| format!("s3://test-bucket/u1/videos/v/chunk_{:02}.mp4", i))
        .collect();
    let (video_id, cp3_id) = {
        let spec = spec.clone();
        let chunk_urls = chunk_urls.clone();
        h.deps
            .db
            .call(move |db| {
                let video = db.create_video("user-1", "Showcase a chrome kettle", &[], false)?;
                db.update_video_spec(&video.id, &serde_json::to_value(&spec)?)?;
                db.update_chunk_urls(&video.id, &chunk_urls)?;
                db.update_video_status(&video.id, &VideoStatus::PausedAtPhase(3), 3)?;
                let output = vidforge::phases::PhaseOutput::Chunks(vidforge::phases::ChunksOutput {
                    video_id: video.id.clone(),
                    spec: spec.clone(),
                    chunk_urls: chunk_urls.clone(),
                    stitched_video_url: "s3://test-bucket/u1/videos/v/stitched.mp4".into(),
                    cost_usd: 1.0,
                    duration_seconds: 10.0,
                });
                let cp = db.create_checkpoint(vidforge::store::checkpoints::NewCheckpoint {
                    video_id: &video.id,
                    branch_name: "main",
                    phase_number: 3,
                    version: 1,
                    parent_checkpoint_id: None,
                    phase_output: &output.to_value(),
                    cost_usd: 1.0,
                    owner_id: "user-1",
                    edit_description: None,
                })?;
                for (i, url) in chunk_urls.iter().enumerate() {
                    db.create_artifact(vidforge::store::artifacts::NewArtifact {
                        checkpoint_id: &cp.id,
                        artifact_type: vidforge::store::ArtifactType::VideoChunk,
                        artifact_key: &format!("chunk_{}", i),
                        blob_url: url,
                        blob_key: url,
                        version: 1,
                        parent_artifact_id: None,
                        metadata: None,
                        size_bytes: None,
                    })?;
                }
                Ok((video.id, cp.id))
            })
            .await
            .unwrap()
    };

    // Chunk 0 is an anchor, so regeneration needs no ffmpeg at all.
    let response = h
        .orchestrator
        .regenerate_chunk("user-1", &video_id, &cp3_id, 0, Some("kling".into()))
        .await
        .unwrap();
    assert_eq!(response.version, 2);
    let new_url = response.blob_url.clone().unwrap();
    assert!(new_url.contains("chunk_00_v2.mp4"));

    // The chunk list entry was swapped, the artifact chain extended, no
    // new checkpoint created.
    let (video_after, artifacts, checkpoint_count) = h
        .deps
        .db
        .call({
            let video_id = video_id.clone();
            let cp3_id = cp3_id.clone();
            move |db| {
                let video = db.get_video(&video_id, "user-1")?.unwrap();
                let artifacts = db.list_artifacts(&cp3_id)?;
                let count = db.list_checkpoints(&video_id, None)?.len();
                Ok((video, artifacts, count))
            }
        })
        .await
        .unwrap();
    assert_eq!(video_after.chunk_urls[0], new_url);
    assert_eq!(video_after.chunk_urls[1], chunk_urls[1]);
    assert_eq!(checkpoint_count, 1);

    let chunk0_versions: Vec<_> = artifacts
        .iter()
        .filter(|a| a.artifact_key == "chunk_0")
        .collect();
    assert_eq!(chunk0_versions.len(), 2);
    let v2 = chunk0_versions.iter().find(|a| a.version == 2).unwrap();
    assert!(v2.parent_artifact_id.is_some());

    // The synthetic clip recorded which model and init image were used.
    let clip = h.deps.objects.download_temp(&new_url).await.unwrap();
    let body = std::fs::read_to_string(&clip).unwrap();
    assert!(body.contains("kling"));
    assert!(body.contains("beat_00.png"));

    // Selecting the original version swaps the list entry back.
    h.orchestrator
        .select_chunk_version("user-1", &video_id, 0, "original")
        .await
        .unwrap();
    let restored = h
        .deps
        .db
        .call({
            let video_id = video_id.clone();
            move |db| db.get_video(&video_id, "user-1")
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(restored.chunk_urls[0], chunk_urls[0]);
}

#[tokio::test]
async fn edit_estimate_does_not_touch_state() {
    let h = harness();
    let video = h
        .orchestrator
        .generate("user-1", generate_request(false))
        .await
        .unwrap();

    let request = EditRequest {
        actions: vec![EditAction::Replace {
            chunk_indices: vec![0, 1, 2],
            new_prompt: None,
            new_model: Some("seedance".into()),
        }],
        estimate_cost_only: true,
    };
    let response = h.orchestrator.edit("user-1", &video.id, request).await.unwrap();
    match response {
        EditingResponse::Estimate(estimate) => {
            assert_eq!(estimate.model, "seedance");
            assert_eq!(estimate.chunk_indices, vec![0, 1, 2]);
            assert!((estimate.estimated_cost - 0.18 * 3.0).abs() < 1e-9);
        }
        EditingResponse::Applied(_) => panic!("expected an estimate"),
    }
}

#[tokio::test]
async fn delete_video_removes_rows_and_blobs() {
    let h = harness();
    let video = h
        .orchestrator
        .generate("user-1", generate_request(false))
        .await
        .unwrap();

    // Wait for the plan phase so a blob exists under the video prefix.
    {
        let db = h.deps.db.clone();
        let video_id = video.id.clone();
        wait_for("paused status", async || {
            let video = db
                .call({
                    let id = video_id.clone();
                    move |db| db.get_video(&id, "user-1")
                })
                .await
                .ok()
                .flatten()?;
            (video.status == VideoStatus::PausedAtPhase(1)).then_some(())
        })
        .await;
    }
    let prefix = format!("user-1/videos/{}/", video.id);
    assert!(!h.deps.objects.list_prefix(&prefix).await.unwrap().is_empty());

    h.orchestrator.delete_video("user-1", &video.id).await.unwrap();

    assert!(h.deps.objects.list_prefix(&prefix).await.unwrap().is_empty());
    let gone = h
        .deps
        .db
        .call({
            let id = video.id.clone();
            move |db| db.get_video(&id, "user-1")
        })
        .await
        .unwrap();
    assert!(gone.is_none());

    let err = h
        .orchestrator
        .delete_video("user-1", &video.id)
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::NotFound(_)));
}

#[tokio::test]
async fn yolo_mode_fails_fast_on_external_errors_without_pausing() {
    // With auto_continue the loop should advance straight into phase 2
    // and surface that phase's failure, never pausing at phase 1.
    let h = harness();
    let video = h
        .orchestrator
        .generate("user-1", generate_request(true))
        .await
        .unwrap();

    let failed = {
        let db = h.deps.db.clone();
        let video_id = video.id.clone();
        wait_for("failed status", async || {
            let video = db
                .call({
                    let id = video_id.clone();
                    move |db| db.get_video(&id, "user-1")
                })
                .await
                .ok()
                .flatten()?;
            (video.status == VideoStatus::Failed).then_some(video)
        })
        .await
    };
    assert!(failed.phase_outputs.contains_key("phase1_plan"));
    assert_eq!(
        failed.phase_outputs["phase2_storyboard"]["status"],
        "failed"
    );

    // Phase 1's checkpoint was auto-approved on the way through.
    let checkpoints = h
        .deps
        .db
        .call({
            let id = video.id.clone();
            move |db| db.list_checkpoints(&id, None)
        })
        .await
        .unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].status, CheckpointStatus::Approved);
}
