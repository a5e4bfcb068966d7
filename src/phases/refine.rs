//! Phase 4 (Refine): attach music and produce the final draft.
//!
//! Native-audio models skip the music pass entirely. Otherwise a catalog
//! track is selected by genre, mixed under the composite at 70 % volume,
//! and the result uploaded as `final_draft.mp4`. Phase 4 is terminal: it
//! approves its own checkpoint and marks the video complete.

use std::time::Instant;

use tracing::info;

use super::{
    PhaseCompletion, PhaseContext, PhaseOutput, RefineOutput, phase_key, progress_marks,
    publish_progress,
};
use crate::clients::registry;
use crate::deps::Deps;
use crate::errors::PhaseError;
use crate::object_io::video_key;
use crate::store::ArtifactType;
use crate::store::artifacts::NewArtifact;
use crate::store::checkpoints::NewCheckpoint;

pub async fn run(deps: &Deps, ctx: &PhaseContext) -> Result<PhaseCompletion, PhaseError> {
    let started = Instant::now();
    let parent = super::load_parent_output(deps, ctx, super::PHASE_REFINE).await?;
    let (spec, stitched_url) = match &parent {
        PhaseOutput::Chunks(out) => (out.spec.clone(), out.stitched_video_url.clone()),
        _ => {
            return Err(PhaseError::MissingInput {
                phase: super::PHASE_REFINE,
                field: "stitched_video_url",
            });
        }
    };

    publish_progress(deps, ctx, super::PHASE_REFINE, 92.0, "refining").await;

    let model = registry::model_or_default(&spec.model);
    let scratch = tempfile::tempdir()
        .map_err(|e| PhaseError::Media(format!("Failed to create scratch dir: {}", e)))?;
    let composite = deps.objects.download_temp(&stitched_url).await?;

    let mut music_blob = None;
    let final_local = if model.native_audio {
        info!(video_id = %ctx.video_id, model = %spec.model, "model has native audio, skipping music");
        composite.to_path_buf()
    } else {
        match deps.music.select_track(spec.audio.genre.as_deref()).await? {
            Some(track) => {
                info!(video_id = %ctx.video_id, track = %track.key, genre = %track.genre, "mixing music");
                let track_local = deps.objects.download_temp(&track.key).await?;

                // The chosen track also lives under the video prefix so
                // the final blob set is self-contained.
                let music_key = video_key(&ctx.owner_id, &ctx.video_id, "background.mp3");
                let uploaded = deps.objects.upload_file(&track_local, &music_key).await?;

                let mixed = scratch.path().join("final_draft.mp4");
                deps.media.mix_music(&composite, &track_local, &mixed).await?;
                music_blob = Some(uploaded);
                mixed
            }
            None => {
                info!(video_id = %ctx.video_id, "music catalog empty, final video stays silent");
                composite.to_path_buf()
            }
        }
    };

    let final_key = video_key(&ctx.owner_id, &ctx.video_id, "final_draft.mp4");
    let final_blob = deps.objects.upload_file(&final_local, &final_key).await?;

    let output = PhaseOutput::Refine(RefineOutput {
        video_id: ctx.video_id.clone(),
        final_video_url: final_blob.blob_url.clone(),
        music_url: music_blob.as_ref().map(|b| b.blob_url.clone()),
        cost_usd: 0.0,
        duration_seconds: started.elapsed().as_secs_f64(),
    });

    let checkpoint = {
        let ctx = ctx.clone();
        let output_value = output.to_value();
        let final_blob = final_blob.clone();
        let music_blob = music_blob.clone();
        deps.db
            .call(move |db| {
                let checkpoint = db.create_checkpoint(NewCheckpoint {
                    video_id: &ctx.video_id,
                    branch_name: &ctx.branch,
                    phase_number: super::PHASE_REFINE,
                    version: ctx.version,
                    parent_checkpoint_id: ctx.parent_checkpoint_id.as_deref(),
                    phase_output: &output_value,
                    cost_usd: 0.0,
                    owner_id: &ctx.owner_id,
                    edit_description: None,
                })?;
                db.create_artifact(NewArtifact {
                    checkpoint_id: &checkpoint.id,
                    artifact_type: ArtifactType::FinalVideo,
                    artifact_key: "final",
                    blob_url: &final_blob.blob_url,
                    blob_key: &final_blob.blob_key,
                    version: 1,
                    parent_artifact_id: None,
                    metadata: Some(&serde_json::json!({"sha256": final_blob.sha256})),
                    size_bytes: Some(final_blob.size_bytes),
                })?;
                if let Some(music) = &music_blob {
                    db.create_artifact(NewArtifact {
                        checkpoint_id: &checkpoint.id,
                        artifact_type: ArtifactType::Music,
                        artifact_key: "music",
                        blob_url: &music.blob_url,
                        blob_key: &music.blob_key,
                        version: 1,
                        parent_artifact_id: None,
                        metadata: None,
                        size_bytes: Some(music.size_bytes),
                    })?;
                }

                // Terminal phase: self-approve and complete the video.
                db.approve_checkpoint(&checkpoint.id)?;
                db.set_final_urls(
                    &ctx.video_id,
                    &final_blob.blob_url,
                    music_blob.as_ref().map(|b| b.blob_url.as_str()),
                )?;
                db.set_phase_output(&ctx.video_id, phase_key(super::PHASE_REFINE), &output_value)?;
                db.set_video_complete(&ctx.video_id)?;
                db.get_checkpoint(&checkpoint.id)?
                    .ok_or_else(|| anyhow::anyhow!("Checkpoint vanished after approve"))
            })
            .await
            .map_err(PhaseError::Other)?
    };

    publish_progress(
        deps,
        ctx,
        super::PHASE_REFINE,
        progress_marks::REFINE_DONE,
        "complete",
    )
    .await;
    deps.progress
        .publish(
            &ctx.video_id,
            &crate::progress::ProgressDoc {
                status: "complete".into(),
                progress: progress_marks::REFINE_DONE,
                current_phase: Some(phase_key(super::PHASE_REFINE).to_string()),
                final_video_url: Some(final_blob.blob_url.clone()),
                ..Default::default()
            },
        )
        .await;

    Ok(PhaseCompletion {
        checkpoint,
        output,
        cost_usd: 0.0,
    })
}
