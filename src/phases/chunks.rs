//! Phase 3 (Chunks): plan, generate in two parallel waves, and stitch.
//!
//! Anchors run first, then continuations conditioned on anchor last
//! frames, then the ordered chunk list is stitched into one composite
//! under the wall-clock budget. A thumbnail from chunk 0 is attempted but
//! never fails the phase.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use super::{
    ChunksOutput, PhaseCompletion, PhaseContext, PhaseOutput, phase_key, progress_marks,
    publish_progress,
};
use crate::deps::Deps;
use crate::errors::PhaseError;
use crate::media::StitchBudget;
use crate::object_io::video_key;
use crate::scheduler::executor::{ChunkResult, ChunkScheduler, ModelChunkWorker, collect_ordered};
use crate::scheduler::plan_chunks;
use crate::store::ArtifactType;
use crate::store::artifacts::NewArtifact;
use crate::store::checkpoints::NewCheckpoint;

pub async fn run(deps: &Deps, ctx: &PhaseContext) -> Result<PhaseCompletion, PhaseError> {
    let started = Instant::now();
    let parent = super::load_parent_output(deps, ctx, super::PHASE_CHUNKS).await?;
    let spec = parent.spec().cloned().ok_or(PhaseError::MissingInput {
        phase: super::PHASE_CHUNKS,
        field: "spec",
    })?;

    publish_progress(deps, ctx, super::PHASE_CHUNKS, 45.0, "generating_chunks").await;
    let plan = plan_chunks(&spec)?;
    info!(
        video_id = %ctx.video_id,
        chunks = plan.chunk_count,
        anchors = plan.anchors().count(),
        "chunk plan ready"
    );

    let worker = ModelChunkWorker {
        objects: deps.objects.clone(),
        media: deps.media.clone(),
        video_model: Arc::clone(&deps.video_model),
        owner_id: ctx.owner_id.clone(),
        video_id: ctx.video_id.clone(),
        presign_ttl: deps.config.presign_ttl,
    };
    let scheduler = ChunkScheduler::new(&worker);

    let anchors = scheduler.run_anchors(&plan).await?;
    publish_progress(
        deps,
        ctx,
        super::PHASE_CHUNKS,
        progress_marks::CHUNKS_ANCHORS_DONE,
        "generating_chunks",
    )
    .await;

    let continuations = scheduler.run_continuations(&plan, &anchors).await?;
    publish_progress(
        deps,
        ctx,
        super::PHASE_CHUNKS,
        progress_marks::CHUNKS_CONTINUATIONS_DONE,
        "generating_chunks",
    )
    .await;

    let results = collect_ordered(&plan, anchors, continuations)?;
    let chunk_urls: Vec<String> = results.iter().map(|r| r.chunk_url.clone()).collect();
    let generation_cost: f64 = results.iter().map(|r| r.cost_usd).sum();

    if let Err(e) = write_thumbnail(deps, ctx, &results).await {
        warn!(video_id = %ctx.video_id, error = %e, "thumbnail generation failed");
    }

    let stitched_url = stitch_chunks(deps, &ctx.owner_id, &ctx.video_id, &chunk_urls).await?;
    publish_progress(
        deps,
        ctx,
        super::PHASE_CHUNKS,
        progress_marks::CHUNKS_STITCH_DONE,
        "generating_chunks",
    )
    .await;

    let output = PhaseOutput::Chunks(ChunksOutput {
        video_id: ctx.video_id.clone(),
        spec: spec.clone(),
        chunk_urls: chunk_urls.clone(),
        stitched_video_url: stitched_url.clone(),
        cost_usd: generation_cost,
        duration_seconds: started.elapsed().as_secs_f64(),
    });

    let artifact_rows: Vec<(usize, String, String, String, f64)> = results
        .iter()
        .map(|r| {
            (
                r.index,
                r.chunk_url.clone(),
                deps.objects.key_from_ref(&r.chunk_url),
                r.last_frame_url.clone(),
                r.cost_usd,
            )
        })
        .collect();

    let checkpoint = {
        let ctx = ctx.clone();
        let output_value = output.to_value();
        let chunk_urls = chunk_urls.clone();
        let stitched_url = stitched_url.clone();
        deps.db
            .call(move |db| {
                let checkpoint = db.create_checkpoint(NewCheckpoint {
                    video_id: &ctx.video_id,
                    branch_name: &ctx.branch,
                    phase_number: super::PHASE_CHUNKS,
                    version: ctx.version,
                    parent_checkpoint_id: ctx.parent_checkpoint_id.as_deref(),
                    phase_output: &output_value,
                    cost_usd: generation_cost,
                    owner_id: &ctx.owner_id,
                    edit_description: None,
                })?;
                for (index, url, key, last_frame, cost) in &artifact_rows {
                    db.create_artifact(NewArtifact {
                        checkpoint_id: &checkpoint.id,
                        artifact_type: ArtifactType::VideoChunk,
                        artifact_key: &format!("chunk_{}", index),
                        blob_url: url,
                        blob_key: key,
                        version: 1,
                        parent_artifact_id: None,
                        metadata: Some(&serde_json::json!({
                            "last_frame_url": last_frame,
                            "cost_usd": cost,
                        })),
                        size_bytes: None,
                    })?;
                }
                db.update_chunk_urls(&ctx.video_id, &chunk_urls)?;
                db.set_stitched_url(&ctx.video_id, &stitched_url)?;
                db.add_video_cost(&ctx.video_id, generation_cost)?;
                db.set_phase_output(&ctx.video_id, phase_key(super::PHASE_CHUNKS), &output_value)?;
                Ok(checkpoint)
            })
            .await
            .map_err(PhaseError::Other)?
    };

    publish_progress(
        deps,
        ctx,
        super::PHASE_CHUNKS,
        progress_marks::CHUNKS_DONE,
        "generating_chunks",
    )
    .await;

    Ok(PhaseCompletion {
        checkpoint,
        output,
        cost_usd: generation_cost,
    })
}

/// Poster frame from chunk 0; best-effort.
async fn write_thumbnail(
    deps: &Deps,
    ctx: &PhaseContext,
    results: &[ChunkResult],
) -> Result<(), PhaseError> {
    let first = results
        .first()
        .ok_or_else(|| PhaseError::Integrity("No chunks produced".into()))?;
    let clip = deps.objects.download_temp(&first.chunk_url).await?;

    let frame = tempfile::Builder::new()
        .prefix("vidforge-thumb-")
        .suffix(".jpg")
        .tempfile()
        .map_err(|e| PhaseError::Media(format!("Failed to create thumbnail file: {}", e)))?
        .into_temp_path();
    deps.media.extract_first_frame(&clip, &frame).await?;

    let key = video_key(&ctx.owner_id, &ctx.video_id, "thumbnail.jpg");
    let blob = deps.objects.upload_file(&frame, &key).await?;

    let video_id = ctx.video_id.clone();
    deps.db
        .call(move |db| db.set_thumbnail_url(&video_id, &blob.blob_url))
        .await
        .map_err(PhaseError::Other)?;
    Ok(())
}

/// Download the ordered chunks, stitch them under the budget, and upload
/// the composite. Shared with the editor's post-edit re-stitch.
pub async fn stitch_chunks(
    deps: &Deps,
    owner_id: &str,
    video_id: &str,
    chunk_urls: &[String],
) -> Result<String, PhaseError> {
    let scratch = tempfile::tempdir()
        .map_err(|e| PhaseError::Media(format!("Failed to create scratch dir: {}", e)))?;

    let mut local_paths: Vec<PathBuf> = Vec::with_capacity(chunk_urls.len());
    let mut guards = Vec::with_capacity(chunk_urls.len());
    for url in chunk_urls {
        let local = deps.objects.download_temp(url).await?;
        local_paths.push(local.to_path_buf());
        guards.push(local);
    }

    let output = scratch.path().join("stitched.mp4");
    let budget = StitchBudget::new(deps.config.stitch_budget);
    deps.media
        .stitch(&local_paths, &output, scratch.path(), &budget)
        .await?;

    let key = video_key(owner_id, video_id, "stitched.mp4");
    let blob = deps.objects.upload_file(&output, &key).await?;
    Ok(blob.blob_url)
}
