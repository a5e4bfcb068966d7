//! Phase 2 (Storyboard): one frame per beat from the image model.
//!
//! Beats are rendered sequentially; image-generation latency dominates
//! and a partial storyboard is useless, so the first failure fails the
//! phase. Every beat ends with its `image_url` pointing at an uploaded
//! frame, which Phase 3 consumes as anchor conditioning.

use std::time::Instant;

use tracing::info;

use super::{
    Beat, PhaseCompletion, PhaseContext, PhaseOutput, StoryboardOutput, VideoSpec, phase_key,
    progress_marks, publish_progress,
};
use crate::deps::Deps;
use crate::errors::PhaseError;
use crate::object_io::video_key;
use crate::scheduler::render_prompt;
use crate::store::ArtifactType;
use crate::store::artifacts::NewArtifact;
use crate::store::checkpoints::NewCheckpoint;

/// Flat cost per storyboard frame.
const IMAGE_COST_USD: f64 = 0.004;

/// Concatenated prompt for one beat's storyboard frame.
pub fn build_image_prompt(beat: &Beat, spec: &VideoSpec) -> String {
    format!(
        "{}, {} {} aesthetic, {} shot, featuring {}",
        render_prompt(beat, spec),
        spec.style.mood,
        spec.style.aesthetic,
        beat.shot_type,
        spec.product.name
    )
}

pub async fn run(deps: &Deps, ctx: &PhaseContext) -> Result<PhaseCompletion, PhaseError> {
    let started = Instant::now();
    let parent = super::load_parent_output(deps, ctx, super::PHASE_STORYBOARD).await?;
    let mut spec = parent
        .spec()
        .cloned()
        .ok_or(PhaseError::MissingInput {
            phase: super::PHASE_STORYBOARD,
            field: "spec",
        })?;
    if spec.beats.is_empty() {
        return Err(PhaseError::Integrity("Spec has zero beats".into()));
    }

    let beat_count = spec.beats.len();
    let mut artifacts = Vec::with_capacity(beat_count);
    for i in 0..beat_count {
        let prompt = build_image_prompt(&spec.beats[i], &spec);
        info!(video_id = %ctx.video_id, beat = i, "generating storyboard frame");

        let frame = deps.image_model.generate(&prompt, "16:9").await?;
        let key = video_key(&ctx.owner_id, &ctx.video_id, &format!("beat_{:02}.png", i));
        let blob = deps.objects.upload_file(&frame, &key).await?;
        spec.beats[i].image_url = Some(blob.blob_url.clone());
        artifacts.push((i, blob));

        let fraction = progress_marks::PLAN_DONE
            + (progress_marks::STORYBOARD_DONE - progress_marks::PLAN_DONE)
                * ((i + 1) as f64 / beat_count as f64);
        publish_progress(deps, ctx, super::PHASE_STORYBOARD, fraction, "storyboarding").await;
    }

    let cost_usd = IMAGE_COST_USD * beat_count as f64;
    let output = PhaseOutput::Storyboard(StoryboardOutput {
        video_id: ctx.video_id.clone(),
        spec: spec.clone(),
        cost_usd,
        duration_seconds: started.elapsed().as_secs_f64(),
    });

    let checkpoint = {
        let ctx = ctx.clone();
        let output_value = output.to_value();
        let spec_value = serde_json::to_value(&spec).expect("spec serializes");
        deps.db
            .call(move |db| {
                let checkpoint = db.create_checkpoint(NewCheckpoint {
                    video_id: &ctx.video_id,
                    branch_name: &ctx.branch,
                    phase_number: super::PHASE_STORYBOARD,
                    version: ctx.version,
                    parent_checkpoint_id: ctx.parent_checkpoint_id.as_deref(),
                    phase_output: &output_value,
                    cost_usd,
                    owner_id: &ctx.owner_id,
                    edit_description: None,
                })?;
                for (i, blob) in &artifacts {
                    db.create_artifact(NewArtifact {
                        checkpoint_id: &checkpoint.id,
                        artifact_type: ArtifactType::BeatImage,
                        artifact_key: &format!("beat_{}", i),
                        blob_url: &blob.blob_url,
                        blob_key: &blob.blob_key,
                        version: 1,
                        parent_artifact_id: None,
                        metadata: Some(&serde_json::json!({"sha256": blob.sha256})),
                        size_bytes: Some(blob.size_bytes),
                    })?;
                }
                db.update_video_spec(&ctx.video_id, &spec_value)?;
                db.add_video_cost(&ctx.video_id, cost_usd)?;
                db.set_phase_output(
                    &ctx.video_id,
                    phase_key(super::PHASE_STORYBOARD),
                    &output_value,
                )?;
                Ok(checkpoint)
            })
            .await
            .map_err(PhaseError::Other)?
    };

    Ok(PhaseCompletion {
        checkpoint,
        output,
        cost_usd,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::{AudioSpec, Product, Style};

    #[test]
    fn image_prompt_combines_beat_and_style() {
        let spec = VideoSpec {
            beats: vec![Beat {
                id: "opening".into(),
                start: 0.0,
                duration: 10.0,
                prompt_template: "Pan across {product_name}".into(),
                shot_type: "wide".into(),
                image_url: None,
            }],
            style: Style {
                aesthetic: "cinematic".into(),
                mood: "bold".into(),
            },
            product: Product {
                name: "chrome kettle".into(),
                description: None,
            },
            audio: AudioSpec::default(),
            duration: 10.0,
            fps: 24,
            model: "hailuo_fast".into(),
            transitions: vec![],
        };

        let prompt = build_image_prompt(&spec.beats[0], &spec);
        assert!(prompt.starts_with("Pan across chrome kettle"));
        assert!(prompt.contains("bold cinematic aesthetic"));
        assert!(prompt.contains("wide shot"));
        assert!(prompt.contains("featuring chrome kettle"));
    }
}
