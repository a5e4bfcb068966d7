//! Phase 1 (Plan): turn the user prompt into a beat-level video spec.
//!
//! Beat boundaries are snapped onto the selected model's chunk-spacing
//! grid so every beat later acquires an anchor chunk. Planning is pure
//! computation; the only blob produced is the spec JSON itself.

use std::io::Write;
use std::time::Instant;

use tracing::info;

use super::{
    AudioSpec, Beat, PhaseCompletion, PhaseContext, PhaseOutput, PlanOutput, Product, Style,
    VideoSpec, phase_key, progress_marks, publish_progress,
};
use crate::clients::registry;
use crate::deps::Deps;
use crate::errors::PhaseError;
use crate::object_io::video_key;
use crate::scheduler::CHUNK_OVERLAP_FRACTION;
use crate::store::checkpoints::NewCheckpoint;
use crate::store::artifacts::NewArtifact;
use crate::store::ArtifactType;

const BEAT_IDS: [&str; 5] = ["opening", "build", "feature", "reveal", "closing"];
const BEAT_PHRASES: [&str; 5] = [
    "establishing shot introducing",
    "dynamic build-up around",
    "detailed feature focus on",
    "dramatic reveal of",
    "closing hero shot of",
];
const SHOT_TYPES: [&str; 5] = ["wide", "close_up", "product", "lifestyle", "hero"];

/// A minimal spec carrying only the caller's requested settings; the
/// planner fills in everything else.
pub fn seed_spec(duration: f64, model: &str, fps: u32) -> VideoSpec {
    VideoSpec {
        beats: Vec::new(),
        style: Style {
            aesthetic: "cinematic".into(),
            mood: "energetic".into(),
        },
        product: Product {
            name: String::new(),
            description: None,
        },
        audio: AudioSpec::default(),
        duration,
        fps,
        model: model.to_string(),
        transitions: Vec::new(),
    }
}

fn derive_product_name(prompt: &str) -> String {
    const STOPWORDS: [&str; 10] = [
        "showcase", "show", "a", "an", "the", "of", "for", "with", "create", "make",
    ];
    let words: Vec<&str> = prompt
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty() && !STOPWORDS.contains(&w.to_lowercase().as_str()))
        .take(4)
        .collect();
    if words.is_empty() {
        "the product".to_string()
    } else {
        words.join(" ").to_lowercase()
    }
}

fn infer_mood(prompt: &str) -> &'static str {
    let lower = prompt.to_lowercase();
    for mood in ["elegant", "calm", "bold", "playful", "dramatic"] {
        if lower.contains(mood) {
            return match mood {
                "elegant" => "elegant",
                "calm" => "calm",
                "bold" => "bold",
                "playful" => "playful",
                _ => "dramatic",
            };
        }
    }
    "energetic"
}

fn infer_genre(mood: &str) -> &'static str {
    match mood {
        "calm" | "elegant" => "calm",
        _ => "upbeat",
    }
}

/// Build the full spec from the prompt, any caller-provided reference
/// assets, and the requested settings. Beat starts land on chunk-spacing
/// multiples and beat durations sum exactly to the total duration.
pub fn build_spec(prompt: &str, assets: &[String], seed: &VideoSpec) -> Result<VideoSpec, PhaseError> {
    if seed.duration <= 0.0 {
        return Err(PhaseError::Validation("Duration must be positive".into()));
    }
    let model = registry::model_or_default(&seed.model);
    let chunk_duration = model.actual_chunk_duration;
    let chunk_spacing = chunk_duration * (1.0 - CHUNK_OVERLAP_FRACTION);
    let chunk_count = (seed.duration / chunk_duration).ceil() as usize;

    let beat_count = ((chunk_count + 1) / 2).clamp(1, BEAT_IDS.len());
    let mut boundary_chunks: Vec<usize> = (0..beat_count)
        .map(|j| j * chunk_count / beat_count)
        .collect();
    boundary_chunks.dedup();

    let mood = infer_mood(prompt);
    let product_name = derive_product_name(prompt);
    let prompt_clean = prompt.trim().trim_end_matches('.');

    let mut beats = Vec::with_capacity(boundary_chunks.len());
    for (j, &chunk_index) in boundary_chunks.iter().enumerate() {
        let start = chunk_index as f64 * chunk_spacing;
        let end = match boundary_chunks.get(j + 1) {
            Some(&next) => next as f64 * chunk_spacing,
            None => seed.duration,
        };
        let slot = j * BEAT_IDS.len() / boundary_chunks.len();
        beats.push(Beat {
            id: BEAT_IDS[slot].to_string(),
            start,
            duration: end - start,
            prompt_template: format!(
                "{}. {} {{product_name}}, {{style_aesthetic}} look, {} mood",
                prompt_clean, BEAT_PHRASES[slot], mood
            ),
            shot_type: SHOT_TYPES[slot].to_string(),
            image_url: None,
        });
    }

    Ok(VideoSpec {
        beats,
        style: Style {
            aesthetic: seed.style.aesthetic.clone(),
            mood: mood.to_string(),
        },
        product: Product {
            name: product_name,
            description: (!assets.is_empty())
                .then(|| format!("grounded on {} caller-provided reference asset(s)", assets.len())),
        },
        audio: AudioSpec {
            genre: seed
                .audio
                .genre
                .clone()
                .or_else(|| Some(infer_genre(mood).to_string())),
        },
        duration: seed.duration,
        fps: seed.fps,
        model: seed.model.clone(),
        transitions: seed.transitions.clone(),
    })
}

pub async fn run(deps: &Deps, ctx: &PhaseContext) -> Result<PhaseCompletion, PhaseError> {
    let started = Instant::now();
    publish_progress(deps, ctx, super::PHASE_PLAN, 5.0, "planning").await;

    let video_id = ctx.video_id.clone();
    let owner_id = ctx.owner_id.clone();
    let video = deps
        .db
        .call(move |db| db.get_video(&video_id, &owner_id))
        .await
        .map_err(PhaseError::Other)?
        .ok_or_else(|| PhaseError::Validation("Video not found".into()))?;

    let seed = video
        .spec
        .as_ref()
        .and_then(|v| serde_json::from_value::<VideoSpec>(v.clone()).ok())
        .unwrap_or_else(|| seed_spec(20.0, "hailuo_fast", 24));
    let spec = build_spec(&video.prompt, &video.assets, &seed)?;
    info!(
        video_id = %ctx.video_id,
        beats = spec.beats.len(),
        duration = spec.duration,
        model = %spec.model,
        "plan built"
    );

    // The spec itself is the phase's only blob.
    let mut file = tempfile::Builder::new()
        .prefix("vidforge-spec-")
        .suffix(".json")
        .tempfile()
        .map_err(|e| PhaseError::Media(format!("Failed to create spec file: {}", e)))?;
    let pretty = serde_json::to_vec_pretty(&spec)
        .map_err(|e| PhaseError::Validation(format!("Spec serialization failed: {}", e)))?;
    file.write_all(&pretty)
        .map_err(|e| PhaseError::Media(format!("Failed to write spec file: {}", e)))?;
    let spec_path = file.into_temp_path();

    let key = video_key(&ctx.owner_id, &ctx.video_id, "spec.json");
    let blob = deps.objects.upload_file(&spec_path, &key).await?;

    let output = PhaseOutput::Plan(PlanOutput {
        video_id: ctx.video_id.clone(),
        spec: spec.clone(),
        cost_usd: 0.0,
        duration_seconds: started.elapsed().as_secs_f64(),
    });

    let checkpoint = {
        let ctx = ctx.clone();
        let output_value = output.to_value();
        let spec_value = serde_json::to_value(&spec).expect("spec serializes");
        let blob = blob.clone();
        deps.db
            .call(move |db| {
                let checkpoint = db.create_checkpoint(NewCheckpoint {
                    video_id: &ctx.video_id,
                    branch_name: &ctx.branch,
                    phase_number: super::PHASE_PLAN,
                    version: ctx.version,
                    parent_checkpoint_id: ctx.parent_checkpoint_id.as_deref(),
                    phase_output: &output_value,
                    cost_usd: 0.0,
                    owner_id: &ctx.owner_id,
                    edit_description: None,
                })?;
                db.create_artifact(NewArtifact {
                    checkpoint_id: &checkpoint.id,
                    artifact_type: ArtifactType::Spec,
                    artifact_key: "spec",
                    blob_url: &blob.blob_url,
                    blob_key: &blob.blob_key,
                    version: 1,
                    parent_artifact_id: None,
                    metadata: Some(&serde_json::json!({"sha256": blob.sha256})),
                    size_bytes: Some(blob.size_bytes),
                })?;
                db.update_video_spec(&ctx.video_id, &spec_value)?;
                db.set_phase_output(&ctx.video_id, phase_key(super::PHASE_PLAN), &output_value)?;
                Ok(checkpoint)
            })
            .await
            .map_err(PhaseError::Other)?
    };

    publish_progress(deps, ctx, super::PHASE_PLAN, progress_marks::PLAN_DONE, "planned").await;

    Ok(PhaseCompletion {
        checkpoint,
        output,
        cost_usd: 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::plan_chunks;

    #[test]
    fn beat_durations_sum_to_total() {
        let spec = build_spec(
            "Showcase a chrome kettle",
            &[],
            &seed_spec(20.0, "hailuo_fast", 24),
        )
        .unwrap();
        let sum: f64 = spec.beats.iter().map(|b| b.duration).sum();
        assert!((sum - 20.0).abs() < 1e-9);
        assert_eq!(spec.beats[0].start, 0.0);
    }

    #[test]
    fn planned_beats_all_acquire_anchors() {
        // Fill in storyboard images, then the chunk planner must accept
        // the spec without orphans for a range of durations.
        for duration in [5.0, 10.0, 20.0, 30.0, 47.0] {
            let mut spec = build_spec(
                "Showcase a chrome kettle",
                &[],
                &seed_spec(duration, "hailuo_fast", 24),
            )
            .unwrap();
            for beat in &mut spec.beats {
                beat.image_url = Some("s3://bucket/beat.png".into());
            }
            let plan = plan_chunks(&spec)
                .unwrap_or_else(|e| panic!("duration {}: {}", duration, e));
            assert!(plan.beat_to_chunk.contains_key(&0));
        }
    }

    #[test]
    fn beat_count_is_bounded() {
        let short = build_spec("x", &[], &seed_spec(5.0, "hailuo_fast", 24)).unwrap();
        assert_eq!(short.beats.len(), 1);

        let long = build_spec("x", &[], &seed_spec(120.0, "hailuo_fast", 24)).unwrap();
        assert!(long.beats.len() <= 5);
    }

    #[test]
    fn product_name_drops_stopwords() {
        assert_eq!(
            derive_product_name("Showcase a chrome kettle"),
            "chrome kettle"
        );
        assert_eq!(derive_product_name("the of a"), "the product");
    }

    #[test]
    fn mood_and_genre_inference() {
        let spec = build_spec(
            "An elegant perfume bottle",
            &[],
            &seed_spec(10.0, "hailuo_fast", 24),
        )
        .unwrap();
        assert_eq!(spec.style.mood, "elegant");
        assert_eq!(spec.audio.genre.as_deref(), Some("calm"));

        let spec = build_spec("Fast sneakers", &[], &seed_spec(10.0, "hailuo_fast", 24)).unwrap();
        assert_eq!(spec.audio.genre.as_deref(), Some("upbeat"));
    }

    #[test]
    fn zero_duration_is_rejected() {
        let err = build_spec("x", &[], &seed_spec(0.0, "hailuo_fast", 24)).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn templates_keep_placeholders_for_rendering() {
        let spec = build_spec("Showcase a kettle", &[], &seed_spec(20.0, "hailuo_fast", 24)).unwrap();
        assert!(spec.beats[0].prompt_template.contains("{product_name}"));
        assert!(spec.beats[0].prompt_template.contains("{style_aesthetic}"));
    }
}
