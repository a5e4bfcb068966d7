//! Phase runners and their shared data model.
//!
//! The four runners (Plan, Storyboard, Chunks, Refine) share one shape:
//! load inputs from the parent phase output, do the work, upload blobs,
//! create a checkpoint plus artifacts, write the video row and progress,
//! and hand an auto-continue decision back to the orchestrator loop.
//!
//! `PhaseOutput` is the tagged union persisted as each checkpoint's
//! phase_output JSON blob and as the per-phase entry on the video row.

pub mod chunks;
pub mod plan;
pub mod refine;
pub mod storyboard;

use serde::{Deserialize, Serialize};

use crate::errors::PhaseError;
use crate::progress::ProgressDoc;

// ── Video spec ────────────────────────────────────────────────────────

fn default_fps() -> u32 {
    24
}

fn default_model() -> String {
    "hailuo_fast".to_string()
}

/// A narrative segment with its own prompt, duration and shot style.
/// Phase 2 fills in `image_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beat {
    pub id: String,
    pub start: f64,
    pub duration: f64,
    pub prompt_template: String,
    pub shot_type: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Style {
    pub aesthetic: String,
    pub mood: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioSpec {
    #[serde(default)]
    pub genre: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub kind: String,
    pub at: f64,
}

/// The Phase-1 plan: beats plus global look, product, audio and model
/// settings. Invariant: beat durations sum to `duration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoSpec {
    pub beats: Vec<Beat>,
    pub style: Style,
    pub product: Product,
    #[serde(default)]
    pub audio: AudioSpec,
    pub duration: f64,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

// ── Phase outputs ─────────────────────────────────────────────────────

pub const PHASE_PLAN: u8 = 1;
pub const PHASE_STORYBOARD: u8 = 2;
pub const PHASE_CHUNKS: u8 = 3;
pub const PHASE_REFINE: u8 = 4;
pub const TERMINAL_PHASE: u8 = PHASE_REFINE;

/// Key of a phase's entry in `Video.phase_outputs`.
pub fn phase_key(phase: u8) -> &'static str {
    match phase {
        PHASE_PLAN => "phase1_plan",
        PHASE_STORYBOARD => "phase2_storyboard",
        PHASE_CHUNKS => "phase3_chunks",
        PHASE_REFINE => "phase4_refine",
        _ => "unknown_phase",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOutput {
    pub video_id: String,
    pub spec: VideoSpec,
    pub cost_usd: f64,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryboardOutput {
    pub video_id: String,
    /// The plan spec with `image_url` present on every beat.
    pub spec: VideoSpec,
    pub cost_usd: f64,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunksOutput {
    pub video_id: String,
    pub spec: VideoSpec,
    pub chunk_urls: Vec<String>,
    pub stitched_video_url: String,
    pub cost_usd: f64,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefineOutput {
    pub video_id: String,
    pub final_video_url: String,
    #[serde(default)]
    pub music_url: Option<String>,
    pub cost_usd: f64,
    pub duration_seconds: f64,
}

/// Serialized form of every checkpoint's phase_output blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase")]
pub enum PhaseOutput {
    #[serde(rename = "phase1_plan")]
    Plan(PlanOutput),
    #[serde(rename = "phase2_storyboard")]
    Storyboard(StoryboardOutput),
    #[serde(rename = "phase3_chunks")]
    Chunks(ChunksOutput),
    #[serde(rename = "phase4_refine")]
    Refine(RefineOutput),
}

impl PhaseOutput {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("phase output serializes")
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, PhaseError> {
        serde_json::from_value(value.clone()).map_err(|e| {
            PhaseError::Validation(format!("Unparseable phase output: {}", e))
        })
    }

    /// The spec carried by plan/storyboard/chunks outputs.
    pub fn spec(&self) -> Option<&VideoSpec> {
        match self {
            Self::Plan(out) => Some(&out.spec),
            Self::Storyboard(out) => Some(&out.spec),
            Self::Chunks(out) => Some(&out.spec),
            Self::Refine(_) => None,
        }
    }
}

// ── Runner plumbing ───────────────────────────────────────────────────

/// Everything a phase task needs to locate its inputs; reconstructed from
/// the DB on dispatch, so tasks stay idempotent.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub video_id: String,
    pub owner_id: String,
    pub branch: String,
    pub version: i64,
    pub parent_checkpoint_id: Option<String>,
}

/// What a successful phase hands back to the dispatch loop.
pub struct PhaseCompletion {
    pub checkpoint: crate::store::Checkpoint,
    pub output: PhaseOutput,
    pub cost_usd: f64,
}

/// Progress checkpoints per phase; values are percentages of the whole
/// pipeline (pacing signal only).
pub mod progress_marks {
    pub const PLAN_START: f64 = 0.0;
    pub const PLAN_DONE: f64 = 25.0;
    pub const STORYBOARD_DONE: f64 = 40.0;
    pub const CHUNKS_ANCHORS_DONE: f64 = 60.0;
    pub const CHUNKS_CONTINUATIONS_DONE: f64 = 70.0;
    pub const CHUNKS_STITCH_DONE: f64 = 75.0;
    pub const CHUNKS_DONE: f64 = 90.0;
    pub const REFINE_DONE: f64 = 100.0;
}

/// Publish a running-status progress doc and mirror the fraction onto the
/// video row.
pub async fn publish_progress(
    deps: &crate::deps::Deps,
    ctx: &PhaseContext,
    phase: u8,
    progress: f64,
    status: &str,
) {
    let video_id = ctx.video_id.clone();
    let _ = deps
        .db
        .call(move |db| db.update_video_progress(&video_id, progress))
        .await;
    deps.progress
        .publish(
            &ctx.video_id,
            &ProgressDoc {
                status: status.to_string(),
                progress,
                current_phase: Some(phase_key(phase).to_string()),
                ..Default::default()
            },
        )
        .await;
}

/// Load the parent checkpoint's parsed phase output, or fail validation.
pub async fn load_parent_output(
    deps: &crate::deps::Deps,
    ctx: &PhaseContext,
    phase: u8,
) -> Result<PhaseOutput, PhaseError> {
    let parent_id = ctx
        .parent_checkpoint_id
        .clone()
        .ok_or(PhaseError::MissingInput {
            phase,
            field: "parent_checkpoint_id",
        })?;
    let parent = deps
        .db
        .call(move |db| db.get_checkpoint(&parent_id))
        .await
        .map_err(PhaseError::Other)?
        .ok_or_else(|| PhaseError::Validation("Parent checkpoint not found".into()))?;
    PhaseOutput::from_value(&parent.phase_output)
}
