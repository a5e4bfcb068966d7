use serde::{Deserialize, Serialize};
use serde::de::Error as _;
use uuid::Uuid;

// ── Id helpers ────────────────────────────────────────────────────────

pub fn new_video_id() -> String {
    format!("vid-{}", Uuid::new_v4())
}

pub fn new_checkpoint_id() -> String {
    format!("cp-{}", Uuid::new_v4())
}

pub fn new_artifact_id() -> String {
    format!("art-{}", Uuid::new_v4())
}

// ── Video ─────────────────────────────────────────────────────────────

/// Lifecycle state of a video request. Serialized as a flat string so the
/// phase number travels inside the label (`running_phase_3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoStatus {
    Queued,
    RunningPhase(u8),
    PausedAtPhase(u8),
    Editing,
    Complete,
    Failed,
}

impl VideoStatus {
    pub fn as_string(&self) -> String {
        match self {
            Self::Queued => "queued".to_string(),
            Self::RunningPhase(n) => format!("running_phase_{}", n),
            Self::PausedAtPhase(n) => format!("paused_at_phase_{}", n),
            Self::Editing => "editing".to_string(),
            Self::Complete => "complete".to_string(),
            Self::Failed => "failed".to_string(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        if let Some(n) = s.strip_prefix("running_phase_") {
            return n
                .parse()
                .map(Self::RunningPhase)
                .map_err(|_| format!("Invalid status: {}", s));
        }
        if let Some(n) = s.strip_prefix("paused_at_phase_") {
            return n
                .parse()
                .map(Self::PausedAtPhase)
                .map_err(|_| format!("Invalid status: {}", s));
        }
        match s {
            "queued" => Ok(Self::Queued),
            "editing" => Ok(Self::Editing),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }

    /// A phase task or an edit is allowed to start only from a settled state.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Queued | Self::PausedAtPhase(_) | Self::Complete
        )
    }
}

impl Serialize for VideoStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> Deserialize<'de> for VideoStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(D::Error::custom)
    }
}

/// One row per user request. Mutated by phase runners and the editor,
/// never deleted by the pipeline core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Video {
    pub id: String,
    pub owner_id: String,
    pub prompt: String,
    pub status: VideoStatus,
    pub current_phase: u8,
    pub progress: f64,
    pub auto_continue: bool,
    pub cost_usd: f64,
    pub error_message: Option<String>,
    /// The latest approved video spec (beats, style, product, audio).
    pub spec: Option<serde_json::Value>,
    /// Caller-provided reference asset keys.
    pub assets: Vec<String>,
    /// Ordered list of current chunk blob references.
    pub chunk_urls: Vec<String>,
    pub stitched_url: Option<String>,
    pub final_video_url: Option<String>,
    pub final_music_url: Option<String>,
    pub thumbnail_url: Option<String>,
    /// Freeform per-phase output blobs keyed `phase1_plan` .. `phase6_editing`.
    pub phase_outputs: serde_json::Map<String, serde_json::Value>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

// ── Checkpoint ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Approved,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            _ => Err(format!("Invalid checkpoint status: {}", s)),
        }
    }
}

/// One node in the per-video checkpoint DAG. Branch names are paths like
/// `main`, `main-1`, `main-1-2`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub video_id: String,
    pub branch_name: String,
    pub phase_number: u8,
    pub version: i64,
    pub parent_checkpoint_id: Option<String>,
    pub status: CheckpointStatus,
    pub approved_at: Option<String>,
    pub created_at: String,
    pub phase_output: serde_json::Value,
    pub cost_usd: f64,
    pub owner_id: String,
    pub edit_description: Option<String>,
}

// ── Artifact ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Spec,
    BeatImage,
    VideoChunk,
    Music,
    FinalVideo,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spec => "spec",
            Self::BeatImage => "beat_image",
            Self::VideoChunk => "video_chunk",
            Self::Music => "music",
            Self::FinalVideo => "final_video",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "spec" => Ok(Self::Spec),
            "beat_image" => Ok(Self::BeatImage),
            "video_chunk" => Ok(Self::VideoChunk),
            "music" => Ok(Self::Music),
            "final_video" => Ok(Self::FinalVideo),
            _ => Err(format!("Invalid artifact type: {}", s)),
        }
    }
}

/// A typed, versioned blob reference attached to a checkpoint. One row per
/// version; the maximum version per `(type, key)` is the live one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub checkpoint_id: String,
    pub artifact_type: ArtifactType,
    pub artifact_key: String,
    pub blob_url: String,
    pub blob_key: String,
    pub version: i64,
    pub parent_artifact_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub size_bytes: Option<i64>,
    pub created_at: String,
}

// ── Derived views ─────────────────────────────────────────────────────

/// Checkpoint DAG materialised as nested nodes for the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub checkpoint: Checkpoint,
    pub children: Vec<TreeNode>,
}

/// A leaf checkpoint, i.e. an explorable branch tip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchInfo {
    pub branch_name: String,
    pub latest_checkpoint_id: String,
    pub phase_number: u8,
    pub status: CheckpointStatus,
    pub can_continue: bool,
}
