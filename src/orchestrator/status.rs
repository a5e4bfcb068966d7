//! Composite status view: live progress from the cache with a DB
//! fallback, presigned artifact URLs, the pending checkpoint, the full
//! checkpoint tree, and the active branch tips.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{Orchestrator, RequestError};
use crate::deps::Deps;
use crate::store::{BranchInfo, Checkpoint, CheckpointStatus, TreeNode, Video};

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactView {
    pub id: String,
    pub artifact_type: String,
    pub artifact_key: String,
    pub url: String,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointInfo {
    pub checkpoint_id: String,
    pub branch_name: String,
    pub phase_number: u8,
    pub version: i64,
    pub status: CheckpointStatus,
    pub created_at: String,
    pub artifacts: BTreeMap<String, ArtifactView>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub video_id: String,
    pub status: String,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub total_cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storyboard_urls: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_urls: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stitched_video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_checkpoint: Option<CheckpointInfo>,
    pub checkpoint_tree: Vec<TreeNode>,
    pub active_branches: Vec<BranchInfo>,
}

/// Rough remaining time from the progress fraction; the pipeline budget
/// is about ten minutes end to end.
fn estimate_remaining(status: &str, progress: f64) -> Option<u64> {
    if status == "complete" || status == "failed" || progress <= 0.0 {
        return None;
    }
    Some(((100.0 - progress) / progress * 600.0) as u64)
}

/// Presign a blob reference, going through the per-video URL cache.
pub(crate) async fn presigned_cached(
    deps: &Deps,
    video_id: &str,
    cache_key: &str,
    blob_ref: &str,
) -> String {
    if blob_ref.starts_with("http") {
        return blob_ref.to_string();
    }
    if let Some(cached) = deps.progress.cached_presigned(video_id, cache_key).await {
        return cached;
    }
    match deps.objects.presign(blob_ref, deps.config.presign_ttl).await {
        Ok(url) => {
            deps.progress
                .cache_presigned(video_id, cache_key, &url)
                .await;
            url
        }
        Err(_) => blob_ref.to_string(),
    }
}

async fn checkpoint_info(deps: &Deps, video_id: &str, checkpoint: &Checkpoint) -> CheckpointInfo {
    let artifacts = {
        let cp_id = checkpoint.id.clone();
        deps.db
            .call(move |db| db.latest_artifacts_per_key(&cp_id))
            .await
            .unwrap_or_default()
    };

    let mut views = BTreeMap::new();
    for artifact in artifacts {
        let cache_key = format!("artifact:{}:{}", checkpoint.id, artifact.artifact_key);
        let url = presigned_cached(deps, video_id, &cache_key, &artifact.blob_url).await;
        views.insert(
            artifact.artifact_key.clone(),
            ArtifactView {
                id: artifact.id,
                artifact_type: artifact.artifact_type.as_str().to_string(),
                artifact_key: artifact.artifact_key,
                url,
                version: artifact.version,
                metadata: artifact.metadata,
                created_at: artifact.created_at,
            },
        );
    }

    CheckpointInfo {
        checkpoint_id: checkpoint.id.clone(),
        branch_name: checkpoint.branch_name.clone(),
        phase_number: checkpoint.phase_number,
        version: checkpoint.version,
        status: checkpoint.status,
        created_at: checkpoint.created_at.clone(),
        artifacts: views,
    }
}

impl Orchestrator {
    pub async fn status(
        &self,
        owner_id: &str,
        video_id: &str,
    ) -> Result<StatusResponse, RequestError> {
        let deps = self.deps();
        let video: Video = self.load_video(owner_id, video_id).await?;

        // Live progress first, row as fallback.
        let live = deps.progress.get(video_id).await;
        let (status, progress, current_phase, error) = match &live {
            Some(doc) => (
                doc.status.clone(),
                doc.progress,
                doc.current_phase.clone(),
                doc.error.clone(),
            ),
            None => (
                video.status.as_string(),
                video.progress,
                (video.current_phase > 0)
                    .then(|| crate::phases::phase_key(video.current_phase).to_string()),
                video.error_message.clone(),
            ),
        };

        let storyboard_urls = match &video.spec {
            Some(spec) => {
                let beats = spec["beats"].as_array().cloned().unwrap_or_default();
                let mut urls = Vec::new();
                for (i, beat) in beats.iter().enumerate() {
                    if let Some(url) = beat["image_url"].as_str() {
                        urls.push(
                            presigned_cached(deps, video_id, &format!("storyboard_{}", i), url)
                                .await,
                        );
                    }
                }
                (!urls.is_empty()).then_some(urls)
            }
            None => None,
        };

        let chunk_urls = if video.chunk_urls.is_empty() {
            None
        } else {
            let mut urls = Vec::with_capacity(video.chunk_urls.len());
            for (i, url) in video.chunk_urls.iter().enumerate() {
                urls.push(presigned_cached(deps, video_id, &format!("chunk_{}", i), url).await);
            }
            Some(urls)
        };

        let stitched_video_url = match &video.stitched_url {
            Some(url) => Some(presigned_cached(deps, video_id, "stitched_video_url", url).await),
            None => None,
        };
        let final_video_url = match &video.final_video_url {
            Some(url) => Some(presigned_cached(deps, video_id, "final_video_url", url).await),
            None => None,
        };
        let thumbnail_url = match &video.thumbnail_url {
            Some(url) => Some(presigned_cached(deps, video_id, "thumbnail_url", url).await),
            None => None,
        };

        let (current, tree, branches) = {
            let id = video_id.to_string();
            deps.db
                .call(move |db| {
                    Ok((
                        db.current_checkpoint(&id)?,
                        db.checkpoint_tree(&id)?,
                        db.active_branches(&id)?,
                    ))
                })
                .await?
        };
        let current_checkpoint = match &current {
            Some(cp) => Some(checkpoint_info(deps, video_id, cp).await),
            None => None,
        };

        let estimated_time_remaining = estimate_remaining(&status, progress);
        Ok(StatusResponse {
            video_id: video.id,
            status,
            progress,
            estimated_time_remaining,
            current_phase,
            error,
            total_cost: video.cost_usd,
            storyboard_urls,
            chunk_urls,
            stitched_video_url,
            final_video_url,
            thumbnail_url,
            current_checkpoint,
            checkpoint_tree: tree,
            active_branches: branches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eta_only_while_running() {
        assert_eq!(estimate_remaining("complete", 100.0), None);
        assert_eq!(estimate_remaining("failed", 40.0), None);
        assert_eq!(estimate_remaining("running_phase_1", 0.0), None);
        // Halfway through: roughly ten more minutes of budget scaled.
        assert_eq!(estimate_remaining("running_phase_3", 50.0), Some(600));
    }
}
