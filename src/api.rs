//! HTTP surface. All requests carry the owner id in the `x-owner-id`
//! header; responses are JSON. Status codes: 400 invalid input (wrong
//! phase for an edit kind included), 403 ownership mismatch, 404 unknown
//! resource, 500 internal failure.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use serde::Deserialize;

use crate::editor::chunks::{EditingState, list_versions};
use crate::orchestrator::status::presigned_cached;
use crate::orchestrator::{
    ArtifactEditResponse, ContinueResponse, EditRequest, GenerateRequest, Orchestrator,
    RequestError, SpecPatch,
};
use crate::phases::VideoSpec;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Orchestrator,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<RequestError> for ApiError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::Validation(msg) => Self::BadRequest(msg),
            RequestError::Ownership => Self::Forbidden(e.to_string()),
            RequestError::NotFound(what) => Self::NotFound(format!("{} not found", what)),
            RequestError::Internal(inner) => Self::Internal(inner.to_string()),
        }
    }
}

fn owner_from_headers(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-owner-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest("Missing x-owner-id header".into()))
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct BranchQuery {
    pub branch: Option<String>,
}

#[derive(Deserialize)]
pub struct ContinueBody {
    pub checkpoint_id: String,
}

#[derive(Deserialize)]
pub struct RegenerateBeatBody {
    pub beat_index: usize,
    #[serde(default)]
    pub prompt_override: Option<String>,
}

#[derive(Deserialize)]
pub struct RegenerateChunkBody {
    pub chunk_index: usize,
    #[serde(default)]
    pub model_override: Option<String>,
}

#[derive(Deserialize)]
pub struct VersionQuery {
    #[serde(default)]
    pub version: Option<String>,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/video", post(create_video))
        .route("/video/{video_id}", get(get_status).delete(delete_video))
        .route("/video/{video_id}/checkpoints", get(list_checkpoints))
        .route(
            "/video/{video_id}/checkpoints/current",
            get(current_checkpoint),
        )
        .route("/video/{video_id}/checkpoints/{cp_id}", get(get_checkpoint))
        .route("/video/{video_id}/checkpoint-tree", get(checkpoint_tree))
        .route("/video/{video_id}/branches", get(list_branches))
        .route("/video/{video_id}/continue", post(continue_video))
        .route(
            "/video/{video_id}/checkpoints/{cp_id}/spec",
            patch(patch_spec),
        )
        .route(
            "/video/{video_id}/checkpoints/{cp_id}/upload-image",
            post(upload_image),
        )
        .route(
            "/video/{video_id}/checkpoints/{cp_id}/regenerate-beat",
            post(regenerate_beat),
        )
        .route(
            "/video/{video_id}/checkpoints/{cp_id}/regenerate-chunk",
            post(regenerate_chunk),
        )
        .route("/video/{video_id}/edit", post(edit_video))
        .route("/video/{video_id}/chunks", get(list_chunks))
        .route(
            "/video/{video_id}/chunks/{chunk_index}/preview",
            get(chunk_preview),
        )
        .route(
            "/video/{video_id}/chunks/{chunk_index}/select-version",
            post(select_version),
        )
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_video(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<GenerateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let video = state.orchestrator.generate(&owner, request).await?;
    Ok(Json(serde_json::json!({"video_id": video.id})))
}

async fn get_status(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(video_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let status = state.orchestrator.status(&owner, &video_id).await?;
    Ok(Json(status))
}

async fn delete_video(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(video_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from_headers(&headers)?;
    state.orchestrator.delete_video(&owner, &video_id).await?;
    Ok(Json(serde_json::json!({"deleted": true})))
}

async fn list_checkpoints(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(video_id): Path<String>,
    Query(query): Query<BranchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from_headers(&headers)?;
    state.orchestrator.load_video(&owner, &video_id).await?;
    let checkpoints = {
        let id = video_id.clone();
        state
            .orchestrator
            .deps()
            .db
            .call(move |db| db.list_checkpoints(&id, query.branch.as_deref()))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
    };
    Ok(Json(checkpoints))
}

async fn current_checkpoint(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(video_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from_headers(&headers)?;
    state.orchestrator.load_video(&owner, &video_id).await?;
    let checkpoint = {
        let id = video_id.clone();
        state
            .orchestrator
            .deps()
            .db
            .call(move |db| db.current_checkpoint(&id))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
    };
    checkpoint
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("No pending checkpoint".into()))
}

async fn get_checkpoint(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((video_id, cp_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let checkpoint = state
        .orchestrator
        .load_checkpoint(&owner, &video_id, &cp_id)
        .await?;
    let artifacts = {
        let id = checkpoint.id.clone();
        state
            .orchestrator
            .deps()
            .db
            .call(move |db| db.list_artifacts(&id))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
    };
    Ok(Json(serde_json::json!({
        "checkpoint": checkpoint,
        "artifacts": artifacts,
    })))
}

async fn checkpoint_tree(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(video_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from_headers(&headers)?;
    state.orchestrator.load_video(&owner, &video_id).await?;
    let tree = {
        let id = video_id.clone();
        state
            .orchestrator
            .deps()
            .db
            .call(move |db| db.checkpoint_tree(&id))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
    };
    Ok(Json(tree))
}

async fn list_branches(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(video_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from_headers(&headers)?;
    state.orchestrator.load_video(&owner, &video_id).await?;
    let branches = {
        let id = video_id.clone();
        state
            .orchestrator
            .deps()
            .db
            .call(move |db| db.active_branches(&id))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
    };
    Ok(Json(branches))
}

async fn continue_video(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(video_id): Path<String>,
    Json(body): Json<ContinueBody>,
) -> Result<Json<ContinueResponse>, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let response = state
        .orchestrator
        .continue_from_checkpoint(&owner, &video_id, &body.checkpoint_id)
        .await?;
    Ok(Json(response))
}

async fn patch_spec(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((video_id, cp_id)): Path<(String, String)>,
    Json(body): Json<SpecPatch>,
) -> Result<Json<ArtifactEditResponse>, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let response = state
        .orchestrator
        .update_spec_artifact(&owner, &video_id, &cp_id, body)
        .await?;
    Ok(Json(response))
}

async fn upload_image(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((video_id, cp_id)): Path<(String, String)>,
    mut multipart: Multipart,
) -> Result<Json<ArtifactEditResponse>, ApiError> {
    let owner = owner_from_headers(&headers)?;

    let mut beat_index: Option<usize> = None;
    let mut image: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {}", e)))?
    {
        match field.name() {
            Some("beat_index") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                beat_index = Some(
                    text.trim()
                        .parse()
                        .map_err(|_| ApiError::BadRequest("beat_index must be an integer".into()))?,
                );
            }
            Some("image") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                image = Some(bytes.to_vec());
            }
            _ => {}
        }
    }
    let beat_index =
        beat_index.ok_or_else(|| ApiError::BadRequest("Missing beat_index field".into()))?;
    let image = image.ok_or_else(|| ApiError::BadRequest("Missing image field".into()))?;

    let response = state
        .orchestrator
        .upload_beat_image(&owner, &video_id, &cp_id, beat_index, image)
        .await?;
    Ok(Json(response))
}

async fn regenerate_beat(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((video_id, cp_id)): Path<(String, String)>,
    Json(body): Json<RegenerateBeatBody>,
) -> Result<Json<ArtifactEditResponse>, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let response = state
        .orchestrator
        .regenerate_beat(&owner, &video_id, &cp_id, body.beat_index, body.prompt_override)
        .await?;
    Ok(Json(response))
}

async fn regenerate_chunk(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((video_id, cp_id)): Path<(String, String)>,
    Json(body): Json<RegenerateChunkBody>,
) -> Result<Json<ArtifactEditResponse>, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let response = state
        .orchestrator
        .regenerate_chunk(&owner, &video_id, &cp_id, body.chunk_index, body.model_override)
        .await?;
    Ok(Json(response))
}

async fn edit_video(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(video_id): Path<String>,
    Json(body): Json<EditRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let response = state.orchestrator.edit(&owner, &video_id, body).await?;
    Ok(Json(response))
}

async fn list_chunks(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(video_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let video = state.orchestrator.load_video(&owner, &video_id).await?;
    let deps = state.orchestrator.deps();
    let spec: Option<VideoSpec> = video
        .spec
        .as_ref()
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    let editing = EditingState::load(&video);

    let mut chunks = Vec::with_capacity(video.chunk_urls.len());
    for index in 0..video.chunk_urls.len() {
        if let Some(mut metadata) =
            crate::editor::chunks::chunk_metadata(&video, &editing, spec.as_ref(), index)
        {
            metadata.url = presigned_cached(
                deps,
                &video_id,
                &format!("chunk_{}", index),
                &metadata.url,
            )
            .await;
            chunks.push(metadata);
        }
    }
    Ok(Json(serde_json::json!({"chunks": chunks})))
}

async fn chunk_preview(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((video_id, chunk_index)): Path<(String, usize)>,
    Query(query): Query<VersionQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let video = state.orchestrator.load_video(&owner, &video_id).await?;
    let editing = EditingState::load(&video);
    let versions = list_versions(&video, &editing, chunk_index);
    if versions.is_empty() {
        return Err(ApiError::NotFound(format!("Chunk {} not found", chunk_index)));
    }

    let requested = query.version.as_deref().unwrap_or("current");
    let chosen = if requested == "current" {
        versions.iter().find(|v| v.is_selected).or(versions.first())
    } else {
        versions.iter().find(|v| v.version_id == requested)
    };
    let chosen = chosen.ok_or_else(|| {
        ApiError::BadRequest(format!(
            "Chunk {} has no version '{}'",
            chunk_index, requested
        ))
    })?;

    let cache_key = format!("preview:{}:{}", chunk_index, chosen.version_id);
    let url = presigned_cached(state.orchestrator.deps(), &video_id, &cache_key, &chosen.url).await;
    Ok(Json(serde_json::json!({"preview_url": url})))
}

async fn select_version(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((video_id, chunk_index)): Path<(String, usize)>,
    Query(query): Query<VersionQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let version = query
        .version
        .ok_or_else(|| ApiError::BadRequest("Missing version query parameter".into()))?;
    state
        .orchestrator
        .select_chunk_version(&owner, &video_id, chunk_index, &version)
        .await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

// ── Tests ─────────────────────────────────────────────────────────────
