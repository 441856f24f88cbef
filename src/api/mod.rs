//! HTTP surface consumed by the pipeline: job submission, status, video
//! listing, deletion, and streaming. Authentication happens upstream; the
//! verified user id arrives in the `x-user-id` header.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::pipeline::{ErrorKind, JobRequest, JobState, JobStatus};
use crate::shared::models::VideoStatus;
use crate::shared::state::AppState;
use crate::storage::StorageError;
use crate::store::{StoreError, VideoFilters};

pub const MAX_PROMPT_CHARS: usize = 2000;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication required")]
    Auth { requires_refresh: bool },
    #[error("{0}")]
    InvalidPrompt(String),
    #[error("service is at capacity")]
    Busy,
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("internal error")]
    Internal,
}

impl ApiError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth { .. } => ErrorKind::Auth,
            Self::InvalidPrompt(_) => ErrorKind::InvalidPrompt,
            Self::Busy => ErrorKind::Busy,
            Self::NotFound => ErrorKind::NotFound,
            Self::Forbidden => ErrorKind::Forbidden,
            Self::Internal => ErrorKind::DbFailed,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Auth { .. } => StatusCode::UNAUTHORIZED,
            Self::InvalidPrompt(_) => StatusCode::BAD_REQUEST,
            Self::Busy => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let mut body = serde_json::json!({
            "error": { "kind": self.kind().as_str(), "message": self.to_string() }
        });
        if let Self::Auth { requires_refresh: true } = self {
            body["requires_refresh"] = serde_json::json!(true);
        }
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound => Self::NotFound,
            StoreError::Forbidden => Self::Forbidden,
            StoreError::Db(message) => {
                error!("store failure: {}", message);
                Self::Internal
            }
        }
    }
}

fn authenticated_user(headers: &HeaderMap) -> Result<String, ApiError> {
    let expired = headers
        .get("x-auth-expired")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "true")
        .unwrap_or(false);
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or(ApiError::Auth {
            requires_refresh: expired,
        })
}

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/api/generate", post(generate))
        .route("/api/status/:job_id", get(job_status))
        .route("/api/videos", get(list_videos))
        .route("/api/videos/:video_id", delete(delete_video))
        .route("/api/videos/:video_id/stream", get(stream_video))
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    prompt: String,
}

async fn generate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<GenerateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = authenticated_user(&headers)?;
    let prompt = request.prompt.trim().to_string();
    let chars = prompt.chars().count();
    if chars == 0 {
        return Err(ApiError::InvalidPrompt("prompt is empty".to_string()));
    }
    if chars > MAX_PROMPT_CHARS {
        return Err(ApiError::InvalidPrompt(format!(
            "prompt is {} characters, cap is {}",
            chars, MAX_PROMPT_CHARS
        )));
    }

    let job_id = Uuid::new_v4();
    state.coordinator.register(job_id).await;
    if state
        .queue
        .submit(JobRequest {
            job_id,
            user_id,
            prompt,
        })
        .is_err()
    {
        state.coordinator.unregister(job_id).await;
        return Err(ApiError::Busy);
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "job_id": job_id })),
    ))
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = authenticated_user(&headers)?;
    let status = match state.coordinator.status(job_id).await {
        Some(status) => status,
        // The in-memory map is a cache; fall back to the videos table.
        None => {
            let row = state.store.get_video(&user_id, job_id).await?;
            let state_from_row = match row.status.as_str() {
                s if s == VideoStatus::Completed.as_str() => JobState::Completed,
                s if s == VideoStatus::Failed.as_str() => JobState::Failed,
                _ => JobState::Queued,
            };
            JobStatus {
                state: state_from_row,
                attempt: 0,
                video_id: row.id,
                url: row.result_url,
                error: None,
            }
        }
    };
    let mut body = serde_json::json!({
        "state": status.state.as_str(),
        "attempt": status.attempt,
    });
    if let Some(url) = status.url {
        body["url"] = serde_json::json!(url);
    }
    if let Some(job_error) = status.error {
        body["error"] = serde_json::json!({
            "kind": job_error.kind.as_str(),
            "message": job_error.message,
        });
    }
    Ok(Json(body))
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    status: Option<String>,
    tag: Option<String>,
    limit: Option<i64>,
}

async fn list_videos(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = authenticated_user(&headers)?;
    let rows = state
        .store
        .list_videos(
            &user_id,
            VideoFilters {
                status: query.status,
                tag: query.tag,
                limit: query.limit,
            },
        )
        .await?;
    Ok(Json(serde_json::json!(rows)))
}

#[derive(Debug, Default, Deserialize)]
struct DeleteQuery {
    object_key: Option<String>,
}

async fn delete_video(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(video_id): Path<Uuid>,
    Query(query): Query<DeleteQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = authenticated_user(&headers)?;
    let row = state.store.delete_video(&user_id, video_id).await?;
    let object_key = row.object_key.or(query.object_key);
    if let Some(object_key) = object_key {
        match state.storage.delete(&user_id, &object_key).await {
            Ok(_) => {}
            Err(e) => error!(video_id = %video_id, "storage delete failed: {}", e),
        }
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn stream_video(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(video_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = authenticated_user(&headers)?;
    let row = state.store.get_video(&user_id, video_id).await?;
    let object_key = row.object_key.ok_or(ApiError::NotFound)?;
    let bytes = state
        .storage
        .fetch(&user_id, &object_key)
        .await
        .map_err(|e| match e {
            StorageError::Auth => ApiError::Forbidden,
            other => {
                error!(video_id = %video_id, "fetch failed: {}", other);
                ApiError::Internal
            }
        })?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "video/mp4")],
        bytes,
    ))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let primary = state.llm_primary.health().await;
    let fallback = state.llm_fallback.health().await;
    let mut backends = serde_json::Map::new();
    backends.insert(
        state.llm_primary.name().to_string(),
        serde_json::json!({ "ok": primary.ok, "latency_ms": primary.latency_ms }),
    );
    backends.insert(
        state.llm_fallback.name().to_string(),
        serde_json::json!({ "ok": fallback.ok, "latency_ms": fallback.latency_ms }),
    );
    Json(serde_json::json!({ "status": "ok", "backends": backends }))
}
