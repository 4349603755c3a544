use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use helm_link::{CompletionSynchronizer, TransportLink};
use helm_plan::{PlanEngine, PlanError, PlanRunResult};
use helm_store::{ChatMessage, HistoryStore, StoreError, Task};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<PlanEngine>,
    pub store: Arc<dyn HistoryStore>,
    pub link: TransportLink,
    pub synchronizer: CompletionSynchronizer,
}

pub fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/sessions/:id/messages", get(session_messages))
        .route("/api/sessions/:id/tasks", get(session_tasks))
        .route("/api/tasks/:id", get(task))
        .route("/api/link/status", get(link_status))
        .with_state(state)
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatus {
    pub connected: bool,
    pub url: String,
    pub pending_completions: usize,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<PlanError> for ApiError {
    fn from(error: PlanError) -> Self {
        match error {
            PlanError::SessionBusy(_) => ApiError::Conflict(error.to_string()),
            PlanError::Store(store) => store.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { .. } => ApiError::NotFound(error.to_string()),
            StoreError::InvalidInput(_) => ApiError::BadRequest(error.to_string()),
            StoreError::Conflict(_) => ApiError::Conflict(error.to_string()),
            StoreError::Backend(_) => ApiError::Internal(error.to_string()),
        }
    }
}

pub async fn chat(
    State(state): State<ApiState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<PlanRunResult>, ApiError> {
    if request.session_id.trim().is_empty() {
        return Err(ApiError::BadRequest("sessionId must not be empty".to_string()));
    }
    if request.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }
    let result = state
        .engine
        .handle_request(&request.session_id, &request.message)
        .await
        .map_err(|error| {
            warn!(session_id = %request.session_id, error = %error, "chat request failed");
            ApiError::from(error)
        })?;
    Ok(Json(result))
}

pub async fn session_messages(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    Ok(Json(state.store.list_messages(&session_id).await?))
}

pub async fn session_tasks(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.store.list_tasks(&session_id).await?))
}

pub async fn task(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    state
        .store
        .find_task(&task_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("task not found: {task_id}")))
}

pub async fn link_status(State(state): State<ApiState>) -> Json<LinkStatus> {
    Json(LinkStatus {
        connected: state.link.is_connected(),
        url: state.link.config().url.clone(),
        pending_completions: state.synchronizer.pending_count(),
    })
}
