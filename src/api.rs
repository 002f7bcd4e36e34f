//! REST surface over the orchestrator, pool and branch tracker.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::error::{Error, ProvisioningError, TaskError};
use crate::git::BranchTracker;
use crate::scheduler::{Orchestrator, TaskFilter, TaskSpec, TaskStatus};

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub branches: Arc<BranchTracker>,
}

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match &e {
            Error::Task(TaskError::NotFound { .. }) => Self::NotFound(e.to_string()),
            Error::Provisioning(ProvisioningError::UnknownCategory { .. }) => {
                Self::BadRequest(e.to_string())
            }
            Error::CapacityExceeded { .. } => Self::Unavailable(e.to_string()),
            _ => Self::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

/// Task, pool and summary endpoints merged with the bridge's own router
/// (`/ws`, `/health`, `/api/agents`).
pub fn router(state: ApiState) -> Router {
    let bridge = state.orchestrator.bridge().router();
    Router::new()
        .route("/api/tasks", get(list_tasks).post(submit_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/pool", get(pool_status))
        .route("/api/summary", get(summary))
        .route("/api/branches", get(list_branches))
        .with_state(state)
        .merge(bridge)
        .layer(CorsLayer::permissive())
}

fn parse_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::BadRequest("Invalid task ID".to_string()))
}

async fn submit_task(
    State(state): State<ApiState>,
    Json(spec): Json<TaskSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state.orchestrator.submit_task(spec).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"id": id, "status": TaskStatus::Queued})),
    ))
}

#[derive(Debug, Deserialize)]
struct TaskQuery {
    status: Option<String>,
    category: Option<String>,
}

async fn list_tasks(
    State(state): State<ApiState>,
    Query(query): Query<TaskQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let filter = TaskFilter {
        status,
        category: query.category,
    };
    Ok(Json(state.orchestrator.list_tasks(&filter).await))
}

async fn get_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.get_task_status(id).await?))
}

async fn cancel_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let cancelled = state.orchestrator.cancel_task(id).await?;
    let task = state.orchestrator.get_task_status(id).await?;
    Ok(Json(json!({"cancelled": cancelled, "task": task})))
}

async fn pool_status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.orchestrator.pool().get_pool_status().await)
}

async fn summary(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.orchestrator.summary().await)
}

async fn list_branches(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.branches.list().await)
}
