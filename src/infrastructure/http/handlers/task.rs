//! Task Handlers

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::infrastructure::http::dto::{ApiResponse, Empty, SubmitTaskResponse, TaskIdRequest};
use crate::infrastructure::http::error::ApiError;
use crate::infrastructure::http::state::AppState;
use crate::infrastructure::worker::{SubmitRequest, TaskStatusSnapshot};

// ============================================================================
// Submit
// ============================================================================

pub async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<ApiResponse<SubmitTaskResponse>>, ApiError> {
    let task_id = state.orchestrator.submit(req)?;
    Ok(Json(ApiResponse::success(SubmitTaskResponse { task_id })))
}

// ============================================================================
// Status
// ============================================================================

pub async fn task_status(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskIdRequest>,
) -> Result<Json<ApiResponse<TaskStatusSnapshot>>, ApiError> {
    let task_id = req.parse()?;
    let snapshot = state.orchestrator.status(&task_id)?;
    Ok(Json(ApiResponse::success(snapshot)))
}

// ============================================================================
// Cancel
// ============================================================================

pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskIdRequest>,
) -> Result<Json<ApiResponse<Empty>>, ApiError> {
    let task_id = req.parse()?;
    state.orchestrator.cancel(&task_id)?;
    Ok(Json(ApiResponse::ok()))
}
