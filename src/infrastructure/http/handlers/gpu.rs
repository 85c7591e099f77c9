//! GPU Handlers

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::infrastructure::http::dto::{ApiResponse, GpuUtilizationResponse};
use crate::infrastructure::http::state::AppState;

/// 资源占用与熔断状态，仅用于观测
pub async fn gpu_utilization(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<GpuUtilizationResponse>> {
    let orchestrator = &state.orchestrator;
    Json(ApiResponse::success(GpuUtilizationResponse {
        resources: orchestrator.resources().utilization(),
        circuits: orchestrator.breaker().snapshot(),
    }))
}
