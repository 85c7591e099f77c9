//! HTTP Routes
//!
//! API Endpoints:
//! - /api/ping              GET   健康检查
//! - /api/task/submit       POST  提交任务
//! - /api/task/status       POST  查询任务状态
//! - /api/task/cancel       POST  取消任务
//! - /api/gpu/utilization   GET   GPU 占用与熔断状态
//! - /ws/task/{id}          WS    任务进度事件（先推送历史）

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

/// 创建所有路由
pub fn create_routes() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/api", api_routes())
        .route("/ws/task/:task_id", get(handlers::task_websocket_handler))
}

/// API 路由
fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ping", get(handlers::ping))
        .nest("/task", task_routes())
        .route("/gpu/utilization", get(handlers::gpu_utilization))
}

/// Task 路由
fn task_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/submit", post(handlers::submit_task))
        .route("/status", post(handlers::task_status))
        .route("/cancel", post(handlers::cancel_task))
}
