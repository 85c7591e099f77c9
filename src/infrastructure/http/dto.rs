//! Data Transfer Objects

use serde::{Deserialize, Serialize};

use crate::domain::task::TaskId;
use crate::infrastructure::gpu::UtilizationSnapshot;
use crate::infrastructure::http::error::ApiError;
use crate::infrastructure::resilience::CircuitSnapshot;

// ============================================================================
// 统一响应结构
// ============================================================================

/// 统一 API 响应格式
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub errno: i32,
    pub error: String,
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    /// 成功响应
    pub fn success(data: T) -> Self {
        Self {
            errno: 0,
            error: String::new(),
            data: Some(data),
        }
    }
}

/// 空数据响应
#[derive(Debug, Serialize)]
pub struct Empty {}

impl ApiResponse<Empty> {
    /// 成功但无数据
    pub fn ok() -> Self {
        Self {
            errno: 0,
            error: String::new(),
            data: Some(Empty {}),
        }
    }
}

// ============================================================================
// Task DTOs
// ============================================================================

#[derive(Debug, Serialize)]
pub struct SubmitTaskResponse {
    pub task_id: TaskId,
}

/// 按 task_id 操作的请求
#[derive(Debug, Deserialize)]
pub struct TaskIdRequest {
    pub task_id: String,
}

impl TaskIdRequest {
    pub fn parse(&self) -> Result<TaskId, ApiError> {
        TaskId::parse(&self.task_id)
            .ok_or_else(|| ApiError::BadRequest(format!("Invalid task_id: {}", self.task_id)))
    }
}

// ============================================================================
// GPU DTOs
// ============================================================================

#[derive(Debug, Serialize)]
pub struct GpuUtilizationResponse {
    pub resources: UtilizationSnapshot,
    pub circuits: Vec<CircuitSnapshot>,
}
