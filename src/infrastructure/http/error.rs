//! HTTP Error Handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::application::PipelineError;

/// 统一错误响应格式
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub errno: i32,
    pub error: String,
    pub data: Option<()>,
}

impl ErrorResponse {
    pub fn new(errno: i32, error: impl Into<String>) -> Self {
        Self {
            errno,
            error: error.into(),
            data: None,
        }
    }
}

/// 错误码定义
pub mod errno {
    pub const BAD_REQUEST: i32 = 400;
    pub const NOT_FOUND: i32 = 404;
    pub const CONFLICT: i32 = 409;
    pub const INTERNAL_ERROR: i32 = 500;
    pub const SERVICE_UNAVAILABLE: i32 = 503;
}

/// API 错误
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
    Conflict(String),
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn errno(&self) -> i32 {
        match self {
            ApiError::NotFound(_) => errno::NOT_FOUND,
            ApiError::BadRequest(_) => errno::BAD_REQUEST,
            ApiError::Internal(_) => errno::INTERNAL_ERROR,
            ApiError::Conflict(_) => errno::CONFLICT,
            ApiError::ServiceUnavailable(_) => errno::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let errno = self.errno();
        let msg = match &self {
            ApiError::NotFound(msg) => {
                tracing::warn!(errno = errno, error = %msg, "Resource not found");
                msg
            }
            ApiError::BadRequest(msg) => {
                tracing::warn!(errno = errno, error = %msg, "Bad request");
                msg
            }
            ApiError::Internal(msg) => {
                tracing::error!(errno = errno, error = %msg, "Internal server error");
                msg
            }
            ApiError::Conflict(msg) => {
                tracing::warn!(errno = errno, error = %msg, "Resource conflict");
                msg
            }
            ApiError::ServiceUnavailable(msg) => {
                tracing::error!(errno = errno, error = %msg, "Service unavailable");
                msg
            }
        };

        (StatusCode::OK, Json(ErrorResponse::new(errno, msg.clone()))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::InvalidTask(_) | PipelineError::UnknownStage(_) => {
                ApiError::BadRequest(e.to_string())
            }
            PipelineError::TaskNotFound(_) => ApiError::NotFound(e.to_string()),
            PipelineError::Cancelled => ApiError::Conflict(e.to_string()),
            PipelineError::ResourceExhausted { .. }
            | PipelineError::UpstreamUnavailable { .. }
            | PipelineError::CircuitOpen { .. } => ApiError::ServiceUnavailable(e.to_string()),
            PipelineError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::TaskId;

    #[test]
    fn test_pipeline_error_mapping() {
        assert_eq!(
            ApiError::from(PipelineError::UnknownStage("x".to_string())).errno(),
            errno::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(PipelineError::TaskNotFound(TaskId::new())).errno(),
            errno::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(PipelineError::ResourceExhausted {
                class: "pipeline_queue".to_string()
            })
            .errno(),
            errno::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(PipelineError::internal("boom")).errno(),
            errno::INTERNAL_ERROR
        );
    }
}
