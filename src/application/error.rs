//! 应用层错误定义
//!
//! 流水线的封闭错误分类：重试 / fallback 决策只依据这里的变体

use thiserror::Error;

use crate::domain::task::TaskId;

/// 流水线错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// 截止时间内未拿到 GPU slot
    #[error("No GPU slot available for class {class} within deadline")]
    ResourceExhausted { class: String },

    /// 外部模型服务返回错误或超时
    #[error("Upstream stage {stage} unavailable: {message}")]
    UpstreamUnavailable { stage: String, message: String },

    /// 熔断器打开，未发起网络调用
    #[error("Circuit open for class {class}")]
    CircuitOpen { class: String },

    /// 提交时任务格式非法
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// 阶段名未注册
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// 任务被显式取消
    #[error("Task cancelled")]
    Cancelled,

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn upstream(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn invalid_task(message: impl Into<String>) -> Self {
        Self::InvalidTask(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// 稳定的错误类别，用于 API 和任务失败记录
    pub fn code(&self) -> &'static str {
        match self {
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::InvalidTask(_) => "invalid_task",
            Self::UnknownStage(_) => "unknown_stage",
            Self::Cancelled => "cancelled",
            Self::TaskNotFound(_) => "task_not_found",
            Self::Internal(_) => "internal",
        }
    }

    /// 同一阶段可以再次尝试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. } | Self::UpstreamUnavailable { .. }
        )
    }

    /// 可以切换到 fallback 阶段
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. }
                | Self::UpstreamUnavailable { .. }
                | Self::CircuitOpen { .. }
        )
    }

    /// 提交阶段被拒绝（任务未创建）
    pub fn is_invalid_task(&self) -> bool {
        matches!(self, Self::InvalidTask(_) | Self::UnknownStage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_and_fallback_classification() {
        let upstream = PipelineError::upstream("detect", "HTTP 503");
        assert!(upstream.is_retryable());
        assert!(upstream.allows_fallback());

        let open = PipelineError::CircuitOpen {
            class: "tts".to_string(),
        };
        assert!(!open.is_retryable());
        assert!(open.allows_fallback());

        assert!(!PipelineError::Cancelled.is_retryable());
        assert!(!PipelineError::Cancelled.allows_fallback());
        assert!(PipelineError::UnknownStage("x".to_string()).is_invalid_task());
    }

    #[test]
    fn test_codes() {
        assert_eq!(PipelineError::Cancelled.code(), "cancelled");
        assert_eq!(
            PipelineError::ResourceExhausted {
                class: "lipsync".to_string()
            }
            .code(),
            "resource_exhausted"
        );
    }
}
