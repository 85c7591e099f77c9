//! Stage Client Port - 模型服务调用抽象
//!
//! 每个外部模型服务（检测、分割、语音合成、韵律调整、BGM 混音、视频渲染）
//! 实现该接口，具体实现在 infrastructure/adapters 层

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::application::context::CallContext;
use crate::domain::task::TaskId;

/// 阶段调用错误
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Service error: HTTP {status}: {message}")]
    ServiceError { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Call cancelled")]
    Cancelled,
}

impl StageError {
    /// 是否应计入熔断器失败次数
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, StageError::Cancelled)
    }
}

/// 阶段调用输入
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInput {
    pub task_id: TaskId,
    /// 实际执行的阶段名
    pub stage: String,
    /// 该阶段的调用参数
    pub params: Value,
    /// 上一阶段的输出；第一个阶段为任务原始输入
    pub payload: Value,
}

/// 阶段调用输出，会作为下一阶段的 payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub payload: Value,
}

/// 阶段客户端的静态元数据，注册时读取
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageMetadata {
    pub exclusivity_class: String,
    pub estimated_vram_bytes: u64,
    pub default_timeout: Duration,
}

/// Stage Client Port
#[async_trait]
pub trait StageClientPort: Send + Sync {
    /// 静态元数据
    fn metadata(&self) -> StageMetadata;

    /// 调用外部模型服务
    ///
    /// 实现必须在 ctx 被取消时尽快返回 `StageError::Cancelled`
    async fn invoke(&self, ctx: &CallContext, input: StageInput) -> Result<StageOutput, StageError>;

    /// 检查服务是否可用
    async fn health_check(&self) -> bool {
        true // 默认实现
    }
}
