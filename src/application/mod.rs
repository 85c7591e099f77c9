//! 应用层 - 用例编排
//!
//! 包含：
//! - ports: 六边形架构端口定义（StageClientPort、TaskManagerPort）
//! - registry: 阶段注册表
//! - context: 取消 / 截止时间上下文
//! - error: 流水线错误分类

pub mod context;
pub mod error;
pub mod ports;
pub mod registry;

pub use context::{CallContext, DoneReason};
pub use error::PipelineError;
pub use ports::{
    // Stage client
    StageClientPort,
    StageError,
    StageInput,
    StageMetadata,
    StageOutput,
    // Task manager
    TaskManagerPort,
    TaskStoreError,
};
pub use registry::{RegisteredStage, RegistryError, StageRegistry};
