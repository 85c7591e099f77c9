//! Application Ports - 出站端口定义
//!
//! 定义应用层与基础设施层的抽象接口

mod stage_client;
mod task_manager;

pub use stage_client::{StageClientPort, StageError, StageInput, StageMetadata, StageOutput};
pub use task_manager::{TaskManagerPort, TaskStoreError};
