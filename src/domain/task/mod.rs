//! Task Context - 流水线任务限界上下文
//!
//! 职责:
//! - Task 聚合（一次用户请求在整条流水线中的生命周期）
//! - 任务状态机与阶段子状态
//! - 失败信息记录

mod aggregate;
mod errors;
mod value_objects;

pub use aggregate::{Task, TaskFailure};
pub use errors::TaskError;
pub use value_objects::{StagePhase, TaskId, TaskStatus};
