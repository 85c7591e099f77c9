//! Domain Layer - 领域层
//!
//! 包含两个限界上下文:
//! - Task Context: 推理任务
//! - Stage Context: 阶段静态配置

pub mod stage;
pub mod task;
