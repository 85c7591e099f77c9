//! Task Context - Errors

use thiserror::Error;

use super::{TaskId, TaskStatus};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("任务阶段列表为空")]
    EmptyStages,

    #[error("阶段索引越界: {index} (共 {len} 个阶段)")]
    StageIndexOutOfRange { index: usize, len: usize },

    #[error("阶段索引不可回退: {from} -> {to}")]
    StageIndexRegressed { from: usize, to: usize },

    #[error("非法状态迁移 {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
}
