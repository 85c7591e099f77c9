//! Task Manager Port - 任务表
//!
//! 定义任务存储的抽象接口，具体实现在 infrastructure/memory 层。
//! 只有 Orchestrator 持有写入能力，其余组件只读。

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::task::{Task, TaskError, TaskId};

/// Task Manager 错误
#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Task already exists: {0}")]
    AlreadyExists(TaskId),

    #[error(transparent)]
    Transition(#[from] TaskError),
}

/// Task Manager Port
///
/// 管理任务的生命周期，所有状态存储在内存中
pub trait TaskManagerPort: Send + Sync {
    /// 保存新任务
    fn insert(&self, task: Task) -> Result<TaskId, TaskStoreError>;

    /// 获取任务快照
    fn get(&self, id: &TaskId) -> Option<Task>;

    /// 原地修改任务
    fn update(
        &self,
        id: &TaskId,
        f: &mut dyn FnMut(&mut Task) -> Result<(), TaskError>,
    ) -> Result<Task, TaskStoreError>;

    /// 列出全部任务
    fn list(&self) -> Vec<Task>;

    /// 删除在 cutoff 之前进入终态的任务，返回删除数量
    fn remove_finished_before(&self, cutoff: DateTime<Utc>) -> usize;
}
