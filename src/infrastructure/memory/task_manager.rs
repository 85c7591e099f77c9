//! In-Memory Task Manager Implementation

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use crate::application::ports::{TaskManagerPort, TaskStoreError};
use crate::domain::task::{Task, TaskError, TaskId};

/// 内存任务表
pub struct InMemoryTaskManager {
    /// task_id -> Task
    tasks: DashMap<TaskId, Task>,
}

impl InMemoryTaskManager {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for InMemoryTaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManagerPort for InMemoryTaskManager {
    fn insert(&self, task: Task) -> Result<TaskId, TaskStoreError> {
        let task_id = *task.id();
        match self.tasks.entry(task_id) {
            Entry::Occupied(_) => Err(TaskStoreError::AlreadyExists(task_id)),
            Entry::Vacant(slot) => {
                slot.insert(task);
                tracing::debug!(task_id = %task_id, "Task stored");
                Ok(task_id)
            }
        }
    }

    fn get(&self, id: &TaskId) -> Option<Task> {
        self.tasks.get(id).map(|t| t.clone())
    }

    fn update(
        &self,
        id: &TaskId,
        f: &mut dyn FnMut(&mut Task) -> Result<(), TaskError>,
    ) -> Result<Task, TaskStoreError> {
        let mut entry = self
            .tasks
            .get_mut(id)
            .ok_or(TaskStoreError::NotFound(*id))?;

        // 在副本上修改，失败时原任务保持不变
        let mut draft = entry.clone();
        let old_status = draft.status();
        f(&mut draft)?;

        if draft.status() != old_status {
            tracing::debug!(
                task_id = %id,
                old_status = %old_status.as_str(),
                new_status = %draft.status().as_str(),
                "Task status changed"
            );
        }

        *entry = draft.clone();
        Ok(draft)
    }

    fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.iter().map(|t| t.clone()).collect();
        tasks.sort_by_key(|t| t.created_at());
        tasks
    }

    fn remove_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, task| match task.finished_at() {
            Some(finished) => finished >= cutoff,
            None => true,
        });
        let removed = before.saturating_sub(self.tasks.len());
        if removed > 0 {
            tracing::debug!(removed = removed, "Finished tasks purged");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::TaskStatus;
    use serde_json::Value;
    use std::collections::HashMap;

    fn new_task() -> Task {
        Task::new(vec!["detect".to_string()], Value::Null, HashMap::new()).unwrap()
    }

    #[test]
    fn test_task_lifecycle() {
        let manager = InMemoryTaskManager::new();
        let task_id = manager.insert(new_task()).unwrap();

        assert_eq!(manager.get(&task_id).unwrap().status(), TaskStatus::Pending);

        let updated = manager.update(&task_id, &mut |t| t.start()).unwrap();
        assert_eq!(updated.status(), TaskStatus::Running);

        manager.update(&task_id, &mut |t| t.succeed()).unwrap();
        assert_eq!(manager.get(&task_id).unwrap().status(), TaskStatus::Succeeded);
        assert_eq!(manager.list().len(), 1);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let manager = InMemoryTaskManager::new();
        let task = new_task();
        manager.insert(task.clone()).unwrap();
        assert!(matches!(
            manager.insert(task),
            Err(TaskStoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_failed_update_leaves_task_unchanged() {
        let manager = InMemoryTaskManager::new();
        let task_id = manager.insert(new_task()).unwrap();

        let result = manager.update(&task_id, &mut |t| {
            t.begin_attempt();
            t.succeed()
        });
        assert!(matches!(result, Err(TaskStoreError::Transition(_))));

        let task = manager.get(&task_id).unwrap();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert_eq!(task.attempt(), 0);
    }

    #[test]
    fn test_update_missing_task() {
        let manager = InMemoryTaskManager::new();
        let result = manager.update(&TaskId::new(), &mut |t| t.start());
        assert!(matches!(result, Err(TaskStoreError::NotFound(_))));
    }

    #[test]
    fn test_remove_finished_before() {
        let manager = InMemoryTaskManager::new();
        let done = manager.insert(new_task()).unwrap();
        let running = manager.insert(new_task()).unwrap();

        manager.update(&done, &mut |t| t.cancel()).unwrap();
        manager.update(&running, &mut |t| t.start()).unwrap();

        assert_eq!(manager.remove_finished_before(Utc::now() - chrono::Duration::hours(1)), 0);
        assert_eq!(manager.remove_finished_before(Utc::now() + chrono::Duration::seconds(1)), 1);
        assert!(manager.get(&done).is_none());
        assert!(manager.get(&running).is_some());
    }
}
