//! Task Context - Aggregate Root

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::{StagePhase, TaskError, TaskId, TaskStatus};

/// 任务失败信息
///
/// 只记录最终导致失败的那一个错误，不保留重试历史
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// 失败发生的阶段索引
    pub stage_index: usize,
    /// 实际执行的阶段名（可能是 fallback 阶段）
    pub stage: String,
    /// 错误类别
    pub code: String,
    /// 错误描述
    pub message: String,
}

/// Task 聚合根
///
/// 不变量:
/// - 阶段序列在创建后不可变
/// - current_stage_index 只增不减（同阶段重试不改变索引）
/// - 终态（Succeeded / Failed / Cancelled）不可再迁移
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    stages: Vec<String>,
    input: Value,
    params: HashMap<String, Value>,
    status: TaskStatus,
    current_stage_index: usize,
    active_stage: Option<String>,
    phase: Option<StagePhase>,
    attempt: u32,
    failure: Option<TaskFailure>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// 创建新任务
    pub fn new(
        stages: Vec<String>,
        input: Value,
        params: HashMap<String, Value>,
    ) -> Result<Self, TaskError> {
        if stages.is_empty() {
            return Err(TaskError::EmptyStages);
        }

        let now = Utc::now();
        Ok(Self {
            id: TaskId::new(),
            stages,
            input,
            params,
            status: TaskStatus::Pending,
            current_stage_index: 0,
            active_stage: None,
            phase: None,
            attempt: 0,
            failure: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        })
    }

    /// Pending -> Running
    pub fn start(&mut self) -> Result<(), TaskError> {
        self.transition(TaskStatus::Running)
    }

    /// 进入第 index 个阶段（或以 fallback 阶段替换当前阶段）
    pub fn enter_stage(&mut self, index: usize, stage: &str) -> Result<(), TaskError> {
        if index >= self.stages.len() {
            return Err(TaskError::StageIndexOutOfRange {
                index,
                len: self.stages.len(),
            });
        }
        if index < self.current_stage_index {
            return Err(TaskError::StageIndexRegressed {
                from: self.current_stage_index,
                to: index,
            });
        }

        self.current_stage_index = index;
        self.active_stage = Some(stage.to_string());
        self.attempt = 0;
        self.phase = Some(StagePhase::AwaitingSlot);
        self.touch();
        Ok(())
    }

    /// 开始当前阶段的新一次尝试
    pub fn begin_attempt(&mut self) {
        self.attempt += 1;
        self.phase = Some(StagePhase::AwaitingSlot);
        self.touch();
    }

    pub fn set_phase(&mut self, phase: StagePhase) {
        self.phase = Some(phase);
        self.touch();
    }

    pub fn succeed(&mut self) -> Result<(), TaskError> {
        self.transition(TaskStatus::Succeeded)
    }

    pub fn fail(&mut self, failure: TaskFailure) -> Result<(), TaskError> {
        self.transition(TaskStatus::Failed)?;
        self.phase = Some(StagePhase::Failed);
        self.failure = Some(failure);
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), TaskError> {
        self.transition(TaskStatus::Cancelled)
    }

    fn transition(&mut self, to: TaskStatus) -> Result<(), TaskError> {
        let allowed = match (self.status, to) {
            (TaskStatus::Pending, TaskStatus::Running) => true,
            (TaskStatus::Pending, TaskStatus::Cancelled) => true,
            (TaskStatus::Pending, TaskStatus::Failed) => true,
            (TaskStatus::Running, t) => t.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(TaskError::InvalidTransition {
                task_id: self.id,
                from: self.status,
                to,
            });
        }

        self.status = to;
        self.touch();
        if to.is_terminal() {
            self.finished_at = Some(self.updated_at);
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    // Getters
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    /// 阶段参数；fallback 阶段没有专属参数时沿用原阶段参数
    pub fn params_for(&self, stage: &str, original: &str) -> Value {
        self.params
            .get(stage)
            .or_else(|| self.params.get(original))
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn current_stage_index(&self) -> usize {
        self.current_stage_index
    }

    pub fn active_stage(&self) -> Option<&str> {
        self.active_stage.as_deref()
    }

    pub fn phase(&self) -> Option<StagePhase> {
        self.phase
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        self.failure.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stages() -> Vec<String> {
        vec!["detect".to_string(), "segment".to_string()]
    }

    #[test]
    fn test_new_task_is_pending() {
        let task = Task::new(stages(), Value::Null, HashMap::new()).unwrap();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert_eq!(task.current_stage_index(), 0);
        assert!(task.finished_at().is_none());
    }

    #[test]
    fn test_empty_stages_rejected() {
        let result = Task::new(Vec::new(), Value::Null, HashMap::new());
        assert!(matches!(result, Err(TaskError::EmptyStages)));
    }

    #[test]
    fn test_stage_index_never_regresses() {
        let mut task = Task::new(stages(), Value::Null, HashMap::new()).unwrap();
        task.start().unwrap();
        task.enter_stage(1, "segment").unwrap();
        assert!(task.enter_stage(0, "detect").is_err());
        // 同一阶段重新进入（fallback 替换）是允许的
        assert!(task.enter_stage(1, "segment_fallback").is_ok());
        assert_eq!(task.active_stage(), Some("segment_fallback"));
        assert!(task.enter_stage(2, "render").is_err());
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut task = Task::new(stages(), Value::Null, HashMap::new()).unwrap();
        task.start().unwrap();
        task.succeed().unwrap();
        assert!(task.finished_at().is_some());
        assert!(task.cancel().is_err());
        assert!(task.start().is_err());
    }

    #[test]
    fn test_failure_recorded() {
        let mut task = Task::new(stages(), Value::Null, HashMap::new()).unwrap();
        task.start().unwrap();
        task.fail(TaskFailure {
            stage_index: 1,
            stage: "segment".to_string(),
            code: "upstream_unavailable".to_string(),
            message: "HTTP 503".to_string(),
        })
        .unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.failure().unwrap().stage_index, 1);
    }

    #[test]
    fn test_params_fall_back_to_original_stage() {
        let mut params = HashMap::new();
        params.insert("segment".to_string(), serde_json::json!({"mode": "person"}));
        let task = Task::new(stages(), Value::Null, params).unwrap();
        assert_eq!(
            task.params_for("segment_fallback", "segment"),
            serde_json::json!({"mode": "person"})
        );
        assert_eq!(task.params_for("detect", "detect"), Value::Null);
    }
}
