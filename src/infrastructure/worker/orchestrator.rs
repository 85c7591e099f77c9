//! Pipeline Orchestrator - 多阶段推理任务调度
//!
//! 每个任务由一个 tokio task 驱动，按声明顺序执行阶段：
//! 获取 GPU slot → 经熔断器调用模型服务 → 释放 slot → 下一阶段。
//! 阶段失败时先重试，尝试次数用尽后切换 fallback 阶段，否则任务失败。

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{StageError, StageInput, StageOutput, TaskManagerPort};
use crate::application::{CallContext, PipelineError, RegisteredStage, StageRegistry};
use crate::domain::task::{StagePhase, Task, TaskError, TaskFailure, TaskId, TaskStatus};
use crate::infrastructure::events::ProgressTracker;
use crate::infrastructure::gpu::{GpuResourceManager, ResourceError};
use crate::infrastructure::resilience::{BreakerError, CircuitBreaker};

/// 调度器配置
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// 同时执行的任务上限
    pub max_in_flight: usize,
    /// 待调度队列容量
    pub queue_capacity: usize,
    /// 单次等待 GPU slot 的最长时间
    pub acquire_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            queue_capacity: 256,
            acquire_timeout: Duration::from_secs(300),
        }
    }
}

/// 调度器依赖的组件
pub struct OrchestratorDeps {
    pub registry: StageRegistry,
    pub resources: GpuResourceManager,
    pub tracker: ProgressTracker,
    pub breaker: Arc<CircuitBreaker>,
    pub tasks: Arc<dyn TaskManagerPort>,
}

/// 提交请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub stages: Vec<String>,
    #[serde(default)]
    pub input: Value,
    /// 按阶段名索引的调用参数
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

/// 任务状态快照
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusSnapshot {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub stages: Vec<String>,
    pub current_stage_index: usize,
    pub active_stage: Option<String>,
    pub phase: Option<StagePhase>,
    pub attempt: u32,
    pub failure: Option<TaskFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Task> for TaskStatusSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            task_id: *task.id(),
            status: task.status(),
            stages: task.stages().to_vec(),
            current_stage_index: task.current_stage_index(),
            active_stage: task.active_stage().map(str::to_string),
            phase: task.phase(),
            attempt: task.attempt(),
            failure: task.failure().cloned(),
            created_at: task.created_at(),
            updated_at: task.updated_at(),
            finished_at: task.finished_at(),
        }
    }
}

/// 阶段最终失败
#[derive(Debug)]
struct StageFailure {
    stage_index: usize,
    stage: String,
    error: PipelineError,
}

struct Inner {
    config: OrchestratorConfig,
    registry: StageRegistry,
    resources: GpuResourceManager,
    tracker: ProgressTracker,
    breaker: Arc<CircuitBreaker>,
    tasks: Arc<dyn TaskManagerPort>,
    /// 未结束任务的取消 token
    tokens: DashMap<TaskId, CancellationToken>,
    queue: mpsc::Sender<TaskId>,
    shutdown: CancellationToken,
}

/// 调度器句柄
///
/// 提交、取消、查询任务；可廉价 clone
#[derive(Clone)]
pub struct PipelineOrchestrator {
    inner: Arc<Inner>,
}

/// 调度循环
///
/// 从队列消费任务，每个任务 spawn 一个 worker
pub struct PipelineDispatcher {
    inner: Arc<Inner>,
    queue_receiver: mpsc::Receiver<TaskId>,
}

impl PipelineOrchestrator {
    pub fn new(config: OrchestratorConfig, deps: OrchestratorDeps) -> (Self, PipelineDispatcher) {
        let (queue, queue_receiver) = mpsc::channel(config.queue_capacity.max(1));
        let inner = Arc::new(Inner {
            config,
            registry: deps.registry,
            resources: deps.resources,
            tracker: deps.tracker,
            breaker: deps.breaker,
            tasks: deps.tasks,
            tokens: DashMap::new(),
            queue,
            shutdown: CancellationToken::new(),
        });

        let dispatcher = PipelineDispatcher {
            inner: inner.clone(),
            queue_receiver,
        };
        (Self { inner }, dispatcher)
    }

    /// 提交任务，立即返回 task_id
    pub fn submit(&self, request: SubmitRequest) -> Result<TaskId, PipelineError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(PipelineError::internal("orchestrator is shutting down"));
        }

        inner.registry.validate_sequence(&request.stages)?;

        let permit = inner.queue.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PipelineError::ResourceExhausted {
                class: "pipeline_queue".to_string(),
            },
            mpsc::error::TrySendError::Closed(_) => {
                PipelineError::internal("dispatcher is not running")
            }
        })?;

        let task = Task::new(request.stages, request.input, request.params)
            .map_err(|e| PipelineError::invalid_task(e.to_string()))?;
        let task_id = inner
            .tasks
            .insert(task)
            .map_err(|e| PipelineError::internal(e.to_string()))?;

        inner.tokens.insert(task_id, inner.shutdown.child_token());
        permit.send(task_id);

        tracing::info!(task_id = %task_id, "Task submitted");
        Ok(task_id)
    }

    /// 取消任务
    ///
    /// Pending 任务直接终结；运行中的任务由其 worker 在下一个挂起点终结。
    /// 已结束的任务不受影响
    pub fn cancel(&self, task_id: &TaskId) -> Result<(), PipelineError> {
        let inner = &self.inner;
        let task = inner
            .tasks
            .get(task_id)
            .ok_or(PipelineError::TaskNotFound(*task_id))?;

        if task.status().is_terminal() {
            tracing::debug!(task_id = %task_id, status = %task.status().as_str(), "Cancel ignored for finished task");
            return Ok(());
        }

        if let Some(token) = inner.tokens.get(task_id) {
            token.cancel();
        }

        let mut cancelled_pending = false;
        let updated = inner.tasks.update(task_id, &mut |t| {
            if t.status() == TaskStatus::Pending {
                cancelled_pending = true;
                t.cancel()
            } else {
                Ok(())
            }
        });

        match updated {
            Ok(_) if cancelled_pending => {
                inner.finalize_progress(*task_id, "Task cancelled before start");
                inner.tokens.remove(task_id);
                tracing::info!(task_id = %task_id, "Pending task cancelled");
            }
            Ok(_) => {
                tracing::info!(task_id = %task_id, "Cancellation requested");
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to record cancellation");
            }
        }
        Ok(())
    }

    /// 查询任务状态
    pub fn status(&self, task_id: &TaskId) -> Result<TaskStatusSnapshot, PipelineError> {
        self.inner
            .tasks
            .get(task_id)
            .map(|task| TaskStatusSnapshot::from(&task))
            .ok_or(PipelineError::TaskNotFound(*task_id))
    }

    /// 清理过期任务和进度历史，返回清理的任务数
    pub fn purge_finished(&self, retention: Duration) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::zero());
        let removed = self
            .inner
            .tasks
            .remove_finished_before(Utc::now() - retention);
        let purged_progress = self.inner.tracker.purge_expired();
        if removed > 0 || purged_progress > 0 {
            tracing::info!(
                removed_tasks = removed,
                purged_progress = purged_progress,
                "Finished tasks purged"
            );
        }
        removed
    }

    /// 周期性清理，直到 shutdown
    pub async fn run_janitor(self, interval: Duration, retention: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = interval.as_secs(), "Janitor started");

        loop {
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.purge_finished(retention);
                }
            }
        }

        tracing::info!("Janitor stopped");
    }

    /// 停止接收任务并取消所有未结束的任务
    pub fn shutdown(&self) {
        tracing::info!(in_flight = self.inner.tokens.len(), "Orchestrator shutting down");
        self.inner.shutdown.cancel();
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.inner.registry
    }

    pub fn resources(&self) -> &GpuResourceManager {
        &self.inner.resources
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.inner.tracker
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }
}

impl PipelineDispatcher {
    /// 启动调度循环
    pub async fn run(mut self) {
        let max_in_flight = self.inner.config.max_in_flight.max(1);
        tracing::info!(max_in_flight = max_in_flight, "PipelineDispatcher started");

        // 使用 semaphore 控制同时执行的任务数
        let semaphore = Arc::new(Semaphore::new(max_in_flight));

        loop {
            let task_id = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break,
                next = self.queue_receiver.recv() => match next {
                    Some(task_id) => task_id,
                    None => break,
                },
            };

            let permit = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => {
                    self.inner.abandon(task_id);
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::error!("Failed to acquire semaphore permit");
                        self.inner.abandon(task_id);
                        break;
                    }
                },
            };

            let inner = self.inner.clone();
            tokio::spawn(async move {
                let _permit = permit; // 持有 permit 直到任务结束
                let outcome = AssertUnwindSafe(inner.run_task(task_id)).catch_unwind().await;
                if outcome.is_err() {
                    inner.recover_panicked(task_id);
                }
            });
        }

        // 队列中剩余的任务不再执行
        self.queue_receiver.close();
        while let Ok(task_id) = self.queue_receiver.try_recv() {
            self.inner.abandon(task_id);
        }

        tracing::info!("PipelineDispatcher stopped");
    }
}

impl Inner {
    /// 执行单个任务
    async fn run_task(&self, task_id: TaskId) {
        let Some(token) = self.tokens.get(&task_id).map(|t| t.clone()) else {
            tracing::debug!(task_id = %task_id, "Task already finalized, skipping");
            return;
        };
        let ctx = CallContext::new(token);

        let task = match self.tasks.update(&task_id, &mut |t| t.start()) {
            Ok(task) => task,
            Err(e) => {
                // 排队期间被取消
                tracing::debug!(task_id = %task_id, error = %e, "Task not startable, skipping");
                self.tokens.remove(&task_id);
                return;
            }
        };

        tracing::info!(
            task_id = %task_id,
            stages = ?task.stages(),
            "Task started"
        );

        let outcome = self.execute(&ctx, &task).await;
        self.finish(task_id, outcome);
    }

    async fn execute(&self, ctx: &CallContext, task: &Task) -> Result<(), StageFailure> {
        let total = task.stages().len();
        let mut payload = task.input().clone();

        for (index, stage) in task.stages().iter().enumerate() {
            let percentage = (index * 100 / total) as i8;
            payload = self
                .run_stage(ctx, task, index, stage, percentage, payload)
                .await?;
        }
        Ok(())
    }

    /// 执行第 index 个阶段，必要时沿 fallback 链替换
    async fn run_stage(
        &self,
        ctx: &CallContext,
        task: &Task,
        index: usize,
        original: &str,
        percentage: i8,
        payload: Value,
    ) -> Result<Value, StageFailure> {
        let task_id = *task.id();
        let mut stage_name = original.to_string();
        let mut visited = HashSet::new();
        let mut announced = false;

        loop {
            visited.insert(stage_name.clone());
            let failure = |error: PipelineError| StageFailure {
                stage_index: index,
                stage: stage_name.clone(),
                error,
            };

            let registered = self
                .registry
                .get(&stage_name)
                .cloned()
                .ok_or_else(|| failure(PipelineError::UnknownStage(stage_name.clone())))?;

            self.record(&task_id, |t| t.enter_stage(index, &stage_name));

            let input = StageInput {
                task_id,
                stage: stage_name.clone(),
                params: task.params_for(&stage_name, original),
                payload: payload.clone(),
            };

            let error = match self
                .run_attempts(ctx, task, index, &registered, input, percentage, &mut announced)
                .await
            {
                Ok(output) => {
                    self.record(&task_id, |t| {
                        t.set_phase(StagePhase::Completed);
                        Ok(())
                    });
                    tracing::info!(
                        task_id = %task_id,
                        stage_index = index,
                        stage = %stage_name,
                        "Stage completed"
                    );
                    return Ok(output.payload);
                }
                Err(error) => error,
            };

            let fallback = registered
                .descriptor
                .fallback_stage
                .as_ref()
                .filter(|fb| error.allows_fallback() && !visited.contains(*fb));

            let Some(fallback) = fallback else {
                return Err(failure(error));
            };

            tracing::warn!(
                task_id = %task_id,
                stage = %stage_name,
                fallback = %fallback,
                error = %error,
                "Stage failed, switching to fallback"
            );
            self.tracker.publish_warning(
                task_id,
                format!(
                    "Stage {} failed ({}), falling back to {}",
                    stage_name, error, fallback
                ),
            );
            stage_name = fallback.clone();
        }
    }

    /// 按重试策略执行同一阶段
    #[allow(clippy::too_many_arguments)]
    async fn run_attempts(
        &self,
        ctx: &CallContext,
        task: &Task,
        index: usize,
        registered: &RegisteredStage,
        input: StageInput,
        percentage: i8,
        announced: &mut bool,
    ) -> Result<StageOutput, PipelineError> {
        let task_id = *task.id();
        let max_attempts = registered.descriptor.retry_policy.max_attempts.max(1);
        let mut last_error = PipelineError::internal("stage was never attempted");

        for attempt in 1..=max_attempts {
            if ctx.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            self.record(&task_id, |t| {
                t.begin_attempt();
                Ok(())
            });

            let error = match self
                .attempt_once(ctx, task, index, registered, &input, percentage, announced)
                .await
            {
                Ok(output) => return Ok(output),
                Err(error) => error,
            };

            match error {
                PipelineError::Cancelled | PipelineError::CircuitOpen { .. } => return Err(error),
                _ if !error.is_retryable() => return Err(error),
                _ => {}
            }

            tracing::warn!(
                task_id = %task_id,
                stage = %input.stage,
                attempt = attempt,
                max_attempts = max_attempts,
                error = %error,
                "Stage attempt failed"
            );
            if attempt < max_attempts {
                self.tracker.publish_warning(
                    task_id,
                    format!(
                        "Stage {} attempt {}/{} failed: {}",
                        input.stage, attempt, max_attempts, error
                    ),
                );
            }
            last_error = error;
        }

        Err(last_error)
    }

    /// 一次尝试：获取 slot → 调用 → 释放
    #[allow(clippy::too_many_arguments)]
    async fn attempt_once(
        &self,
        ctx: &CallContext,
        task: &Task,
        index: usize,
        registered: &RegisteredStage,
        input: &StageInput,
        percentage: i8,
        announced: &mut bool,
    ) -> Result<StageOutput, PipelineError> {
        let task_id = *task.id();
        let descriptor = &registered.descriptor;
        let class = descriptor.exclusivity_class.as_str();

        let acquire_ctx = ctx.child_with_timeout(self.config.acquire_timeout);
        let reservation = self
            .resources
            .acquire(class, descriptor.estimated_vram_bytes, task_id, &acquire_ctx)
            .await
            .map_err(|e| match e {
                _ if ctx.is_cancelled() => PipelineError::Cancelled,
                ResourceError::DeadlineExceeded { class, .. } => {
                    PipelineError::ResourceExhausted { class }
                }
                ResourceError::ExceedsBudget { .. } => PipelineError::ResourceExhausted {
                    class: class.to_string(),
                },
                other => PipelineError::internal(other.to_string()),
            })?;

        self.record(&task_id, |t| {
            t.set_phase(StagePhase::Executing);
            Ok(())
        });

        if !*announced {
            *announced = true;
            self.tracker.publish(
                task_id,
                percentage,
                format!(
                    "Stage {}/{} started: {}",
                    index + 1,
                    task.stages().len(),
                    input.stage
                ),
            );
        }

        tracing::debug!(
            task_id = %task_id,
            stage = %input.stage,
            class = %class,
            reservation_id = reservation.id(),
            "Stage executing"
        );

        let call_ctx = ctx.child_with_timeout(descriptor.timeout);
        let client = &registered.client;
        let call_ctx_ref = &call_ctx;
        let result = self
            .breaker
            .call(&call_ctx, class, move || client.invoke(call_ctx_ref, input.clone()))
            .await;

        self.resources.release(&reservation);

        match result {
            Ok(output) => Ok(output),
            Err(_) if ctx.is_cancelled() => Err(PipelineError::Cancelled),
            Err(BreakerError::CircuitOpen { class }) => Err(PipelineError::CircuitOpen { class }),
            Err(BreakerError::Stage(StageError::Cancelled)) => Err(PipelineError::Cancelled),
            Err(BreakerError::Stage(e)) => Err(PipelineError::upstream(&input.stage, e.to_string())),
        }
    }

    /// 先发布最终进度，再写入终态并关闭进度流
    fn finish(&self, task_id: TaskId, outcome: Result<(), StageFailure>) {
        match outcome {
            Ok(()) => {
                self.tracker.publish(task_id, 100, "Task completed");
                self.record(&task_id, |t| t.succeed());
                tracing::info!(task_id = %task_id, "Task succeeded");
            }
            Err(StageFailure {
                error: PipelineError::Cancelled,
                stage_index,
                ..
            }) => {
                self.tracker.publish_warning(task_id, "Task cancelled");
                self.record(&task_id, |t| t.cancel());
                tracing::info!(task_id = %task_id, stage_index = stage_index, "Task cancelled");
            }
            Err(failure) => {
                let record = TaskFailure {
                    stage_index: failure.stage_index,
                    stage: failure.stage.clone(),
                    code: failure.error.code().to_string(),
                    message: failure.error.to_string(),
                };
                self.tracker.publish_error(
                    task_id,
                    format!("Stage {} failed: {}", failure.stage, failure.error),
                );
                self.record(&task_id, |t| t.fail(record.clone()));
                tracing::error!(
                    task_id = %task_id,
                    stage_index = failure.stage_index,
                    stage = %failure.stage,
                    error = %failure.error,
                    "Task failed"
                );
            }
        }

        self.tracker.close(task_id);
        self.tokens.remove(&task_id);
    }

    /// worker panic 后终结任务；reservation 已在 unwind 时释放
    fn recover_panicked(&self, task_id: TaskId) {
        let Some(task) = self.tasks.get(&task_id) else {
            self.tokens.remove(&task_id);
            return;
        };
        if task.status().is_terminal() {
            self.tokens.remove(&task_id);
            return;
        }

        let stage_index = task.current_stage_index();
        let stage = task
            .active_stage()
            .map(str::to_string)
            .or_else(|| task.stages().get(stage_index).cloned())
            .unwrap_or_default();
        tracing::error!(
            task_id = %task_id,
            stage_index = stage_index,
            stage = %stage,
            "Task worker panicked"
        );

        self.finish(
            task_id,
            Err(StageFailure {
                stage_index,
                stage,
                error: PipelineError::internal("task worker panicked"),
            }),
        );
    }

    /// 未执行就被放弃的任务（shutdown 时仍在队列中）
    fn abandon(&self, task_id: TaskId) {
        let cancelled = self.tasks.update(&task_id, &mut |t| {
            if t.status() == TaskStatus::Pending {
                t.cancel()
            } else {
                Ok(())
            }
        });
        if let Err(e) = cancelled {
            tracing::debug!(task_id = %task_id, error = %e, "Abandoned task not updated");
        }
        self.finalize_progress(task_id, "Task cancelled by shutdown");
        self.tokens.remove(&task_id);
    }

    fn finalize_progress(&self, task_id: TaskId, message: &str) {
        self.tracker.publish_warning(task_id, message);
        self.tracker.close(task_id);
    }

    /// 修改任务；失败只记录日志
    fn record(&self, task_id: &TaskId, mut f: impl FnMut(&mut Task) -> Result<(), TaskError>) {
        if let Err(e) = self.tasks.update(task_id, &mut f) {
            tracing::warn!(task_id = %task_id, error = %e, "Failed to update task");
        }
    }
}
