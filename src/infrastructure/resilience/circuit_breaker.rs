//! Circuit Breaker - 按独占类别隔离外部模型服务故障
//!
//! 状态机:
//! - Closed: 正常放行；窗口内连续失败达到阈值后打开
//! - Open: 冷却期内直接失败，不发起网络调用
//! - HalfOpen: 冷却结束后只放行一次试探调用；成功关闭，失败重新打开且冷却期指数增长（有上限）

use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::application::{CallContext, DoneReason, StageError};

/// 熔断器配置
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// 打开熔断的连续失败次数
    pub failure_threshold: u32,
    /// 连续失败的统计窗口
    pub failure_window: Duration,
    /// 首次打开的冷却时长
    pub cooldown: Duration,
    /// 反复打开时冷却时长上限
    pub max_cooldown: Duration,
    /// 单次 call 内的重试次数（不含第一次）
    pub call_retries: u32,
    /// 重试初始退避
    pub initial_backoff: Duration,
    /// 重试退避上限
    pub max_backoff: Duration,
    /// 退避倍数（冷却时长增长也使用该倍数）
    pub backoff_multiplier: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            call_retries: 0,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl CircuitBreakerConfig {
    /// 第 attempt 次重试（从 0 开始）的退避时长，带 [d/2, d] 抖动
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let jittered = capped * rand::thread_rng().gen_range(0.5..=1.0);
        Duration::from_secs_f64(jittered)
    }

    fn cooldown_for(&self, reopen_count: u32) -> Duration {
        let secs = self.cooldown.as_secs_f64() * self.backoff_multiplier.powi(reopen_count as i32);
        Duration::from_secs_f64(secs.min(self.max_cooldown.as_secs_f64()))
    }
}

/// 熔断状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// 熔断器调用错误
#[derive(Debug, Clone, Error)]
pub enum BreakerError {
    #[error("Circuit open for class {class}")]
    CircuitOpen { class: String },

    #[error(transparent)]
    Stage(#[from] StageError),
}

/// 单个类别的熔断状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub class: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    window_started: Option<Instant>,
    opened_at: Option<Instant>,
    cooldown: Duration,
    reopen_count: u32,
    trial_in_flight: bool,
}

impl Circuit {
    fn new(cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            window_started: None,
            opened_at: None,
            cooldown,
            reopen_count: 0,
            trial_in_flight: false,
        }
    }
}

/// 熔断器
///
/// 每个独占类别一个电路，只由本组件修改
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, Circuit>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// 经熔断器执行调用
    ///
    /// 每次调用受 ctx 约束：到期视为超时失败，取消不计入失败。
    /// 失败时按指数退避 + 抖动重试 `call_retries` 次，不会越过 ctx 的截止时间
    pub async fn call<T, F, Fut>(
        &self,
        ctx: &CallContext,
        class: &str,
        mut op: F,
    ) -> Result<T, BreakerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let mut retry = 0;
        loop {
            let admission = self.admit(class).ok_or_else(|| BreakerError::CircuitOpen {
                class: class.to_string(),
            })?;
            let mut guard = AdmissionGuard {
                breaker: self,
                class,
                admission,
                settled: false,
            };

            let outcome = tokio::select! {
                biased;
                reason = ctx.done() => Err(match reason {
                    DoneReason::Cancelled => StageError::Cancelled,
                    DoneReason::DeadlineExceeded => StageError::Timeout,
                }),
                result = op() => result,
            };

            let error = match outcome {
                Ok(value) => {
                    self.record_success(class);
                    guard.settled = true;
                    return Ok(value);
                }
                // guard drop 时归还试探名额
                Err(e) if !e.counts_as_failure() => return Err(e.into()),
                Err(e) => e,
            };

            self.record_failure(class);
            guard.settled = true;
            drop(guard);

            if retry >= self.config.call_retries || ctx.is_done() {
                return Err(error.into());
            }

            let delay = self.config.backoff_delay(retry);
            if ctx.remaining().map(|left| left <= delay).unwrap_or(false) {
                return Err(error.into());
            }

            tracing::debug!(
                class = %class,
                retry = retry + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying stage call after backoff"
            );

            tokio::select! {
                _ = ctx.done() => return Err(error.into()),
                _ = tokio::time::sleep(delay) => {}
            }
            retry += 1;
        }
    }

    fn admit(&self, class: &str) -> Option<Admission> {
        let mut circuit = self
            .circuits
            .entry(class.to_string())
            .or_insert_with(|| Circuit::new(self.config.cooldown));

        match circuit.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => {
                let cooled = circuit
                    .opened_at
                    .map(|at| at.elapsed() >= circuit.cooldown)
                    .unwrap_or(true);
                if !cooled {
                    return None;
                }
                circuit.state = CircuitState::HalfOpen;
                circuit.trial_in_flight = true;
                tracing::info!(class = %class, "Circuit half-open, allowing trial call");
                Some(Admission::Trial)
            }
            CircuitState::HalfOpen => {
                if circuit.trial_in_flight {
                    None
                } else {
                    circuit.trial_in_flight = true;
                    Some(Admission::Trial)
                }
            }
        }
    }

    fn record_success(&self, class: &str) {
        if let Some(mut circuit) = self.circuits.get_mut(class) {
            if circuit.state != CircuitState::Closed {
                tracing::info!(class = %class, "Circuit closed after successful trial");
            }
            circuit.state = CircuitState::Closed;
            circuit.consecutive_failures = 0;
            circuit.window_started = None;
            circuit.opened_at = None;
            circuit.reopen_count = 0;
            circuit.cooldown = self.config.cooldown;
            circuit.trial_in_flight = false;
        }
    }

    fn record_failure(&self, class: &str) {
        let Some(mut circuit) = self.circuits.get_mut(class) else {
            return;
        };
        let now = Instant::now();

        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.reopen_count += 1;
                circuit.cooldown = self.config.cooldown_for(circuit.reopen_count);
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(now);
                circuit.trial_in_flight = false;
                tracing::warn!(
                    class = %class,
                    cooldown_ms = circuit.cooldown.as_millis() as u64,
                    reopen_count = circuit.reopen_count,
                    "Trial call failed, circuit reopened"
                );
            }
            CircuitState::Closed => {
                let window_expired = circuit
                    .window_started
                    .map(|start| now.duration_since(start) > self.config.failure_window)
                    .unwrap_or(true);
                if window_expired {
                    circuit.consecutive_failures = 0;
                    circuit.window_started = Some(now);
                }
                circuit.consecutive_failures += 1;

                if circuit.consecutive_failures >= self.config.failure_threshold {
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(now);
                    circuit.cooldown = self.config.cooldown_for(0);
                    tracing::warn!(
                        class = %class,
                        failures = circuit.consecutive_failures,
                        cooldown_ms = circuit.cooldown.as_millis() as u64,
                        "Circuit opened"
                    );
                }
            }
            // 打开之前已放行的调用晚到的失败
            CircuitState::Open => {}
        }
    }

    /// 调用被取消、panic 或被丢弃：试探名额还给下一个调用
    fn abandon(&self, class: &str, admission: Admission) {
        if admission == Admission::Trial {
            if let Some(mut circuit) = self.circuits.get_mut(class) {
                circuit.trial_in_flight = false;
            }
        }
    }

    /// 类别当前状态；从未调用过的类别视为 Closed
    pub fn state(&self, class: &str) -> CircuitState {
        self.circuits
            .get(class)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<CircuitSnapshot> = self
            .circuits
            .iter()
            .map(|entry| CircuitSnapshot {
                class: entry.key().clone(),
                state: entry.state,
                consecutive_failures: entry.consecutive_failures,
                cooldown_ms: entry.cooldown.as_millis() as u64,
            })
            .collect();
        snapshots.sort_by(|a, b| a.class.cmp(&b.class));
        snapshots
    }
}

/// 一次放行的调用；结果未记录就被 drop 时归还名额
struct AdmissionGuard<'a> {
    breaker: &'a CircuitBreaker,
    class: &'a str,
    admission: Admission,
    settled: bool,
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            if self.admission == Admission::Trial {
                tracing::debug!(class = %self.class, "Trial call abandoned, releasing trial slot");
            }
            self.breaker.abandon(self.class, self.admission);
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
