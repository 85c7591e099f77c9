//! Fake Stage Client - 用于测试和本地运行的阶段客户端
//!
//! 不实际调用模型服务，按配置模拟延迟和失败

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::application::context::{CallContext, DoneReason};
use crate::application::ports::{
    StageClientPort, StageError, StageInput, StageMetadata, StageOutput,
};

/// Fake Stage Client 配置
#[derive(Debug, Clone)]
pub struct FakeStageClientConfig {
    pub exclusivity_class: String,
    pub estimated_vram_bytes: u64,
    pub default_timeout: Duration,
    /// 模拟推理延迟
    pub latency: Duration,
    /// 前 N 次调用返回失败
    pub fail_first: u32,
    /// 所有调用都失败
    pub always_fail: bool,
}

impl FakeStageClientConfig {
    pub fn new(exclusivity_class: impl Into<String>) -> Self {
        Self {
            exclusivity_class: exclusivity_class.into(),
            estimated_vram_bytes: 0,
            default_timeout: Duration::from_secs(30),
            latency: Duration::from_millis(10),
            fail_first: 0,
            always_fail: false,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_vram(mut self, bytes: u64) -> Self {
        self.estimated_vram_bytes = bytes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn failing_first(mut self, times: u32) -> Self {
        self.fail_first = times;
        self
    }

    pub fn always_failing(mut self) -> Self {
        self.always_fail = true;
        self
    }
}

/// Fake Stage Client
///
/// 记录调用次数、开始时间和并发峰值，供测试断言
pub struct FakeStageClient {
    config: FakeStageClientConfig,
    calls: AtomicU32,
    active: AtomicUsize,
    peak: AtomicUsize,
    started: Mutex<Vec<Instant>>,
}

impl FakeStageClient {
    pub fn new(config: FakeStageClientConfig) -> Self {
        Self {
            config,
            calls: AtomicU32::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        }
    }

    /// 已发起的调用次数
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// 同时执行的调用数峰值
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// 每次调用的开始时间
    pub fn start_times(&self) -> Vec<Instant> {
        self.started
            .lock()
            .map(|times| times.clone())
            .unwrap_or_default()
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StageClientPort for FakeStageClient {
    fn metadata(&self) -> StageMetadata {
        StageMetadata {
            exclusivity_class: self.config.exclusivity_class.clone(),
            estimated_vram_bytes: self.config.estimated_vram_bytes,
            default_timeout: self.config.default_timeout,
        }
    }

    async fn invoke(&self, ctx: &CallContext, input: StageInput) -> Result<StageOutput, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut started) = self.started.lock() {
            started.push(Instant::now());
        }

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        tracing::debug!(
            task_id = %input.task_id,
            stage = %input.stage,
            call = call,
            "FakeStageClient: simulating inference"
        );

        tokio::select! {
            biased;
            reason = ctx.done() => {
                return Err(match reason {
                    DoneReason::Cancelled => StageError::Cancelled,
                    DoneReason::DeadlineExceeded => StageError::Timeout,
                });
            }
            _ = tokio::time::sleep(self.config.latency) => {}
        }

        if self.config.always_fail || call <= self.config.fail_first {
            return Err(StageError::ServiceError {
                status: 503,
                message: format!("{} unavailable (simulated)", input.stage),
            });
        }

        Ok(StageOutput {
            payload: json!({
                "stage": input.stage,
                "params": input.params,
                "upstream": input.payload,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::TaskId;
    use serde_json::Value;
    use std::sync::Arc;

    fn input(stage: &str) -> StageInput {
        StageInput {
            task_id: TaskId::new(),
            stage: stage.to_string(),
            params: Value::Null,
            payload: json!({"image": "a.png"}),
        }
    }

    #[tokio::test]
    async fn test_output_wraps_upstream_payload() {
        let client = FakeStageClient::new(FakeStageClientConfig::new("yolo"));
        let output = client
            .invoke(&CallContext::background(), input("detect_person"))
            .await
            .unwrap();
        assert_eq!(output.payload["stage"], "detect_person");
        assert_eq!(output.payload["upstream"]["image"], "a.png");
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_fail_first_then_succeed() {
        let client = FakeStageClient::new(FakeStageClientConfig::new("tts").failing_first(2));
        let ctx = CallContext::background();
        assert!(client.invoke(&ctx, input("tts")).await.is_err());
        assert!(client.invoke(&ctx, input("tts")).await.is_err());
        assert!(client.invoke(&ctx, input("tts")).await.is_ok());
    }

    #[tokio::test]
    async fn test_deadline_maps_to_timeout() {
        let client = FakeStageClient::new(
            FakeStageClientConfig::new("lipsync").with_latency(Duration::from_secs(5)),
        );
        let ctx = CallContext::background().child_with_timeout(Duration::from_millis(20));
        let result = client.invoke(&ctx, input("render_video")).await;
        assert!(matches!(result, Err(StageError::Timeout)));
    }

    #[tokio::test]
    async fn test_tracks_peak_concurrency() {
        let client = Arc::new(FakeStageClient::new(
            FakeStageClientConfig::new("mix").with_latency(Duration::from_millis(50)),
        ));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client
                    .invoke(&CallContext::background(), input("mix_bgm"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(client.peak_concurrency(), 3);
        assert_eq!(client.start_times().len(), 3);
    }
}
