//! Stage Context - Stage Descriptor

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 阶段级重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 总尝试次数（含第一次），至少为 1
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn no_retry() -> Self {
        Self { max_attempts: 1 }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

/// 阶段描述符（静态配置，不随任务变化）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    pub name: String,
    /// 共享同一并发上限的 GPU 工作类别，如 "yolo"、"tts"、"lipsync"
    pub exclusivity_class: String,
    /// 该类别同时存活的 reservation 上限
    pub max_concurrent: usize,
    /// 单次调用的显存估算；纯 CPU 阶段为 0
    pub estimated_vram_bytes: u64,
    pub timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub fallback_stage: Option<String>,
}

impl StageDescriptor {
    pub fn new(name: impl Into<String>, exclusivity_class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exclusivity_class: exclusivity_class.into(),
            max_concurrent: 1,
            estimated_vram_bytes: 0,
            timeout: Duration::from_secs(120),
            retry_policy: RetryPolicy::default(),
            fallback_stage: None,
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_vram(mut self, bytes: u64) -> Self {
        self.estimated_vram_bytes = bytes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_fallback(mut self, stage: impl Into<String>) -> Self {
        self.fallback_stage = Some(stage.into());
        self
    }

    /// 校验描述符自身字段
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("stage name cannot be empty".to_string());
        }
        if self.exclusivity_class.is_empty() {
            return Err(format!("stage {}: exclusivity class cannot be empty", self.name));
        }
        if self.max_concurrent == 0 {
            return Err(format!("stage {}: max_concurrent must be >= 1", self.name));
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(format!("stage {}: max_attempts must be >= 1", self.name));
        }
        if self.timeout.is_zero() {
            return Err(format!("stage {}: timeout cannot be 0", self.name));
        }
        if self.fallback_stage.as_deref() == Some(self.name.as_str()) {
            return Err(format!("stage {}: fallback cannot point to itself", self.name));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let desc = StageDescriptor::new("detect", "yolo")
            .with_max_concurrent(2)
            .with_vram(2 * 1024 * 1024 * 1024);
        assert_eq!(desc.max_concurrent, 2);
        assert_eq!(desc.retry_policy.max_attempts, 1);
        assert!(desc.fallback_stage.is_none());
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn test_retry_policy_at_least_one_attempt() {
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
        assert_eq!(RetryPolicy::new(3).max_attempts, 3);
    }

    #[test]
    fn test_validate_rejects_self_fallback() {
        let desc = StageDescriptor::new("detect", "yolo").with_fallback("detect");
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let desc = StageDescriptor::new("detect", "yolo").with_max_concurrent(0);
        assert!(desc.validate().is_err());
    }
}
