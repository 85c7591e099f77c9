//! 根据阶段表构建 StageRegistry

use std::sync::Arc;
use std::time::Duration;

use crate::application::ports::StageClientPort;
use crate::application::{RegistryError, StageRegistry};
use crate::config::{StageClientKind, StageConfig};
use crate::domain::stage::{RetryPolicy, StageDescriptor};

use super::{FakeStageClient, FakeStageClientConfig, HttpStageClient, HttpStageClientConfig};

/// 未配置超时时的默认值
const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(120);

/// 为每个阶段创建客户端并注册，最后做全量校验
pub fn build_stage_registry(
    stages: &[StageConfig],
    vram_budget: u64,
) -> Result<StageRegistry, RegistryError> {
    let mut registry = StageRegistry::new();

    for stage in stages {
        let client = build_client(stage)?;
        let metadata = client.metadata();

        // 未配置的显存/超时取客户端元数据
        let mut descriptor = StageDescriptor::new(&stage.name, &stage.class)
            .with_max_concurrent(stage.max_concurrent)
            .with_vram(stage.vram_bytes.unwrap_or(metadata.estimated_vram_bytes))
            .with_timeout(
                stage
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(metadata.default_timeout),
            )
            .with_retry(RetryPolicy::new(stage.max_attempts));
        if let Some(fallback) = &stage.fallback {
            descriptor = descriptor.with_fallback(fallback);
        }

        registry.register(descriptor, client)?;
    }

    registry.validate(vram_budget)?;

    tracing::info!(stages = registry.len(), "Stage registry built");
    Ok(registry)
}

fn build_client(stage: &StageConfig) -> Result<Arc<dyn StageClientPort>, RegistryError> {
    let timeout = stage
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_STAGE_TIMEOUT);
    let vram = stage.vram_bytes.unwrap_or(0);

    match stage.kind {
        StageClientKind::Http => {
            let endpoint = stage.endpoint.clone().ok_or_else(|| RegistryError::ClientInit {
                stage: stage.name.clone(),
                message: "missing endpoint".to_string(),
            })?;
            let config = HttpStageClientConfig::new(endpoint, &stage.class)
                .with_timeout(timeout)
                .with_vram(vram);
            let client = HttpStageClient::new(config).map_err(|e| RegistryError::ClientInit {
                stage: stage.name.clone(),
                message: e.to_string(),
            })?;
            Ok(Arc::new(client))
        }
        StageClientKind::Fake => {
            let config = FakeStageClientConfig::new(&stage.class)
                .with_latency(Duration::from_millis(stage.fake_latency_ms))
                .with_timeout(timeout)
                .with_vram(vram);
            Ok(Arc::new(FakeStageClient::new(config)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_stages, AppConfig};

    #[test]
    fn test_default_stage_table_builds() {
        let config = AppConfig::default();
        let registry = build_stage_registry(&config.stages, config.gpu.vram_budget()).unwrap();
        assert_eq!(registry.len(), 8);

        let voice = registry.get("synthesize_voice").unwrap();
        assert_eq!(voice.descriptor.retry_policy.max_attempts, 2);
        assert_eq!(
            voice.descriptor.fallback_stage.as_deref(),
            Some("synthesize_voice_fallback")
        );

        let limits = registry.class_limits().unwrap();
        assert_eq!(limits.get("lipsync"), Some(&1));
        assert_eq!(limits.get("yolo"), Some(&2));
    }

    #[test]
    fn test_unset_timeout_uses_client_default() {
        let mut stages = default_stages();
        stages.retain(|s| s.name == "mix_bgm");
        stages[0].timeout_secs = None;
        stages[0].kind = StageClientKind::Fake;

        let registry = build_stage_registry(&stages, u64::MAX).unwrap();
        assert_eq!(
            registry.get("mix_bgm").unwrap().descriptor.timeout,
            DEFAULT_STAGE_TIMEOUT
        );
    }

    #[test]
    fn test_invalid_endpoint_reported() {
        let mut stages = default_stages();
        stages.retain(|s| s.name == "detect_person");
        stages[0].endpoint = Some("::bad::".to_string());

        let result = build_stage_registry(&stages, u64::MAX);
        assert!(matches!(result, Err(RegistryError::ClientInit { .. })));
    }
}
