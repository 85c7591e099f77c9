//! Configuration Loader
//!
//! 实现多源配置加载与合并逻辑
//!
//! 优先级（从高到低）：
//! 1. 环境变量
//! 2. 配置文件（config.toml）
//! 3. 默认值

use config::{Config, ConfigError as ConfigCrateError, Environment, File};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

use super::types::{AppConfig, StageClientKind};

/// 配置加载错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigCrateError> for ConfigError {
    fn from(err: ConfigCrateError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

/// 配置文件搜索路径
const CONFIG_FILE_NAMES: &[&str] = &["config", "config.local"];

/// 加载应用配置
///
/// 按优先级从高到低合并配置：
/// 1. 环境变量（前缀 `VIDPIPE_`，层级分隔符 `__`）
/// 2. 配置文件（config.toml 或 config.local.toml）
/// 3. 默认值
///
/// # 环境变量示例
/// - `VIDPIPE_SERVER__PORT=8080`
/// - `VIDPIPE_GPU__TOTAL_VRAM_BYTES=25769803776`
/// - `VIDPIPE_BREAKER__FAILURE_THRESHOLD=3`
///
/// 阶段表只能通过配置文件的 `[[stages]]` 覆盖
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from_path(None)
}

/// 从指定路径加载配置
///
/// # 参数
/// - `config_path` - 可选的配置文件路径，如果为 None 则使用默认搜索路径
pub fn load_config_from_path(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder();

    // 1. 首先设置默认值（最低优先级）
    builder = builder
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 5060)?
        .set_default("gpu.total_vram_bytes", 16_u64 * 1024 * 1024 * 1024)?
        .set_default("gpu.reserved_headroom_bytes", 1024_u64 * 1024 * 1024)?
        .set_default("gpu.acquire_timeout_secs", 300)?
        .set_default("pipeline.max_in_flight", 8)?
        .set_default("pipeline.queue_capacity", 256)?
        .set_default("breaker.failure_threshold", 5)?
        .set_default("breaker.failure_window_secs", 60)?
        .set_default("breaker.cooldown_secs", 30)?
        .set_default("breaker.max_cooldown_secs", 300)?
        .set_default("breaker.call_retries", 0)?
        .set_default("progress.history_limit", 256)?
        .set_default("progress.subscriber_buffer", 64)?
        .set_default("progress.retention_secs", 300)?
        .set_default("gc.enabled", true)?
        .set_default("gc.interval_secs", 60)?
        .set_default("gc.task_retention_secs", 3600)?
        .set_default("log.level", "info")?
        .set_default("log.json", false)?;

    // 2. 添加配置文件（如果存在）
    if let Some(path) = config_path {
        builder = builder.add_source(File::from(path).required(true));
    } else {
        for name in CONFIG_FILE_NAMES {
            builder = builder.add_source(File::with_name(name).required(false));
        }
    }

    // 3. 添加环境变量（最高优先级）
    builder = builder.add_source(
        Environment::with_prefix("VIDPIPE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;

    let app_config: AppConfig = config.try_deserialize().map_err(|e| {
        ConfigError::ParseError(format!("Failed to deserialize config: {}", e))
    })?;

    validate_config(&app_config)?;

    Ok(app_config)
}

/// 验证配置有效性
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

    if config.server.port == 0 {
        return invalid("Server port cannot be 0".to_string());
    }

    if config.gpu.total_vram_bytes == 0 {
        return invalid("GPU total VRAM cannot be 0".to_string());
    }
    if config.gpu.reserved_headroom_bytes >= config.gpu.total_vram_bytes {
        return invalid("GPU reserved headroom must be smaller than total VRAM".to_string());
    }

    if config.pipeline.max_in_flight == 0 || config.pipeline.queue_capacity == 0 {
        return invalid("Pipeline max_in_flight and queue_capacity must be >= 1".to_string());
    }

    if config.breaker.failure_threshold == 0 {
        return invalid("Breaker failure_threshold must be >= 1".to_string());
    }
    if config.breaker.backoff_multiplier < 1.0 {
        return invalid("Breaker backoff_multiplier must be >= 1.0".to_string());
    }

    if config.progress.history_limit == 0 || config.progress.subscriber_buffer == 0 {
        return invalid("Progress history_limit and subscriber_buffer must be >= 1".to_string());
    }

    if config.gc.enabled && config.gc.interval_secs == 0 {
        return invalid("GC interval cannot be 0 when GC is enabled".to_string());
    }

    if config.stages.is_empty() {
        return invalid("Stage table cannot be empty".to_string());
    }

    let mut names = HashSet::new();
    for stage in &config.stages {
        if !names.insert(stage.name.as_str()) {
            return invalid(format!("Duplicate stage: {}", stage.name));
        }
        if stage.max_concurrent == 0 {
            return invalid(format!("Stage {} max_concurrent must be >= 1", stage.name));
        }
        if stage.max_attempts == 0 {
            return invalid(format!("Stage {} max_attempts must be >= 1", stage.name));
        }
        if stage.kind == StageClientKind::Http
            && stage.endpoint.as_deref().map(str::is_empty).unwrap_or(true)
        {
            return invalid(format!("Stage {} requires an endpoint", stage.name));
        }
    }

    Ok(())
}

/// 打印配置信息（用于启动时日志）
pub fn print_config(config: &AppConfig) {
    tracing::info!("=== Application Configuration ===");
    tracing::info!("Server: {}:{}", config.server.host, config.server.port);
    tracing::info!(
        "GPU VRAM: total {} bytes, headroom {} bytes, budget {} bytes",
        config.gpu.total_vram_bytes,
        config.gpu.reserved_headroom_bytes,
        config.gpu.vram_budget()
    );
    tracing::info!("GPU Acquire Timeout: {}s", config.gpu.acquire_timeout_secs);
    tracing::info!("Max In-Flight Tasks: {}", config.pipeline.max_in_flight);
    tracing::info!(
        "Breaker: threshold {}, cooldown {}s (max {}s)",
        config.breaker.failure_threshold,
        config.breaker.cooldown_secs,
        config.breaker.max_cooldown_secs
    );
    for stage in &config.stages {
        tracing::info!(
            "Stage {}: class={} max_concurrent={} vram={:?} attempts={} fallback={:?} kind={:?}",
            stage.name,
            stage.class,
            stage.max_concurrent,
            stage.vram_bytes,
            stage.max_attempts,
            stage.fallback,
            stage.kind
        );
    }
    tracing::info!("GC Enabled: {}", config.gc.enabled);
    if config.gc.enabled {
        tracing::info!("GC Interval: {}s", config.gc.interval_secs);
        tracing::info!("Task Retention: {}s", config.gc.task_retention_secs);
    }
    tracing::info!("Log Level: {}", config.log.level);
    tracing::info!("=================================");
}
