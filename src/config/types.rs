//! Configuration Types
//!
//! 定义所有配置结构体

use serde::Deserialize;
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;

/// 应用主配置
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,

    /// GPU 资源配置
    #[serde(default)]
    pub gpu: GpuConfig,

    /// 流水线调度配置
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// 熔断器配置
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// 进度推送配置
    #[serde(default)]
    pub progress: ProgressConfig,

    /// GC 配置
    #[serde(default)]
    pub gc: GcConfig,

    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,

    /// 阶段表
    #[serde(default = "default_stages")]
    pub stages: Vec<StageConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            gpu: GpuConfig::default(),
            pipeline: PipelineConfig::default(),
            breaker: BreakerConfig::default(),
            progress: ProgressConfig::default(),
            gc: GcConfig::default(),
            log: LogConfig::default(),
            stages: default_stages(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,

    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5060
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// 获取服务器地址
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// GPU 资源配置
#[derive(Debug, Clone, Deserialize)]
pub struct GpuConfig {
    /// 设备显存总量（字节）
    #[serde(default = "default_total_vram")]
    pub total_vram_bytes: u64,

    /// 为系统/驱动保留的显存（字节）
    #[serde(default = "default_reserved_headroom")]
    pub reserved_headroom_bytes: u64,

    /// 等待 GPU slot 的最长时间（秒），超时任务以 ResourceExhausted 失败
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_total_vram() -> u64 {
    16 * GIB
}

fn default_reserved_headroom() -> u64 {
    GIB
}

fn default_acquire_timeout() -> u64 {
    300
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            total_vram_bytes: default_total_vram(),
            reserved_headroom_bytes: default_reserved_headroom(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

impl GpuConfig {
    /// 可分配给 reservation 的显存预算
    pub fn vram_budget(&self) -> u64 {
        self.total_vram_bytes
            .saturating_sub(self.reserved_headroom_bytes)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// 流水线调度配置
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// 同时执行的任务上限
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// 待调度队列容量
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_max_in_flight() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// 熔断器配置
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// 打开熔断的连续失败次数
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// 连续失败统计窗口（秒）
    #[serde(default = "default_failure_window")]
    pub failure_window_secs: u64,

    /// 首次冷却时长（秒）
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// 冷却时长上限（秒）
    #[serde(default = "default_max_cooldown")]
    pub max_cooldown_secs: u64,

    /// 单次调用内的重试次数
    #[serde(default)]
    pub call_retries: u32,

    /// 重试初始退避（毫秒）
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// 重试退避上限（毫秒）
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window() -> u64 {
    60
}

fn default_cooldown() -> u64 {
    30
}

fn default_max_cooldown() -> u64 {
    300
}

fn default_initial_backoff() -> u64 {
    200
}

fn default_max_backoff() -> u64 {
    5000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window(),
            cooldown_secs: default_cooldown(),
            max_cooldown_secs: default_max_cooldown(),
            call_retries: 0,
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// 进度推送配置
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressConfig {
    /// 每个任务保留的历史事件条数
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// 每个订阅者的缓冲区大小，写满即断开
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// 任务结束后历史保留时间（秒）
    #[serde(default = "default_progress_retention")]
    pub retention_secs: u64,
}

fn default_history_limit() -> usize {
    256
}

fn default_subscriber_buffer() -> usize {
    64
}

fn default_progress_retention() -> u64 {
    300
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            subscriber_buffer: default_subscriber_buffer(),
            retention_secs: default_progress_retention(),
        }
    }
}

/// GC（垃圾回收）配置
#[derive(Debug, Clone, Deserialize)]
pub struct GcConfig {
    /// 是否启用自动 GC
    #[serde(default = "default_gc_enabled")]
    pub enabled: bool,

    /// GC 间隔时间（秒）
    #[serde(default = "default_gc_interval")]
    pub interval_secs: u64,

    /// 终态任务保留时间（秒）
    #[serde(default = "default_task_retention")]
    pub task_retention_secs: u64,
}

fn default_gc_enabled() -> bool {
    true
}

fn default_gc_interval() -> u64 {
    60
}

fn default_task_retention() -> u64 {
    3600 // 1 小时
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: default_gc_enabled(),
            interval_secs: default_gc_interval(),
            task_retention_secs: default_task_retention(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否启用 JSON 格式
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// 阶段客户端实现
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageClientKind {
    /// 调用外部 HTTP 模型服务
    #[default]
    Http,
    /// 本地模拟，不发起网络请求
    Fake,
}

/// 单个阶段配置
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    pub name: String,

    /// 独占类别
    pub class: String,

    /// 类别并发上限；同类别各阶段必须一致
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// 显存估算（字节），未设置时取客户端元数据
    #[serde(default)]
    pub vram_bytes: Option<u64>,

    /// 超时时间（秒），未设置时取客户端元数据
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// 总尝试次数（含第一次）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// 失败后替换执行的阶段
    #[serde(default)]
    pub fallback: Option<String>,

    /// HTTP 端点（kind = http 时必填）
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub kind: StageClientKind,

    /// kind = fake 时的模拟延迟（毫秒）
    #[serde(default = "default_fake_latency")]
    pub fake_latency_ms: u64,
}

fn default_max_concurrent() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    1
}

fn default_fake_latency() -> u64 {
    200
}

impl StageConfig {
    pub fn new(name: &str, class: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            class: class.to_string(),
            max_concurrent: default_max_concurrent(),
            vram_bytes: None,
            timeout_secs: None,
            max_attempts: default_max_attempts(),
            fallback: None,
            endpoint: Some(format!("http://localhost:{}/infer", port)),
            kind: StageClientKind::Http,
            fake_latency_ms: default_fake_latency(),
        }
    }

    fn concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    fn vram(mut self, bytes: u64) -> Self {
        self.vram_bytes = Some(bytes);
        self
    }

    fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    fn attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    fn fallback(mut self, stage: &str) -> Self {
        self.fallback = Some(stage.to_string());
        self
    }
}

/// 默认阶段表：人物检测 → 背景分割 → 语音合成 → 韵律调整 → BGM 混音 → 口型视频渲染
pub fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig::new("detect_person", "yolo", 8101)
            .concurrent(2)
            .vram(2 * GIB)
            .timeout(30),
        StageConfig::new("segment_background", "segmentation", 8102)
            .vram(3 * GIB)
            .timeout(60),
        StageConfig::new("synthesize_voice", "tts", 8103)
            .vram(4 * GIB)
            .timeout(120)
            .attempts(2)
            .fallback("synthesize_voice_fallback"),
        StageConfig::new("synthesize_voice_fallback", "tts_fallback", 8104)
            .vram(GIB)
            .timeout(60),
        StageConfig::new("adjust_prosody", "prosody", 8105)
            .concurrent(2)
            .vram(GIB)
            .timeout(30),
        StageConfig::new("mix_bgm", "audio_mix", 8106)
            .concurrent(4)
            .vram(0)
            .timeout(30),
        StageConfig::new("render_video", "lipsync", 8107)
            .vram(8 * GIB)
            .timeout(600)
            .attempts(2)
            .fallback("render_video_fallback"),
        StageConfig::new("render_video_fallback", "still_video", 8108)
            .concurrent(2)
            .vram(0)
            .timeout(120),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 5060);
        assert_eq!(config.gpu.total_vram_bytes, 16 * GIB);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.stages.len(), 8);
    }

    #[test]
    fn test_server_addr() {
        let config = ServerConfig::default();
        assert_eq!(config.addr(), "0.0.0.0:5060");
    }

    #[test]
    fn test_vram_budget_excludes_headroom() {
        let config = GpuConfig::default();
        assert_eq!(config.vram_budget(), 15 * GIB);
    }

    #[test]
    fn test_default_stage_fallbacks_exist() {
        let stages = default_stages();
        for stage in &stages {
            if let Some(fallback) = &stage.fallback {
                let target = stages.iter().find(|s| &s.name == fallback).unwrap();
                assert_ne!(target.class, stage.class, "{} shares its class", stage.name);
            }
        }
        let render = stages.iter().find(|s| s.name == "render_video").unwrap();
        assert_eq!(render.max_concurrent, 1);
        assert_eq!(render.class, "lipsync");
    }
}
