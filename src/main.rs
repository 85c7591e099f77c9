//! Vidpipe - 单 GPU 多阶段推理流水线调度服务

use std::sync::Arc;
use std::time::Duration;

use vidpipe::config::{load_config, print_config, AppConfig};
use vidpipe::infrastructure::adapters::build_stage_registry;
use vidpipe::infrastructure::events::{ProgressTracker, ProgressTrackerConfig};
use vidpipe::infrastructure::gpu::GpuResourceManager;
use vidpipe::infrastructure::http::{AppState, HttpServer, ServerConfig};
use vidpipe::infrastructure::memory::InMemoryTaskManager;
use vidpipe::infrastructure::resilience::{CircuitBreaker, CircuitBreakerConfig};
use vidpipe::infrastructure::worker::{OrchestratorConfig, OrchestratorDeps, PipelineOrchestrator};

fn init_tracing(config: &AppConfig) {
    let log_filter = format!(
        "{},vidpipe={},tower_http=debug",
        config.log.level, config.log.level
    );
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_filter));

    if config.log.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn breaker_config(config: &AppConfig) -> CircuitBreakerConfig {
    let breaker = &config.breaker;
    CircuitBreakerConfig {
        failure_threshold: breaker.failure_threshold,
        failure_window: Duration::from_secs(breaker.failure_window_secs),
        cooldown: Duration::from_secs(breaker.cooldown_secs),
        max_cooldown: Duration::from_secs(breaker.max_cooldown_secs),
        call_retries: breaker.call_retries,
        initial_backoff: Duration::from_millis(breaker.initial_backoff_ms),
        max_backoff: Duration::from_millis(breaker.max_backoff_ms),
        backoff_multiplier: breaker.backoff_multiplier,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置（优先级：环境变量 > 配置文件 > 默认值）
    let config = load_config().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    init_tracing(&config);

    tracing::info!("Vidpipe - GPU inference pipeline scheduler");
    print_config(&config);

    // 阶段注册表
    let vram_budget = config.gpu.vram_budget();
    let registry = build_stage_registry(&config.stages, vram_budget)?;

    // GPU 资源管理器
    let resources = GpuResourceManager::new(vram_budget, registry.class_limits()?);

    // 进度追踪器
    let tracker = ProgressTracker::new(ProgressTrackerConfig {
        history_limit: config.progress.history_limit,
        subscriber_buffer: config.progress.subscriber_buffer,
        retention: Duration::from_secs(config.progress.retention_secs),
    });

    // 创建调度器
    let orchestrator_config = OrchestratorConfig {
        max_in_flight: config.pipeline.max_in_flight,
        queue_capacity: config.pipeline.queue_capacity,
        acquire_timeout: config.gpu.acquire_timeout(),
    };
    let (orchestrator, dispatcher) = PipelineOrchestrator::new(
        orchestrator_config,
        OrchestratorDeps {
            registry,
            resources,
            tracker,
            breaker: Arc::new(CircuitBreaker::new(breaker_config(&config))),
            tasks: Arc::new(InMemoryTaskManager::new()),
        },
    );

    // 启动调度循环
    let dispatcher_handle = tokio::spawn(dispatcher.run());

    // 启动 GC
    if config.gc.enabled {
        tokio::spawn(orchestrator.clone().run_janitor(
            Duration::from_secs(config.gc.interval_secs),
            Duration::from_secs(config.gc.task_retention_secs),
        ));
    }

    // 创建 HTTP 服务器
    let server_config = ServerConfig::new(&config.server.host, config.server.port);
    let server = HttpServer::new(server_config, AppState::new(orchestrator.clone()));

    tracing::info!("Starting HTTP server...");

    // 启动服务器（带优雅关闭）
    server
        .run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
            }
            tracing::info!("Received shutdown signal");
        })
        .await?;

    orchestrator.shutdown();
    let _ = dispatcher_handle.await;

    tracing::info!("Server shutdown complete");

    Ok(())
}
