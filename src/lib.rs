//! Vidpipe - 单 GPU 多阶段推理流水线调度
//!
//! 架构设计: DDD + Hexagonal Architecture
//!
//! 领域层 (domain/):
//! - Task Context: 任务聚合、状态机
//! - Stage Context: 阶段描述符、重试策略
//!
//! 应用层 (application/):
//! - Ports: 端口定义（StageClient, TaskManager）
//! - Registry: 阶段注册表
//! - Context / Error: 取消上下文、流水线错误分类
//!
//! 基础设施层 (infrastructure/):
//! - GPU: 显存与独占类别准入控制
//! - Worker: PipelineOrchestrator 任务调度
//! - Resilience: 按类别熔断
//! - Events: 进度事件发布订阅
//! - Memory: TaskManager 内存实现
//! - Adapters: HTTP / Fake 阶段客户端
//! - HTTP: RESTful API + WebSocket

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use config::{load_config, AppConfig};
