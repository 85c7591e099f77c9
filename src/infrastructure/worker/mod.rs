//! Worker Layer - Background Task Processing
//!
//! 实现 PipelineOrchestrator，驱动多阶段推理任务

mod orchestrator;

pub use orchestrator::{
    OrchestratorConfig, OrchestratorDeps, PipelineDispatcher, PipelineOrchestrator,
    SubmitRequest, TaskStatusSnapshot,
};
