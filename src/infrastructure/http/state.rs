//! Application State

use crate::infrastructure::worker::PipelineOrchestrator;

/// 应用状态
///
/// 资源管理器、进度追踪器、熔断器都通过 orchestrator 访问
pub struct AppState {
    pub orchestrator: PipelineOrchestrator,
}

impl AppState {
    /// 创建应用状态
    pub fn new(orchestrator: PipelineOrchestrator) -> Self {
        Self { orchestrator }
    }
}
