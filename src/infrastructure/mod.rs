//! Infrastructure Layer - 基础设施层
//!
//! 提供所有端口的具体实现

pub mod adapters;
pub mod events;
pub mod gpu;
pub mod http;
pub mod memory;
pub mod resilience;
pub mod worker;

pub use events::ProgressTracker;
pub use gpu::GpuResourceManager;
pub use memory::InMemoryTaskManager;
pub use resilience::CircuitBreaker;
pub use worker::{PipelineDispatcher, PipelineOrchestrator};
