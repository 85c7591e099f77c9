//! Stage Adapter - 模型服务客户端实现

mod factory;
mod fake_stage_client;
mod http_stage_client;

pub use factory::build_stage_registry;
pub use fake_stage_client::{FakeStageClient, FakeStageClientConfig};
pub use http_stage_client::{HttpStageClient, HttpStageClientConfig};
