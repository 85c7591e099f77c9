//! Stage Context - 阶段静态描述
//!
//! 职责:
//! - 阶段描述符（独占类别、并发上限、显存估算、超时、重试、fallback）
//! - 描述符自身的合法性校验

mod descriptor;

pub use descriptor::{RetryPolicy, StageDescriptor};
