//! GPU Layer - 单 GPU 准入控制
//!
//! GPU 只被建模为信号量计数 + 显存计数器，不持有真实设备句柄

mod resource_manager;

pub use resource_manager::{
    ClassUtilization, GpuResourceManager, Reservation, ResourceError, UtilizationSnapshot,
};
