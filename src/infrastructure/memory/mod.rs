//! Memory Layer - In-Memory State Management
//!
//! 任务表的内存实现

mod task_manager;

pub use task_manager::InMemoryTaskManager;
