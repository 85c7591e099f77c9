//! Events Layer - 任务进度发布
//!
//! 与传输方式（WebSocket / SSE / 轮询）解耦，HTTP 层只负责转发

mod progress_tracker;

pub use progress_tracker::{
    ProgressEvent, ProgressLevel, ProgressTracker, ProgressTrackerConfig, Subscription,
    Unsubscribe, PERCENT_ERRORED,
};
