//! Progress Tracker - 任务进度发布 / 订阅
//!
//! 每个任务一个有界环形历史缓冲；订阅者先收到历史，再收到实时事件。
//! 发布永不阻塞：订阅者的通道满了就断开它，由订阅方重新订阅。

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::domain::task::TaskId;

/// 出错哨兵值
pub const PERCENT_ERRORED: i8 = -1;

/// 事件级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressLevel {
    Info,
    /// 重试 / fallback 提示，百分比沿用上一条
    Warn,
}

/// 进度事件（不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    /// 每个任务内严格递增，从 1 开始
    pub sequence: u64,
    /// 0-100 单调不减；-1 表示出错
    pub percentage: i8,
    pub level: ProgressLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn is_errored(&self) -> bool {
        self.percentage == PERCENT_ERRORED
    }
}

/// Progress Tracker 配置
#[derive(Debug, Clone)]
pub struct ProgressTrackerConfig {
    /// 每个任务保留的历史事件数
    pub history_limit: usize,
    /// 每个订阅者在历史之外的实时缓冲
    pub subscriber_buffer: usize,
    /// 任务关闭后历史保留时长
    pub retention: Duration,
}

impl Default for ProgressTrackerConfig {
    fn default() -> Self {
        Self {
            history_limit: 256,
            subscriber_buffer: 64,
            retention: Duration::from_secs(300),
        }
    }
}

struct TaskChannel {
    next_sequence: u64,
    last_percentage: i8,
    errored: bool,
    history: VecDeque<ProgressEvent>,
    subscribers: Vec<(u64, mpsc::Sender<ProgressEvent>)>,
    closed_at: Option<Instant>,
    last_activity: Instant,
}

impl TaskChannel {
    fn new() -> Self {
        Self {
            next_sequence: 1,
            last_percentage: 0,
            errored: false,
            history: VecDeque::new(),
            subscribers: Vec::new(),
            closed_at: None,
            last_activity: Instant::now(),
        }
    }

    fn expired(&self, retention: Duration, now: Instant) -> bool {
        match self.closed_at {
            Some(closed_at) => now.duration_since(closed_at) >= retention,
            // 只有订阅、从未发布且已无人监听的条目
            None => {
                self.subscribers.is_empty()
                    && self.history.is_empty()
                    && now.duration_since(self.last_activity) >= retention
            }
        }
    }
}

struct TrackerInner {
    config: ProgressTrackerConfig,
    channels: DashMap<TaskId, TaskChannel>,
    next_subscriber_id: AtomicU64,
}

impl TrackerInner {
    fn unsubscribe(&self, task_id: &TaskId, subscriber_id: u64) {
        if let Some(mut channel) = self.channels.get_mut(task_id) {
            channel.subscribers.retain(|(id, _)| *id != subscriber_id);
        }
    }
}

/// 取消订阅句柄；drop 时自动取消
pub struct Unsubscribe {
    tracker: Weak<TrackerInner>,
    task_id: TaskId,
    subscriber_id: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        // Drop 完成实际工作
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(inner) = self.tracker.upgrade() {
            inner.unsubscribe(&self.task_id, self.subscriber_id);
            tracing::debug!(
                task_id = %self.task_id,
                subscriber_id = self.subscriber_id,
                "Progress subscriber removed"
            );
        }
    }
}

/// 一次订阅
///
/// `recv()` 返回 None 表示任务已关闭或订阅者因落后被断开
pub struct Subscription {
    receiver: mpsc::Receiver<ProgressEvent>,
    unsubscribe: Unsubscribe,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn into_parts(self) -> (mpsc::Receiver<ProgressEvent>, Unsubscribe) {
        (self.receiver, self.unsubscribe)
    }
}

/// 进度追踪器
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<TrackerInner>,
}

impl ProgressTracker {
    pub fn new(config: ProgressTrackerConfig) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                config,
                channels: DashMap::new(),
                next_subscriber_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ProgressTrackerConfig {
        &self.inner.config
    }

    /// 发布进度事件，返回分配的序号；任务已关闭或已出错时丢弃并返回 None
    pub fn publish(&self, task_id: TaskId, percentage: i8, message: impl Into<String>) -> Option<u64> {
        self.append(task_id, Some(percentage), ProgressLevel::Info, message.into())
    }

    /// 发布重试 / fallback 提示，百分比沿用上一条
    pub fn publish_warning(&self, task_id: TaskId, message: impl Into<String>) -> Option<u64> {
        self.append(task_id, None, ProgressLevel::Warn, message.into())
    }

    /// 发布出错哨兵事件；之后该任务不再接受更新
    pub fn publish_error(&self, task_id: TaskId, message: impl Into<String>) -> Option<u64> {
        self.append(
            task_id,
            Some(PERCENT_ERRORED),
            ProgressLevel::Info,
            message.into(),
        )
    }

    fn append(
        &self,
        task_id: TaskId,
        percentage: Option<i8>,
        level: ProgressLevel,
        message: String,
    ) -> Option<u64> {
        let config = &self.inner.config;
        let mut channel = self
            .inner
            .channels
            .entry(task_id)
            .or_insert_with(TaskChannel::new);

        if channel.closed_at.is_some() || channel.errored {
            tracing::debug!(
                task_id = %task_id,
                message = %message,
                "Progress update after terminal event dropped"
            );
            return None;
        }

        let percentage = match percentage {
            Some(PERCENT_ERRORED) => {
                channel.errored = true;
                PERCENT_ERRORED
            }
            Some(p) => {
                let clamped = p.clamp(0, 100).max(channel.last_percentage);
                if clamped != p {
                    tracing::debug!(
                        task_id = %task_id,
                        requested = p,
                        published = clamped,
                        "Progress percentage adjusted to stay monotonic"
                    );
                }
                clamped
            }
            None => channel.last_percentage,
        };
        if percentage != PERCENT_ERRORED {
            channel.last_percentage = percentage;
        }

        let sequence = channel.next_sequence;
        channel.next_sequence += 1;
        channel.last_activity = Instant::now();

        let event = ProgressEvent {
            task_id,
            sequence,
            percentage,
            level,
            message,
            timestamp: Utc::now(),
        };

        channel.history.push_back(event.clone());
        while channel.history.len() > config.history_limit {
            channel.history.pop_front();
        }

        channel.subscribers.retain(|(id, sender)| match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    task_id = %task_id,
                    subscriber_id = *id,
                    "Progress subscriber lagging, disconnecting"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });

        Some(sequence)
    }

    /// 订阅任务进度：先回放历史，再推送实时事件
    pub fn subscribe(&self, task_id: TaskId) -> Subscription {
        let subscriber_id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let mut channel = self
            .inner
            .channels
            .entry(task_id)
            .or_insert_with(TaskChannel::new);

        let capacity = channel.history.len() + self.inner.config.subscriber_buffer.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        for event in channel.history.iter() {
            // 容量已覆盖全部历史
            let _ = tx.try_send(event.clone());
        }

        if channel.closed_at.is_none() {
            channel.subscribers.push((subscriber_id, tx));
        }
        channel.last_activity = Instant::now();

        tracing::debug!(
            task_id = %task_id,
            subscriber_id = subscriber_id,
            replayed = channel.history.len(),
            closed = channel.closed_at.is_some(),
            "Progress subscriber added"
        );

        Subscription {
            receiver: rx,
            unsubscribe: Unsubscribe {
                tracker: Arc::downgrade(&self.inner),
                task_id,
                subscriber_id,
            },
        }
    }

    /// 标记任务进入终态：关闭所有订阅，开始计算保留期
    pub fn close(&self, task_id: TaskId) {
        let mut channel = self
            .inner
            .channels
            .entry(task_id)
            .or_insert_with(TaskChannel::new);
        if channel.closed_at.is_none() {
            channel.closed_at = Some(Instant::now());
            channel.subscribers.clear();
            tracing::debug!(task_id = %task_id, "Progress channel closed");
        }
    }

    /// 历史事件快照
    pub fn history(&self, task_id: &TaskId) -> Vec<ProgressEvent> {
        self.inner
            .channels
            .get(task_id)
            .map(|c| c.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, task_id: &TaskId) -> usize {
        self.inner
            .channels
            .get(task_id)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    /// 丢弃已过保留期的任务历史，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let retention = self.inner.config.retention;
        let now = Instant::now();
        let before = self.inner.channels.len();
        self.inner
            .channels
            .retain(|_, channel| !channel.expired(retention, now));
        let purged = before.saturating_sub(self.inner.channels.len());
        if purged > 0 {
            tracing::debug!(purged = purged, "Expired progress histories purged");
        }
        purged
    }

    pub fn tracked_tasks(&self) -> usize {
        self.inner.channels.len()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(ProgressTrackerConfig::default())
    }
}
