//! Call Context - 取消与截止时间
//!
//! 每个任务持有一个根 context；每次获取 GPU slot、每次调用模型服务都派生子 context。
//! 取消子 context 不会影响父 context，取消父 context 会级联到所有子 context。

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// context 结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    Cancelled,
    DeadlineExceeded,
}

/// 可取消、可带截止时间的调用上下文
#[derive(Debug, Clone)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// 不会被取消、没有截止时间的根 context
    pub fn background() -> Self {
        Self::new(CancellationToken::new())
    }

    /// 派生子 context，截止时间取父子两者中较早的一个
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// 派生子 context，沿用父 context 的截止时间
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.is_expired()
    }

    /// 距截止时间的剩余时长；无截止时间返回 None
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// 等待 context 结束（取消或到期）
    pub async fn done(&self) -> DoneReason {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => DoneReason::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => DoneReason::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                DoneReason::Cancelled
            }
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_child_cancelled_with_parent() {
        let parent = CallContext::background();
        let child = parent.child_with_timeout(Duration::from_secs(60));
        parent.cancel();
        assert!(child.is_cancelled());
        assert_eq!(child.done().await, DoneReason::Cancelled);
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_propagate_up() {
        let parent = CallContext::background();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let ctx = CallContext::background().child_with_timeout(Duration::from_millis(20));
        assert_eq!(ctx.done().await, DoneReason::DeadlineExceeded);
        assert!(ctx.is_expired());
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_keeps_earlier_parent_deadline() {
        let parent = CallContext::background().child_with_timeout(Duration::from_secs(1));
        let child = parent.child_with_timeout(Duration::from_secs(30));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
