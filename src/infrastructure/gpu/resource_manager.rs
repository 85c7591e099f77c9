//! GPU Resource Manager - 单 GPU 准入控制
//!
//! 两个维度同时约束：
//! - 每个独占类别一个 FIFO 信号量（容量 = max_concurrent）
//! - 全局显存预算计数器（一把锁保护，与类别占用计数同步更新）
//!
//! 获取顺序：先拿信号量 permit，再尝试预留显存；显存不足时立即归还 permit，
//! 等待显存释放通知后重新排队，避免占着并发名额饿死同类别的其他等待者。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::application::{CallContext, DoneReason};
use crate::domain::task::TaskId;

/// Resource Manager 错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("Unregistered exclusivity class: {0}")]
    InvalidClass(String),

    #[error("Deadline exceeded while waiting for a {class} slot (cancelled: {cancelled})")]
    DeadlineExceeded { class: String, cancelled: bool },

    #[error("Requested {requested} bytes of VRAM exceeds the whole budget of {budget} bytes")]
    ExceedsBudget { requested: u64, budget: u64 },

    #[error("Resource manager closed")]
    Closed,
}

/// 单个类别的使用情况
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassUtilization {
    pub class: String,
    pub max_concurrent: usize,
    pub in_use: usize,
    pub available: usize,
    pub vram_bytes: u64,
}

/// 资源使用快照，仅用于观测，不参与准入决策
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UtilizationSnapshot {
    pub vram_budget: u64,
    pub vram_in_use: u64,
    pub classes: Vec<ClassUtilization>,
}

impl UtilizationSnapshot {
    pub fn class(&self, class: &str) -> Option<&ClassUtilization> {
        self.classes.iter().find(|c| c.class == class)
    }
}

struct ClassSlot {
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
}

#[derive(Default)]
struct ClassUsage {
    in_use: usize,
    vram_bytes: u64,
}

#[derive(Default)]
struct Ledger {
    vram_in_use: u64,
    per_class: HashMap<String, ClassUsage>,
}

struct Inner {
    budget: u64,
    classes: HashMap<String, ClassSlot>,
    ledger: Mutex<Ledger>,
    vram_released: Notify,
    next_id: AtomicU64,
}

impl Inner {
    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        // 临界区内不会 panic，中毒时沿用内部数据
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, reservation: &Reservation) {
        if reservation.released.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                reservation_id = reservation.id,
                task_id = %reservation.task_id,
                class = %reservation.class,
                "Reservation already released, ignoring"
            );
            return;
        }

        {
            let mut ledger = self.ledger();
            ledger.vram_in_use = ledger.vram_in_use.saturating_sub(reservation.vram_bytes);
            if let Some(usage) = ledger.per_class.get_mut(&reservation.class) {
                usage.in_use = usage.in_use.saturating_sub(1);
                usage.vram_bytes = usage.vram_bytes.saturating_sub(reservation.vram_bytes);
            }
            // permit 与显存计数在同一临界区内归还
            drop(
                reservation
                    .permit
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take(),
            );
        }

        self.vram_released.notify_waiters();

        tracing::debug!(
            reservation_id = reservation.id,
            task_id = %reservation.task_id,
            class = %reservation.class,
            vram_bytes = reservation.vram_bytes,
            "GPU slot released"
        );
    }
}

/// GPU slot 预留
///
/// 由一个任务的一次阶段调用独占；drop 时自动释放
pub struct Reservation {
    id: u64,
    class: String,
    task_id: TaskId,
    vram_bytes: u64,
    acquired_at: DateTime<Utc>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    released: AtomicBool,
    owner: Weak<Inner>,
}

impl Reservation {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn exclusivity_class(&self) -> &str {
        &self.class
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn vram_bytes(&self) -> u64 {
        self.vram_bytes
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("task_id", &self.task_id)
            .field("vram_bytes", &self.vram_bytes)
            .field("acquired_at", &self.acquired_at)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(inner) = self.owner.upgrade() {
            inner.release(self);
        }
    }
}

/// GPU Resource Manager
///
/// 通过构造函数注入到各组件，内部自带同步，可在测试中创建多个独立实例
#[derive(Clone)]
pub struct GpuResourceManager {
    inner: Arc<Inner>,
}

impl GpuResourceManager {
    /// 创建 Resource Manager
    ///
    /// `class_limits`: 独占类别 -> max_concurrent
    pub fn new(vram_budget: u64, class_limits: BTreeMap<String, usize>) -> Self {
        let mut classes = HashMap::with_capacity(class_limits.len());
        let mut per_class = HashMap::with_capacity(class_limits.len());
        for (class, max_concurrent) in class_limits {
            let max_concurrent = max_concurrent.max(1);
            per_class.insert(class.clone(), ClassUsage::default());
            classes.insert(
                class,
                ClassSlot {
                    max_concurrent,
                    semaphore: Arc::new(Semaphore::new(max_concurrent)),
                },
            );
        }

        tracing::info!(
            vram_budget = vram_budget,
            classes = classes.len(),
            "GpuResourceManager initialized"
        );

        Self {
            inner: Arc::new(Inner {
                budget: vram_budget,
                classes,
                ledger: Mutex::new(Ledger {
                    vram_in_use: 0,
                    per_class,
                }),
                vram_released: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn vram_budget(&self) -> u64 {
        self.inner.budget
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.inner.classes.contains_key(class)
    }

    /// 获取一个 GPU slot
    ///
    /// 阻塞直到类别并发与显存预算同时满足；ctx 取消或到期返回 `DeadlineExceeded`
    pub async fn acquire(
        &self,
        class: &str,
        vram_bytes: u64,
        task_id: TaskId,
        ctx: &CallContext,
    ) -> Result<Reservation, ResourceError> {
        let slot = self
            .inner
            .classes
            .get(class)
            .ok_or_else(|| ResourceError::InvalidClass(class.to_string()))?;

        if vram_bytes > self.inner.budget {
            return Err(ResourceError::ExceedsBudget {
                requested: vram_bytes,
                budget: self.inner.budget,
            });
        }

        let deadline_err = |reason: DoneReason| ResourceError::DeadlineExceeded {
            class: class.to_string(),
            cancelled: reason == DoneReason::Cancelled,
        };

        if ctx.is_cancelled() {
            return Err(deadline_err(DoneReason::Cancelled));
        }

        loop {
            let permit = tokio::select! {
                biased;
                reason = ctx.done() => return Err(deadline_err(reason)),
                permit = slot.semaphore.clone().acquire_owned() => {
                    permit.map_err(|_| ResourceError::Closed)?
                }
            };

            // 先登记通知，再检查显存，避免错过检查与等待之间的释放
            let notified = self.inner.vram_released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_admit(class, vram_bytes, task_id, permit) {
                Ok(reservation) => return Ok(reservation),
                Err(permit) => drop(permit),
            }

            tracing::debug!(
                task_id = %task_id,
                class = %class,
                vram_bytes = vram_bytes,
                "VRAM insufficient, waiting for release"
            );

            tokio::select! {
                biased;
                reason = ctx.done() => return Err(deadline_err(reason)),
                _ = &mut notified => {}
            }
        }
    }

    fn try_admit(
        &self,
        class: &str,
        vram_bytes: u64,
        task_id: TaskId,
        permit: OwnedSemaphorePermit,
    ) -> Result<Reservation, OwnedSemaphorePermit> {
        let mut ledger = self.inner.ledger();
        if ledger.vram_in_use + vram_bytes > self.inner.budget {
            return Err(permit);
        }

        ledger.vram_in_use += vram_bytes;
        let usage = ledger.per_class.entry(class.to_string()).or_default();
        usage.in_use += 1;
        usage.vram_bytes += vram_bytes;

        let reservation = Reservation {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            class: class.to_string(),
            task_id,
            vram_bytes,
            acquired_at: Utc::now(),
            permit: Mutex::new(Some(permit)),
            released: AtomicBool::new(false),
            owner: Arc::downgrade(&self.inner),
        };

        tracing::debug!(
            reservation_id = reservation.id,
            task_id = %task_id,
            class = %class,
            vram_bytes = vram_bytes,
            vram_in_use = ledger.vram_in_use,
            "GPU slot acquired"
        );
        Ok(reservation)
    }

    /// 释放 reservation；重复释放为 no-op
    pub fn release(&self, reservation: &Reservation) {
        if !Weak::ptr_eq(&reservation.owner, &Arc::downgrade(&self.inner)) {
            tracing::warn!(
                reservation_id = reservation.id,
                "Reservation belongs to another resource manager, ignoring"
            );
            return;
        }
        self.inner.release(reservation);
    }

    /// 当前使用情况快照
    pub fn utilization(&self) -> UtilizationSnapshot {
        let ledger = self.inner.ledger();
        let mut classes: Vec<ClassUtilization> = self
            .inner
            .classes
            .iter()
            .map(|(class, slot)| {
                let (in_use, vram_bytes) = ledger
                    .per_class
                    .get(class)
                    .map(|u| (u.in_use, u.vram_bytes))
                    .unwrap_or((0, 0));
                ClassUtilization {
                    class: class.clone(),
                    max_concurrent: slot.max_concurrent,
                    in_use,
                    available: slot.max_concurrent.saturating_sub(in_use),
                    vram_bytes,
                }
            })
            .collect();
        classes.sort_by(|a, b| a.class.cmp(&b.class));

        UtilizationSnapshot {
            vram_budget: self.inner.budget,
            vram_in_use: ledger.vram_in_use,
            classes,
        }
    }
}
