//! Stage Registry - 阶段描述符与客户端注册表
//!
//! 启动时构建一次，之后只读。提交任务时用它校验阶段序列，
//! 构建 GPU Resource Manager 时用它推导每个独占类别的并发上限。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

use crate::application::error::PipelineError;
use crate::application::ports::StageClientPort;
use crate::domain::stage::StageDescriptor;

/// 注册表错误
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Stage already registered: {0}")]
    Duplicate(String),

    #[error("Invalid stage descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Stage {stage} declares class {descriptor} but its client reports {client}")]
    ClassMismatch {
        stage: String,
        descriptor: String,
        client: String,
    },

    #[error("Stage {stage} falls back to unregistered stage {fallback}")]
    UnknownFallback { stage: String, fallback: String },

    #[error("Fallback cycle detected starting at stage {0}")]
    FallbackCycle(String),

    #[error("Stage {stage} and its fallback {fallback} share class {class}")]
    FallbackSharesClass {
        stage: String,
        fallback: String,
        class: String,
    },

    #[error("Class {class} has conflicting max_concurrent: {first} vs {second}")]
    ConflictingClassLimit {
        class: String,
        first: usize,
        second: usize,
    },

    #[error("Stage {stage} needs {bytes} bytes of VRAM, budget is {budget}")]
    ExceedsBudget { stage: String, bytes: u64, budget: u64 },

    #[error("No stages registered")]
    Empty,

    #[error("Failed to create client for stage {stage}: {message}")]
    ClientInit { stage: String, message: String },
}

/// 已注册的阶段
#[derive(Clone)]
pub struct RegisteredStage {
    pub descriptor: StageDescriptor,
    pub client: Arc<dyn StageClientPort>,
}

/// 阶段注册表
#[derive(Default, Clone)]
pub struct StageRegistry {
    stages: HashMap<String, RegisteredStage>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个阶段；描述符的类别必须与客户端元数据一致
    pub fn register(
        &mut self,
        descriptor: StageDescriptor,
        client: Arc<dyn StageClientPort>,
    ) -> Result<(), RegistryError> {
        descriptor
            .validate()
            .map_err(RegistryError::InvalidDescriptor)?;

        let metadata = client.metadata();
        if metadata.exclusivity_class != descriptor.exclusivity_class {
            return Err(RegistryError::ClassMismatch {
                stage: descriptor.name.clone(),
                descriptor: descriptor.exclusivity_class.clone(),
                client: metadata.exclusivity_class,
            });
        }

        if self.stages.contains_key(&descriptor.name) {
            return Err(RegistryError::Duplicate(descriptor.name));
        }

        tracing::debug!(
            stage = %descriptor.name,
            class = %descriptor.exclusivity_class,
            max_concurrent = descriptor.max_concurrent,
            vram_bytes = descriptor.estimated_vram_bytes,
            fallback = ?descriptor.fallback_stage,
            "Stage registered"
        );
        self.stages.insert(
            descriptor.name.clone(),
            RegisteredStage { descriptor, client },
        );
        Ok(())
    }

    /// 全量校验：fallback 存在、无环且与主阶段类别不同；同类别并发上限一致；显存不超预算
    pub fn validate(&self, vram_budget: u64) -> Result<(), RegistryError> {
        if self.stages.is_empty() {
            return Err(RegistryError::Empty);
        }

        for stage in self.stages.values() {
            let desc = &stage.descriptor;
            if desc.estimated_vram_bytes > vram_budget {
                return Err(RegistryError::ExceedsBudget {
                    stage: desc.name.clone(),
                    bytes: desc.estimated_vram_bytes,
                    budget: vram_budget,
                });
            }
            let fallback = match &desc.fallback_stage {
                Some(name) => match self.stages.get(name) {
                    Some(target) => Some(target),
                    None => {
                        return Err(RegistryError::UnknownFallback {
                            stage: desc.name.clone(),
                            fallback: name.clone(),
                        })
                    }
                },
                None => None,
            };
            self.check_fallback_chain(&desc.name)?;

            // 熔断按类别统计，fallback 的成败不能影响主阶段的电路
            if let Some(target) = fallback {
                if target.descriptor.exclusivity_class == desc.exclusivity_class {
                    return Err(RegistryError::FallbackSharesClass {
                        stage: desc.name.clone(),
                        fallback: target.descriptor.name.clone(),
                        class: desc.exclusivity_class.clone(),
                    });
                }
            }
        }

        self.class_limits().map(|_| ())
    }

    fn check_fallback_chain(&self, start: &str) -> Result<(), RegistryError> {
        let mut seen = HashSet::new();
        let mut current = Some(start);
        while let Some(name) = current {
            if !seen.insert(name) {
                return Err(RegistryError::FallbackCycle(start.to_string()));
            }
            current = self
                .stages
                .get(name)
                .and_then(|s| s.descriptor.fallback_stage.as_deref());
        }
        Ok(())
    }

    /// 每个独占类别的并发上限
    pub fn class_limits(&self) -> Result<BTreeMap<String, usize>, RegistryError> {
        let mut limits: BTreeMap<String, usize> = BTreeMap::new();
        for stage in self.stages.values() {
            let desc = &stage.descriptor;
            match limits.get(&desc.exclusivity_class) {
                Some(&existing) if existing != desc.max_concurrent => {
                    return Err(RegistryError::ConflictingClassLimit {
                        class: desc.exclusivity_class.clone(),
                        first: existing,
                        second: desc.max_concurrent,
                    });
                }
                Some(_) => {}
                None => {
                    limits.insert(desc.exclusivity_class.clone(), desc.max_concurrent);
                }
            }
        }
        Ok(limits)
    }

    /// 校验任务请求的阶段序列
    pub fn validate_sequence(&self, stages: &[String]) -> Result<(), PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::invalid_task("stage sequence is empty"));
        }
        for name in stages {
            if !self.stages.contains_key(name) {
                return Err(PipelineError::UnknownStage(name.clone()));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredStage> {
        self.stages.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &StageDescriptor> {
        self.stages.values().map(|s| &s.descriptor)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
