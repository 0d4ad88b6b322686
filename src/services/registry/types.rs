use crate::services::instance::{InstanceDescriptor, InstanceKey, InstanceStatus};

// 单个服务名下的实例集合，顺序即发现顺序
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegistryEntry {
    pub service_name: String,
    pub instances: Vec<InstanceDescriptor>,
}

impl RegistryEntry {
    pub fn new(service_name: impl Into<String>, instances: Vec<InstanceDescriptor>) -> Self {
        Self {
            service_name: service_name.into(),
            instances,
        }
    }

    pub fn empty(service_name: impl Into<String>) -> Self {
        Self::new(service_name, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn get(&self, instance_id: &str) -> Option<&InstanceDescriptor> {
        self.instances
            .iter()
            .find(|instance| instance.instance_id() == instance_id)
    }

    pub fn up_instances(&self) -> impl Iterator<Item = &InstanceDescriptor> {
        self.instances
            .iter()
            .filter(|instance| instance.status() == InstanceStatus::Up)
    }

    /// 新实例追加到末尾，已有实例整体替换
    pub(crate) fn upsert(&mut self, instance: InstanceDescriptor) {
        match self
            .instances
            .iter_mut()
            .find(|existing| existing.instance_id() == instance.instance_id())
        {
            Some(existing) => *existing = instance,
            None => self.instances.push(instance),
        }
    }

    /// 只覆盖可变字段；本地不存在时按新增处理
    pub(crate) fn merge_change(&mut self, changed: InstanceDescriptor) {
        match self
            .instances
            .iter_mut()
            .find(|existing| existing.instance_id() == changed.instance_id())
        {
            Some(existing) => existing.apply_mutable_fields(&changed),
            None => self.instances.push(changed),
        }
    }

    pub(crate) fn remove(&mut self, instance_id: &str) -> Option<InstanceDescriptor> {
        let idx = self
            .instances
            .iter()
            .position(|instance| instance.instance_id() == instance_id)?;
        Some(self.instances.remove(idx))
    }
}

/// 全量拉取结果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegistrySnapshot {
    pub version: u64,
    pub instances: Vec<InstanceDescriptor>,
}

/// 增量拉取结果：from_version -> version 之间的变更
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchDelta {
    pub from_version: u64,
    pub version: u64,
    pub added: Vec<InstanceDescriptor>,
    pub changed: Vec<InstanceDescriptor>,
    pub removed: Vec<InstanceKey>,
}
