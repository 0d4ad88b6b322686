use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::services::instance::InstanceDescriptor;
use crate::services::registry::RegistryEntry;

/// 本地发现缓存
///
/// 每个服务名对应一份不可变快照，更新时整体替换 `Arc`，读者要么看到旧快照
/// 要么看到新快照。读操作只访问内存。
#[derive(Debug, Clone, Default)]
pub struct LocalDiscoveryCache {
    // 服务名 -> 实例快照
    entries: Arc<DashMap<String, Arc<RegistryEntry>>>,
    // 服务名 -> 轮询游标
    cursors: Arc<DashMap<String, Arc<AtomicUsize>>>,
}

impl LocalDiscoveryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取服务的实例快照，未知服务返回空集合
    pub fn get(&self, service_name: &str) -> Arc<RegistryEntry> {
        self.entries
            .get(service_name)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| Arc::new(RegistryEntry::empty(service_name)))
    }

    /// 替换服务的实例集合；空集合表示服务已不存在
    pub fn apply_update(&self, service_name: &str, entry: RegistryEntry) {
        if entry.is_empty() {
            if self.entries.remove(service_name).is_some() {
                tracing::debug!(service_name = %service_name, "Removed service from discovery cache");
            }
            self.cursors.remove(service_name);
            return;
        }

        tracing::debug!(
            service_name = %service_name,
            instance_count = entry.len(),
            "Updated discovery cache"
        );
        self.entries.insert(service_name.to_string(), Arc::new(entry));
    }

    /// 当前已知的服务名，按字典序排列
    pub fn all_service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// 在服务的 UP 实例间轮询
    pub fn next_up_instance(&self, service_name: &str) -> Option<InstanceDescriptor> {
        let entry = self.get(service_name);
        let up: Vec<&InstanceDescriptor> = entry.up_instances().collect();
        if up.is_empty() {
            return None;
        }

        let cursor = self
            .cursors
            .entry(service_name.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        let idx = cursor.fetch_add(1, Ordering::Relaxed);
        Some(up[idx % up.len()].clone())
    }

    /// 所有服务的实例总数
    pub fn instance_count(&self) -> usize {
        self.entries.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
