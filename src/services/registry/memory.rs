use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::transport::{RegistryTransport, TransportError};
use super::types::{FetchDelta, RegistrySnapshot};
use crate::services::instance::{InstanceDescriptor, InstanceKey, InstanceStatus};

/// 内存注册中心配置
#[derive(Debug, Clone)]
pub struct InMemoryRegistryConfig {
    /// 租约时长，超过该时长未续约的实例会被剔除
    pub lease_duration: Duration,
    /// 保留的变更记录条数，决定增量拉取能回溯多远
    pub change_log_retention: usize,
}

impl Default for InMemoryRegistryConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(90),
            change_log_retention: 1000,
        }
    }
}

#[derive(Debug, Clone)]
struct Lease {
    instance: InstanceDescriptor,
    last_renewal: Instant,
}

#[derive(Debug, Clone)]
enum Change {
    Added(InstanceKey),
    Changed(InstanceKey),
    Removed(InstanceKey),
}

impl Change {
    fn key(&self) -> &InstanceKey {
        match self {
            Change::Added(key) | Change::Changed(key) | Change::Removed(key) => key,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    version: u64,
    leases: BTreeMap<InstanceKey, Lease>,
    // (版本号, 变更)，版本号严格递增
    changes: VecDeque<(u64, Change)>,
}

/// 单节点内存注册中心
///
/// 不做复制，只用于测试和本地运行；行为与远端注册中心的传输语义保持一致。
#[derive(Debug, Clone)]
pub struct InMemoryRegistry {
    state: Arc<Mutex<RegistryState>>,
    config: InMemoryRegistryConfig,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new(InMemoryRegistryConfig::default())
    }
}

impl InMemoryRegistry {
    pub fn new(config: InMemoryRegistryConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState::default())),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // 锁内不会 panic，中毒时直接沿用内部数据
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, state: &mut RegistryState, change: Change) -> u64 {
        state.version += 1;
        let version = state.version;
        state.changes.push_back((version, change));
        while state.changes.len() > self.config.change_log_retention {
            state.changes.pop_front();
        }
        version
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    pub fn instance_count(&self) -> usize {
        self.lock().leases.len()
    }

    pub fn get(&self, key: &InstanceKey) -> Option<InstanceDescriptor> {
        self.lock().leases.get(key).map(|lease| lease.instance.clone())
    }

    // 剔除租约过期的实例
    pub fn evict_expired(&self) -> Vec<InstanceKey> {
        let now = Instant::now();
        let timeout = self.config.lease_duration;
        let mut state = self.lock();

        let expired: Vec<InstanceKey> = state
            .leases
            .iter()
            .filter(|(_, lease)| now.duration_since(lease.last_renewal) > timeout)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.leases.remove(key);
            let version = self.record(&mut state, Change::Removed(key.clone()));
            tracing::warn!(
                service_name = %key.service_name,
                instance_id = %key.instance_id,
                version,
                lease_secs = timeout.as_secs(),
                "Instance lease expired, removing from registry"
            );
        }

        expired
    }

    /// 启动定期剔除任务，取消 token 后退出
    pub fn spawn_eviction_task(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tracing::debug!("Executing lease expiration check...");
                let expired = registry.evict_expired();
                if !expired.is_empty() {
                    tracing::info!(expired_count = expired.len(), "Lease eviction completed");
                }
            }
        })
    }
}

#[async_trait]
impl RegistryTransport for InMemoryRegistry {
    async fn register_instance(&self, instance: &InstanceDescriptor) -> Result<(), TransportError> {
        let key = instance.key();
        let mut state = self.lock();
        let lease = Lease {
            instance: instance.clone(),
            last_renewal: Instant::now(),
        };
        let change = if state.leases.insert(key.clone(), lease).is_some() {
            Change::Changed(key.clone())
        } else {
            Change::Added(key.clone())
        };
        let version = self.record(&mut state, change);

        tracing::info!(
            service_name = %key.service_name,
            instance_id = %key.instance_id,
            address = %instance.address(),
            version,
            "Registering instance"
        );
        Ok(())
    }

    async fn renew_lease(&self, key: &InstanceKey) -> Result<(), TransportError> {
        let mut state = self.lock();
        match state.leases.get_mut(key) {
            Some(lease) => {
                lease.last_renewal = Instant::now();
                lease.instance.touch();
                Ok(())
            }
            None => Err(TransportError::NotFound(key.to_string())),
        }
    }

    async fn deregister_instance(&self, key: &InstanceKey) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.leases.remove(key).is_some() {
            let version = self.record(&mut state, Change::Removed(key.clone()));
            tracing::info!(
                service_name = %key.service_name,
                instance_id = %key.instance_id,
                version,
                "Deregistered instance"
            );
        }
        Ok(())
    }

    async fn update_status(
        &self,
        key: &InstanceKey,
        status: InstanceStatus,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        let Some(lease) = state.leases.get_mut(key) else {
            return Err(TransportError::NotFound(key.to_string()));
        };
        if lease.instance.status() == status {
            return Ok(());
        }
        lease.instance.set_status(status);
        self.record(&mut state, Change::Changed(key.clone()));
        Ok(())
    }

    async fn current_version(&self) -> Result<u64, TransportError> {
        Ok(self.lock().version)
    }

    async fn fetch_full_registry(&self) -> Result<RegistrySnapshot, TransportError> {
        let state = self.lock();
        Ok(RegistrySnapshot {
            version: state.version,
            instances: state
                .leases
                .values()
                .map(|lease| lease.instance.clone())
                .collect(),
        })
    }

    async fn fetch_delta(&self, since_version: u64) -> Result<FetchDelta, TransportError> {
        let state = self.lock();
        let current = state.version;
        let gap = TransportError::VersionGap {
            requested: since_version,
            current,
        };

        if since_version > current {
            return Err(gap);
        }
        if since_version == current {
            return Ok(FetchDelta {
                from_version: since_version,
                version: current,
                ..FetchDelta::default()
            });
        }
        // 变更记录必须覆盖 since_version + 1 起的每个版本
        match state.changes.front() {
            Some((oldest, _)) if *oldest <= since_version + 1 => {}
            _ => return Err(gap),
        }

        // 每个 key 只报告净结果：窗口内首次出现为新增则报 added
        let mut touched: Vec<(InstanceKey, bool)> = Vec::new();
        for (version, change) in &state.changes {
            if *version <= since_version {
                continue;
            }
            let key = change.key();
            if !touched.iter().any(|(k, _)| k == key) {
                touched.push((key.clone(), matches!(change, Change::Added(_))));
            }
        }

        let mut delta = FetchDelta {
            from_version: since_version,
            version: current,
            ..FetchDelta::default()
        };
        for (key, first_added) in touched {
            match state.leases.get(&key) {
                Some(lease) if first_added => delta.added.push(lease.instance.clone()),
                Some(lease) => delta.changed.push(lease.instance.clone()),
                None => delta.removed.push(key),
            }
        }
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(service: &str, id: &str) -> InstanceDescriptor {
        InstanceDescriptor::builder(service, "127.0.0.1", 9000)
            .instance_id(id)
            .status(InstanceStatus::Up)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_bumps_version_and_snapshot() {
        let registry = InMemoryRegistry::default();
        registry.register_instance(&instance("svc", "a")).await.unwrap();
        registry.register_instance(&instance("svc", "b")).await.unwrap();

        let snapshot = registry.fetch_full_registry().await.unwrap();
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.instances.len(), 2);
    }

    #[tokio::test]
    async fn test_delta_reports_net_changes() {
        let registry = InMemoryRegistry::default();
        registry.register_instance(&instance("svc", "a")).await.unwrap();
        registry.register_instance(&instance("svc", "b")).await.unwrap();
        let since = registry.version();

        registry
            .update_status(&InstanceKey::new("svc", "a"), InstanceStatus::Down)
            .await
            .unwrap();
        registry
            .deregister_instance(&InstanceKey::new("svc", "b"))
            .await
            .unwrap();
        registry.register_instance(&instance("svc", "c")).await.unwrap();

        let delta = registry.fetch_delta(since).await.unwrap();
        assert_eq!(delta.from_version, since);
        assert_eq!(delta.version, since + 3);
        assert_eq!(delta.changed.len(), 1);
        assert_eq!(delta.changed[0].status(), InstanceStatus::Down);
        assert_eq!(delta.removed, vec![InstanceKey::new("svc", "b")]);
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.added[0].instance_id(), "c");
    }

    #[tokio::test]
    async fn test_delta_outside_retention_is_gap() {
        let registry = InMemoryRegistry::new(InMemoryRegistryConfig {
            change_log_retention: 2,
            ..Default::default()
        });
        for id in ["a", "b", "c", "d"] {
            registry.register_instance(&instance("svc", id)).await.unwrap();
        }

        assert!(matches!(
            registry.fetch_delta(0).await,
            Err(TransportError::VersionGap { requested: 0, current: 4 })
        ));
        assert!(registry.fetch_delta(2).await.is_ok());
        assert!(matches!(
            registry.fetch_delta(9).await,
            Err(TransportError::VersionGap { .. })
        ));
    }

    #[tokio::test]
    async fn test_renew_unknown_is_not_found_and_deregister_idempotent() {
        let registry = InMemoryRegistry::default();
        let key = InstanceKey::new("svc", "ghost");
        assert!(matches!(
            registry.renew_lease(&key).await,
            Err(TransportError::NotFound(_))
        ));
        assert!(registry.deregister_instance(&key).await.is_ok());
        assert_eq!(registry.version(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired_leases() {
        let registry = InMemoryRegistry::new(InMemoryRegistryConfig {
            lease_duration: Duration::from_secs(10),
            ..Default::default()
        });
        registry.register_instance(&instance("svc", "a")).await.unwrap();
        registry.register_instance(&instance("svc", "b")).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        registry.renew_lease(&InstanceKey::new("svc", "a")).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        let expired = registry.evict_expired();
        assert_eq!(expired, vec![InstanceKey::new("svc", "b")]);
        assert_eq!(registry.instance_count(), 1);
    }
}
