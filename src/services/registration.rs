use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{DiscoveryError, Result};
use crate::services::event::{ClientEventKind, EventBus};
use crate::services::heartbeat::{FailureCallback, HeartbeatFailure, HeartbeatSender};
use crate::services::instance::{InstanceDescriptor, InstanceStatus};
use crate::services::registry::transport::with_timeout;
use crate::services::registry::RegistryTransport;

// 注册管理器配置
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    pub heartbeat_interval: Duration,
    pub call_timeout: Duration,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
enum LocalRegistration {
    // 注册请求尚未完成，占住实例ID防止并发重复注册
    Pending { epoch: u64 },
    Active {
        epoch: u64,
        descriptor: InstanceDescriptor,
        // 重新注册失败后租约已丢失，心跳不再运行
        lease_lost: bool,
    },
}

impl LocalRegistration {
    fn epoch(&self) -> u64 {
        match self {
            LocalRegistration::Pending { epoch } | LocalRegistration::Active { epoch, .. } => *epoch,
        }
    }

    fn descriptor(&self) -> Option<&InstanceDescriptor> {
        match self {
            LocalRegistration::Active { descriptor, .. } => Some(descriptor),
            LocalRegistration::Pending { .. } => None,
        }
    }
}

/// 注册管理器：负责本地实例的注册、状态更新与注销，并驱动心跳
///
/// 每次注册占位都带一个递增的 epoch。注册请求或重新注册完成时，只有槽位仍是
/// 同一个 epoch 才会生效；否则说明期间实例已被注销，需要撤回注册中心上的登记。
#[derive(Debug, Clone)]
pub struct RegistrationManager {
    transport: Arc<dyn RegistryTransport>,
    heartbeat: HeartbeatSender,
    events: EventBus,
    config: RegistrationConfig,
    // 实例ID -> 本地注册信息
    instances: Arc<DashMap<String, LocalRegistration>>,
    epoch: Arc<AtomicU64>,
    // 进行中的注册请求与重新注册任务
    task_tracker: TaskTracker,
    closing: CancellationToken,
}

impl RegistrationManager {
    pub fn new(
        transport: Arc<dyn RegistryTransport>,
        heartbeat: HeartbeatSender,
        events: EventBus,
        config: RegistrationConfig,
    ) -> Self {
        Self {
            transport,
            heartbeat,
            events,
            config,
            instances: Arc::new(DashMap::new()),
            epoch: Arc::new(AtomicU64::new(0)),
            task_tracker: TaskTracker::new(),
            closing: CancellationToken::new(),
        }
    }

    pub fn heartbeat(&self) -> &HeartbeatSender {
        &self.heartbeat
    }

    /// 注册实例，成功后开始心跳
    pub async fn register(&self, descriptor: InstanceDescriptor) -> Result<()> {
        let instance_id = descriptor.instance_id().to_string();
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        match self.instances.entry(instance_id.clone()) {
            Entry::Occupied(_) => {
                return Err(DiscoveryError::DuplicateInstance { instance_id });
            }
            Entry::Vacant(slot) => {
                slot.insert(LocalRegistration::Pending { epoch });
            }
        }
        // 占位之后再检查，关闭流程要么看到这个占位，要么这里看到关闭
        if self.closing.is_cancelled() {
            self.release(&instance_id, epoch);
            return Err(DiscoveryError::Stopped);
        }
        let _inflight = self.task_tracker.token();

        let result = with_timeout(
            self.config.call_timeout,
            self.transport.register_instance(&descriptor),
        )
        .await;

        match result {
            Ok(()) => {
                if !self.activate(epoch, &descriptor) {
                    tracing::warn!(
                        service_name = %descriptor.service_name(),
                        instance_id = %instance_id,
                        "Instance deregistered while registration was in flight, withdrawing"
                    );
                    self.withdraw(&descriptor).await;
                    return Err(DiscoveryError::Cancelled { instance_id });
                }
                tracing::info!(
                    service_name = %descriptor.service_name(),
                    instance_id = %instance_id,
                    address = %descriptor.address(),
                    status = %descriptor.status(),
                    "Instance registered"
                );
                self.events.publish(ClientEventKind::Registered {
                    service_name: descriptor.service_name().to_string(),
                    instance_id,
                });
                Ok(())
            }
            Err(e) => {
                self.release(&instance_id, epoch);
                tracing::error!(
                    service_name = %descriptor.service_name(),
                    instance_id = %instance_id,
                    error = %e,
                    "Instance registration failed"
                );
                self.events.publish(ClientEventKind::RegistrationFailed {
                    service_name: descriptor.service_name().to_string(),
                    instance_id,
                    reason: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// 注销实例；未知实例视为已注销，直接返回成功
    ///
    /// 注册请求尚未完成时只释放占位，请求返回后由注册方撤回登记。
    pub async fn deregister(&self, instance_id: &str) -> Result<()> {
        let descriptor = match self.instances.remove(instance_id) {
            Some((_, LocalRegistration::Active { descriptor, .. })) => descriptor,
            Some((_, LocalRegistration::Pending { .. })) => {
                tracing::debug!(instance_id = %instance_id, "Deregistered while registration in flight");
                return Ok(());
            }
            None => {
                tracing::debug!(instance_id = %instance_id, "Deregister of unknown instance ignored");
                return Ok(());
            }
        };

        let key = descriptor.key();
        let result = with_timeout(self.config.call_timeout, self.transport.deregister_instance(&key)).await;
        match &result {
            Ok(()) => {
                tracing::info!(
                    service_name = %key.service_name,
                    instance_id = %key.instance_id,
                    "Instance deregistered"
                );
                self.events.publish(ClientEventKind::Deregistered {
                    service_name: key.service_name.clone(),
                    instance_id: key.instance_id.clone(),
                });
            }
            Err(e) => {
                tracing::warn!(
                    service_name = %key.service_name,
                    instance_id = %key.instance_id,
                    error = %e,
                    "Deregister request failed, lease will expire on the registry"
                );
            }
        }

        // 注销请求发出后再停止心跳
        self.heartbeat.stop(instance_id);
        result.map_err(DiscoveryError::from)
    }

    /// 注销全部实例（包括注册中的占位），并等待进行中的注册与重新注册结束
    ///
    /// 调用后管理器不再接受新的注册，也不再处理心跳失败。
    pub async fn shutdown(&self) {
        self.closing.cancel();
        let ids: Vec<String> = self.instances.iter().map(|entry| entry.key().clone()).collect();
        for instance_id in ids {
            if let Err(e) = self.deregister(&instance_id).await {
                tracing::warn!(instance_id = %instance_id, error = %e, "Deregister during shutdown failed");
            }
        }
        self.task_tracker.close();
        self.task_tracker.wait().await;
    }

    /// 更新本地状态并尽力通知注册中心；通知失败只记录日志
    ///
    /// 实例因重新注册失败被标记为 DOWN 后，切换到非 DOWN 状态会重新注册并恢复心跳，
    /// 此时注册失败会回退为 DOWN 并返回错误。
    pub async fn update_status(&self, instance_id: &str, status: InstanceStatus) -> Result<()> {
        let (key, restore) = {
            let unknown = || DiscoveryError::UnknownInstance {
                instance_id: instance_id.to_string(),
            };
            let mut entry = self.instances.get_mut(instance_id).ok_or_else(unknown)?;
            let LocalRegistration::Active {
                epoch,
                descriptor,
                lease_lost,
            } = entry.value_mut()
            else {
                return Err(unknown());
            };
            let current = descriptor.status();
            if !current.can_transition_to(status) {
                return Err(DiscoveryError::Validation(format!(
                    "illegal status transition {current} -> {status}"
                )));
            }
            descriptor.set_status(status);
            let restore = (*lease_lost && status != InstanceStatus::Down).then(|| (*epoch, descriptor.clone()));
            (descriptor.key(), restore)
        };

        tracing::info!(
            service_name = %key.service_name,
            instance_id = %key.instance_id,
            new_status = %status,
            "Updated local instance status"
        );

        if let Some((epoch, descriptor)) = restore {
            return self.restore_lease(epoch, descriptor).await;
        }

        if let Err(e) = with_timeout(self.config.call_timeout, self.transport.update_status(&key, status)).await {
            tracing::warn!(
                service_name = %key.service_name,
                instance_id = %key.instance_id,
                error = %e,
                "Failed to report status to registry"
            );
        }
        Ok(())
    }

    pub fn instance(&self, instance_id: &str) -> Option<InstanceDescriptor> {
        self.instances.get(instance_id)?.value().descriptor().cloned()
    }

    pub fn registered_instances(&self) -> Vec<InstanceDescriptor> {
        let mut instances: Vec<InstanceDescriptor> = self
            .instances
            .iter()
            .filter_map(|entry| entry.value().descriptor().cloned())
            .collect();
        instances.sort_by(|a, b| a.instance_id().cmp(b.instance_id()));
        instances
    }

    // 只释放自己的占位
    fn release(&self, instance_id: &str, epoch: u64) {
        self.instances
            .remove_if(instance_id, |_, registration| registration.epoch() == epoch);
    }

    // 占位仍属于本次注册时转为 Active 并开始心跳；持有槽位锁期间启动心跳，
    // 并发的 deregister 要么先移除槽位，要么之后停止这里启动的心跳
    fn activate(&self, epoch: u64, descriptor: &InstanceDescriptor) -> bool {
        let Some(mut entry) = self.instances.get_mut(descriptor.instance_id()) else {
            return false;
        };
        if !matches!(entry.value(), LocalRegistration::Pending { epoch: current } if *current == epoch) {
            return false;
        }
        *entry.value_mut() = LocalRegistration::Active {
            epoch,
            descriptor: descriptor.clone(),
            lease_lost: false,
        };
        self.heartbeat
            .start(descriptor, self.config.heartbeat_interval, self.failure_callback());
        true
    }

    // 重新注册成功后恢复心跳，要求实例仍是同一次注册
    fn resume_heartbeat(&self, epoch: u64, descriptor: &InstanceDescriptor) -> bool {
        let Some(mut entry) = self.instances.get_mut(descriptor.instance_id()) else {
            return false;
        };
        let LocalRegistration::Active {
            epoch: current,
            lease_lost,
            ..
        } = entry.value_mut()
        else {
            return false;
        };
        if *current != epoch {
            return false;
        }
        *lease_lost = false;
        self.heartbeat
            .start(descriptor, self.config.heartbeat_interval, self.failure_callback());
        true
    }

    fn mark_lease_lost(&self, epoch: u64, instance_id: &str) {
        if let Some(mut entry) = self.instances.get_mut(instance_id) {
            if let LocalRegistration::Active {
                epoch: current,
                descriptor,
                lease_lost,
            } = entry.value_mut()
            {
                if *current == epoch {
                    descriptor.set_status(InstanceStatus::Down);
                    *lease_lost = true;
                }
            }
        }
    }

    // 撤回已写入注册中心但本地已注销的登记
    async fn withdraw(&self, descriptor: &InstanceDescriptor) {
        let key = descriptor.key();
        if let Err(e) = with_timeout(self.config.call_timeout, self.transport.deregister_instance(&key)).await {
            tracing::warn!(
                service_name = %key.service_name,
                instance_id = %key.instance_id,
                error = %e,
                "Failed to withdraw registration, lease will expire on the registry"
            );
        }
    }

    async fn restore_lease(&self, epoch: u64, descriptor: InstanceDescriptor) -> Result<()> {
        let _inflight = self.task_tracker.token();
        let key = descriptor.key();
        match with_timeout(self.config.call_timeout, self.transport.register_instance(&descriptor)).await {
            Ok(()) => {
                if !self.resume_heartbeat(epoch, &descriptor) {
                    self.withdraw(&descriptor).await;
                    return Err(DiscoveryError::Cancelled {
                        instance_id: key.instance_id,
                    });
                }
                tracing::info!(
                    service_name = %key.service_name,
                    instance_id = %key.instance_id,
                    status = %descriptor.status(),
                    "Lease restored, heartbeat resumed"
                );
                self.events.publish(ClientEventKind::Reregistered {
                    service_name: key.service_name,
                    instance_id: key.instance_id,
                });
                Ok(())
            }
            Err(e) => {
                self.mark_lease_lost(epoch, &key.instance_id);
                tracing::warn!(
                    service_name = %key.service_name,
                    instance_id = %key.instance_id,
                    error = %e,
                    "Failed to restore lease, instance stays DOWN"
                );
                Err(e.into())
            }
        }
    }

    fn failure_callback(&self) -> FailureCallback {
        let manager = self.clone();
        Arc::new(move |failure: HeartbeatFailure| {
            if manager.closing.is_cancelled() {
                return;
            }
            // 回调运行在心跳任务里，重新注册放到受跟踪的独立任务中
            let manager = manager.clone();
            let tracker = manager.task_tracker.clone();
            tracker.spawn(async move {
                manager.handle_heartbeat_failure(failure).await;
            });
        })
    }

    async fn handle_heartbeat_failure(&self, failure: HeartbeatFailure) {
        let key = failure.key;
        self.events.publish(ClientEventKind::HeartbeatThresholdExceeded {
            service_name: key.service_name.clone(),
            instance_id: key.instance_id.clone(),
            consecutive_failures: failure.consecutive_failures,
        });

        // 心跳失败期间实例可能已被注销
        let Some((epoch, descriptor)) = self.instances.get(&key.instance_id).and_then(|entry| {
            let registration = entry.value();
            registration
                .descriptor()
                .map(|descriptor| (registration.epoch(), descriptor.clone()))
        }) else {
            return;
        };
        if self.closing.is_cancelled() {
            return;
        }

        tracing::warn!(
            service_name = %key.service_name,
            instance_id = %key.instance_id,
            consecutive_failures = failure.consecutive_failures,
            last_error = %failure.last_error,
            "Heartbeat failure threshold exceeded, attempting re-registration"
        );

        let result = with_timeout(
            self.config.call_timeout,
            self.transport.register_instance(&descriptor),
        )
        .await;

        match result {
            Ok(()) => {
                // 重新注册期间被注销：撤回刚恢复的登记
                if !self.resume_heartbeat(epoch, &descriptor) {
                    tracing::info!(
                        service_name = %key.service_name,
                        instance_id = %key.instance_id,
                        "Instance deregistered during re-registration, withdrawing"
                    );
                    self.withdraw(&descriptor).await;
                    return;
                }
                tracing::info!(
                    service_name = %key.service_name,
                    instance_id = %key.instance_id,
                    "Instance re-registered after heartbeat failure"
                );
                self.events.publish(ClientEventKind::Reregistered {
                    service_name: key.service_name,
                    instance_id: key.instance_id,
                });
            }
            Err(e) => {
                self.mark_lease_lost(epoch, &key.instance_id);
                tracing::error!(
                    service_name = %key.service_name,
                    instance_id = %key.instance_id,
                    error = %e,
                    "Re-registration failed, instance marked DOWN"
                );
                self.events.publish(ClientEventKind::InstanceMarkedDown {
                    service_name: key.service_name,
                    instance_id: key.instance_id,
                    reason: e.to_string(),
                });
            }
        }
    }
}
