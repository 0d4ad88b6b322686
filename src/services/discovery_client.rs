use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio_stream::Stream;

use crate::config::ClientConfig;
use crate::error::{DiscoveryError, Result};
use crate::services::cache::LocalDiscoveryCache;
use crate::services::event::{ClientEvent, ClientEventKind, EventBus};
use crate::services::fetcher::{RegistryFetcher, UpdateCallback};
use crate::services::heartbeat::HeartbeatSender;
use crate::services::instance::{InstanceDescriptor, InstanceStatus};
use crate::services::registration::RegistrationManager;
use crate::services::registry::{RegistryEntry, RegistryTransport};

/// 客户端生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientState::Created => "CREATED",
            ClientState::Starting => "STARTING",
            ClientState::Running => "RUNNING",
            ClientState::Stopping => "STOPPING",
            ClientState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// 服务发现客户端
///
/// 组合注册管理器、注册表拉取器和本地缓存，统一管理它们的生命周期。
/// 查询只读本地缓存，不会等待网络。
pub struct DiscoveryClient {
    config: ClientConfig,
    events: EventBus,
    cache: LocalDiscoveryCache,
    registration: RegistrationManager,
    fetcher: RegistryFetcher,
    state: watch::Sender<ClientState>,
    // 串行化 start 与 shutdown
    lifecycle: Mutex<()>,
    update_listener: Option<UpdateCallback>,
}

impl fmt::Debug for DiscoveryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryClient")
            .field("state", &self.state())
            .field("registry", &self.config.registry.address)
            .field("services", &self.cache.all_service_names().len())
            .finish()
    }
}

impl DiscoveryClient {
    pub fn new(config: ClientConfig, transport: Arc<dyn RegistryTransport>) -> Self {
        let events = EventBus::new(config.events.clone());
        let heartbeat = HeartbeatSender::new(transport.clone(), config.heartbeat_config(), events.clone());
        let registration = RegistrationManager::new(
            transport.clone(),
            heartbeat,
            events.clone(),
            config.registration_config(),
        );
        let fetcher = RegistryFetcher::new(transport, config.fetcher_config(), events.clone());
        let (state, _) = watch::channel(ClientState::Created);

        Self {
            config,
            events,
            cache: LocalDiscoveryCache::new(),
            registration,
            fetcher,
            state,
            lifecycle: Mutex::new(()),
            update_listener: None,
        }
    }

    /// 缓存更新后额外通知的监听器
    pub fn with_update_listener(mut self, listener: UpdateCallback) -> Self {
        self.update_listener = Some(listener);
        self
    }

    /// 启动客户端
    ///
    /// 提供实例描述且开启注册角色时先注册；开启拉取角色时启动拉取器，并在
    /// 启动超时内等待首次拉取。注册失败返回 `Startup` 错误，状态停留在
    /// STARTING，可以再次调用。
    pub async fn start(&self, descriptor: Option<InstanceDescriptor>) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        match self.state() {
            ClientState::Created | ClientState::Starting => {}
            ClientState::Running => {
                tracing::debug!("Discovery client already running");
                return Ok(());
            }
            ClientState::Stopping | ClientState::Stopped => return Err(DiscoveryError::Stopped),
        }
        self.transition(ClientState::Starting);

        let fetch_enabled = self.config.client.fetch_enabled;
        if fetch_enabled && !self.fetcher.is_running() {
            self.fetcher.start(self.config.fetch_interval(), self.update_callback());
        }

        if let Some(descriptor) = descriptor {
            if self.config.client.register_enabled {
                // 上一次 start 已注册成功时不再重复注册
                if self.registration.instance(descriptor.instance_id()).is_none() {
                    self.registration
                        .register(descriptor)
                        .await
                        .map_err(DiscoveryError::startup)?;
                }
            } else {
                tracing::info!(
                    service_name = %descriptor.service_name(),
                    instance_id = %descriptor.instance_id(),
                    "Registration role disabled, instance not registered"
                );
            }
        }

        if fetch_enabled {
            let startup_timeout = self.config.startup_timeout();
            if tokio::time::timeout(startup_timeout, self.fetcher.wait_initialized())
                .await
                .is_err()
            {
                tracing::warn!(
                    timeout_secs = startup_timeout.as_secs(),
                    "Initial registry fetch not completed in time, starting with empty cache"
                );
            }
        }

        self.transition(ClientState::Running);
        Ok(())
    }

    /// 按顺序关闭：停止拉取 -> 注销本地实例 -> 停止心跳，每一步都有超时
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        if self.state() == ClientState::Stopped {
            return;
        }
        self.transition(ClientState::Stopping);
        let step_timeout = self.config.shutdown_step_timeout();

        self.fetcher.stop();
        if tokio::time::timeout(step_timeout, self.fetcher.stopped())
            .await
            .is_err()
        {
            tracing::warn!("Timed out waiting for registry fetcher to stop");
        }

        // 注销全部实例并等待进行中的注册与重新注册结束
        if tokio::time::timeout(step_timeout, self.registration.shutdown())
            .await
            .is_err()
        {
            tracing::warn!("Timed out deregistering instances during shutdown");
        }

        let heartbeat = self.registration.heartbeat();
        heartbeat.stop_all();
        if tokio::time::timeout(step_timeout, heartbeat.wait_stopped())
            .await
            .is_err()
        {
            tracing::warn!("Timed out waiting for heartbeat tasks to stop");
        }

        self.transition(ClientState::Stopped);
        tracing::info!("Discovery client stopped");
    }

    /// 查询服务的实例快照，未知服务返回空集合
    pub fn lookup(&self, service_name: &str) -> Result<Arc<RegistryEntry>> {
        self.ensure_running()?;
        Ok(self.cache.get(service_name))
    }

    /// 只返回 UP 状态的实例
    pub fn lookup_up(&self, service_name: &str) -> Result<Vec<InstanceDescriptor>> {
        let entry = self.lookup(service_name)?;
        Ok(entry.up_instances().cloned().collect())
    }

    pub fn next_up_instance(&self, service_name: &str) -> Result<Option<InstanceDescriptor>> {
        self.ensure_running()?;
        Ok(self.cache.next_up_instance(service_name))
    }

    pub fn all_service_names(&self) -> Result<Vec<String>> {
        self.ensure_running()?;
        Ok(self.cache.all_service_names())
    }

    /// 运行期间注册额外的实例
    pub async fn register(&self, descriptor: InstanceDescriptor) -> Result<()> {
        self.ensure_running()?;
        self.registration.register(descriptor).await
    }

    pub async fn update_status(&self, instance_id: &str, status: InstanceStatus) -> Result<()> {
        self.ensure_running()?;
        self.registration.update_status(instance_id, status).await
    }

    /// 注销实例；关闭后再调用视为已注销
    pub async fn deregister(&self, instance_id: &str) -> Result<()> {
        match self.state() {
            ClientState::Stopping | ClientState::Stopped => Ok(()),
            _ => self.registration.deregister(instance_id).await,
        }
    }

    pub fn registered_instances(&self) -> Vec<InstanceDescriptor> {
        self.registration.registered_instances()
    }

    pub fn subscribe(&self) -> impl Stream<Item = ClientEvent> + Send + Unpin + 'static {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// 订阅生命周期变化
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn is_degraded(&self) -> bool {
        self.fetcher.is_degraded()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            ClientState::Running => Ok(()),
            ClientState::Stopping | ClientState::Stopped => Err(DiscoveryError::Stopped),
            state => Err(DiscoveryError::NotReady(state)),
        }
    }

    fn transition(&self, to: ClientState) {
        let from = self.state.send_replace(to);
        if from != to {
            tracing::info!(from = %from, to = %to, "Discovery client state changed");
            self.events.publish(ClientEventKind::StateChanged { from, to });
        }
    }

    fn update_callback(&self) -> UpdateCallback {
        let cache = self.cache.clone();
        let listener = self.update_listener.clone();
        Arc::new(move |service_name: &str, entry: &RegistryEntry| {
            cache.apply_update(service_name, entry.clone());
            if let Some(listener) = &listener {
                listener(service_name, entry);
            }
        })
    }
}
