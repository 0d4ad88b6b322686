//! Registry fetcher
//!
//! 周期性地从注册中心拉取实例：本地版本缺失或落后超过一个增量步长时全量拉取，
//! 恰好落后一步时拉取增量。失败按指数退避无限重试，从不清空已有数据。

pub mod backoff;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::services::event::{ClientEventKind, EventBus};
use crate::services::registry::transport::with_timeout;
use crate::services::registry::{RegistryEntry, RegistryTransport, TransportError};

pub use backoff::BackoffPolicy;
pub use state::{DeltaRejection, FetchPlan, FetchState};

/// 服务实例集合发生变化时的回调：(服务名, 新的实例集合)
pub type UpdateCallback = Arc<dyn Fn(&str, &RegistryEntry) + Send + Sync>;

// 拉取配置
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub call_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// 连续失败多少次进入降级模式
    pub degraded_threshold: u32,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            degraded_threshold: 3,
        }
    }
}

/// 注册表拉取器
#[derive(Debug, Clone)]
pub struct RegistryFetcher {
    transport: Arc<dyn RegistryTransport>,
    config: FetcherConfig,
    events: EventBus,
    token: Arc<Mutex<Option<CancellationToken>>>,
    initialized: Arc<watch::Sender<bool>>,
    degraded: Arc<AtomicBool>,
    task_tracker: TaskTracker,
}

impl RegistryFetcher {
    pub fn new(transport: Arc<dyn RegistryTransport>, config: FetcherConfig, events: EventBus) -> Self {
        let (initialized, _) = watch::channel(false);
        Self {
            transport,
            config,
            events,
            token: Arc::new(Mutex::new(None)),
            initialized: Arc::new(initialized),
            degraded: Arc::new(AtomicBool::new(false)),
            task_tracker: TaskTracker::new(),
        }
    }

    /// 开始周期拉取，首轮立即执行；已在运行时返回 false
    pub fn start(&self, interval: Duration, on_update: UpdateCallback) -> bool {
        let Ok(mut slot) = self.token.lock() else {
            return false;
        };
        if slot.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return false;
        }

        let token = CancellationToken::new();
        *slot = Some(token.clone());
        drop(slot);

        self.initialized.send_replace(false);
        self.degraded.store(false, Ordering::SeqCst);

        tracing::info!(interval_ms = interval.as_millis() as u64, "Starting registry fetcher");

        let task = FetchTask {
            transport: self.transport.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            interval,
            token,
            on_update,
            initialized: self.initialized.clone(),
            degraded: self.degraded.clone(),
        };
        self.task_tracker.spawn(task.run());
        true
    }

    /// 取消拉取任务；不等待任务退出，可以在回调内部调用
    pub fn stop(&self) {
        if let Ok(slot) = self.token.lock() {
            if let Some(token) = slot.as_ref() {
                token.cancel();
            }
        }
    }

    /// 等待拉取任务退出
    pub async fn stopped(&self) {
        self.task_tracker.close();
        self.task_tracker.wait().await;
        self.task_tracker.reopen();
    }

    pub fn is_running(&self) -> bool {
        self.token
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|token| !token.is_cancelled()))
            .unwrap_or(false)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    /// 等待第一轮成功拉取
    pub async fn wait_initialized(&self) {
        let mut rx = self.initialized.subscribe();
        // 发送端由自身持有，不会提前关闭
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

struct FetchTask {
    transport: Arc<dyn RegistryTransport>,
    config: FetcherConfig,
    events: EventBus,
    interval: Duration,
    token: CancellationToken,
    on_update: UpdateCallback,
    initialized: Arc<watch::Sender<bool>>,
    degraded: Arc<AtomicBool>,
}

impl FetchTask {
    async fn run(self) {
        let mut state = FetchState::default();
        let mut failures: u32 = 0;
        let mut delay = Duration::ZERO;

        loop {
            tokio::select! {
                biased;
                () = self.token.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }

            let outcome = tokio::select! {
                biased;
                () = self.token.cancelled() => break,
                outcome = self.run_cycle(&mut state) => outcome,
            };

            match outcome {
                Ok(changed) => {
                    for entry in &changed {
                        tracing::debug!(
                            service_name = %entry.service_name,
                            instance_count = entry.len(),
                            "Service instances changed"
                        );
                        (self.on_update)(&entry.service_name, entry);
                    }
                    if self.degraded.swap(false, Ordering::SeqCst) {
                        tracing::info!("Registry fetch recovered, leaving degraded mode");
                        self.events.publish(ClientEventKind::DegradedExited);
                    }
                    failures = 0;
                    self.initialized.send_replace(true);
                    delay = self.interval;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    delay = self.config.backoff.delay(failures);
                    tracing::warn!(
                        consecutive_failures = failures,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Registry fetch failed, keeping last known registry"
                    );
                    if failures == self.config.degraded_threshold.max(1) {
                        self.degraded.store(true, Ordering::SeqCst);
                        tracing::error!(consecutive_failures = failures, "Registry fetch entering degraded mode");
                        self.events.publish(ClientEventKind::DegradedEntered {
                            consecutive_failures: failures,
                        });
                    }
                }
            }
        }

        tracing::info!("Registry fetcher stopped");
        self.events.publish(ClientEventKind::FetcherStopped);
    }

    async fn run_cycle(&self, state: &mut FetchState) -> Result<Vec<RegistryEntry>, TransportError> {
        let timeout = self.config.call_timeout;
        let remote_version = with_timeout(timeout, self.transport.current_version()).await?;

        match state.plan(remote_version) {
            FetchPlan::UpToDate => Ok(Vec::new()),
            FetchPlan::Full => self.full_fetch(state).await,
            FetchPlan::Resync { remote } => {
                tracing::warn!(
                    local = ?state.version(),
                    remote,
                    "Registry version went backwards, rebuilding from full registry"
                );
                self.resync(state, remote).await
            }
            FetchPlan::Delta { since } => {
                match with_timeout(timeout, self.transport.fetch_delta(since)).await {
                    Ok(delta) => match state.apply_delta(delta) {
                        Ok(changed) => Ok(changed),
                        Err(DeltaRejection::Stale { local, version }) => {
                            tracing::debug!(local, version, "Discarding stale registry delta");
                            Ok(Vec::new())
                        }
                        Err(DeltaRejection::Gap { local, from }) => {
                            tracing::debug!(?local, from, "Registry delta gap, falling back to full fetch");
                            self.full_fetch(state).await
                        }
                    },
                    Err(TransportError::VersionGap { requested, current }) => {
                        tracing::debug!(requested, current, "Registry reported version gap, falling back to full fetch");
                        self.full_fetch(state).await
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn resync(&self, state: &mut FetchState, observed: u64) -> Result<Vec<RegistryEntry>, TransportError> {
        let snapshot = with_timeout(self.config.call_timeout, self.transport.fetch_full_registry()).await?;
        let version = snapshot.version;
        match state.apply_resync(snapshot, observed) {
            Some(changed) => {
                tracing::info!(version, changed_services = changed.len(), "Rebuilt registry after reset");
                Ok(changed)
            }
            None => {
                tracing::debug!(version, observed, "Discarding snapshot older than observed registry version");
                Ok(Vec::new())
            }
        }
    }

    async fn full_fetch(&self, state: &mut FetchState) -> Result<Vec<RegistryEntry>, TransportError> {
        let snapshot = with_timeout(self.config.call_timeout, self.transport.fetch_full_registry()).await?;
        let version = snapshot.version;
        match state.apply_full(snapshot) {
            Some(changed) => {
                tracing::debug!(version, changed_services = changed.len(), "Applied full registry");
                Ok(changed)
            }
            None => {
                tracing::debug!(version, local = ?state.version(), "Discarding stale registry snapshot");
                Ok(Vec::new())
            }
        }
    }
}
