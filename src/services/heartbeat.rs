use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::services::event::{ClientEventKind, EventBus};
use crate::services::instance::{InstanceDescriptor, InstanceKey};
use crate::services::registry::transport::with_timeout;
use crate::services::registry::RegistryTransport;

/// 心跳失败回调，由心跳任务在达到阈值时调用一次
pub type FailureCallback = Arc<dyn Fn(HeartbeatFailure) + Send + Sync>;

/// 连续续约失败的报告
#[derive(Debug, Clone)]
pub struct HeartbeatFailure {
    pub key: InstanceKey,
    pub consecutive_failures: u32,
    pub last_error: String,
}

// 心跳配置
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub max_consecutive_failures: u32,
    pub call_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// 连续失败计数；达到阈值时只触发一次
#[derive(Debug, Clone)]
pub struct FailureTracker {
    threshold: u32,
    consecutive: u32,
    tripped: bool,
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
            tripped: false,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// 返回 true 表示本次失败刚好触发阈值
    pub fn record_failure(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        if !self.tripped && self.consecutive >= self.threshold {
            self.tripped = true;
            return true;
        }
        false
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }
}

#[derive(Debug)]
struct RunningHeartbeat {
    generation: u64,
    token: CancellationToken,
}

/// 心跳发送器
///
/// 每个实例一个续约任务，同一实例的续约串行执行：上一次续约未完成时到期的
/// tick 直接跳过，不排队。
#[derive(Debug, Clone)]
pub struct HeartbeatSender {
    transport: Arc<dyn RegistryTransport>,
    config: HeartbeatConfig,
    events: EventBus,
    // 实例ID -> 正在运行的心跳任务
    running: Arc<DashMap<String, RunningHeartbeat>>,
    generation: Arc<AtomicU64>,
    task_tracker: TaskTracker,
}

impl HeartbeatSender {
    pub fn new(transport: Arc<dyn RegistryTransport>, config: HeartbeatConfig, events: EventBus) -> Self {
        Self {
            transport,
            config,
            events,
            running: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
            task_tracker: TaskTracker::new(),
        }
    }

    /// 开始为实例发送心跳，第一次续约在一个周期之后；已有任务会被替换
    pub fn start(&self, descriptor: &InstanceDescriptor, interval: Duration, on_failure: FailureCallback) {
        let key = descriptor.key();
        let token = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        if let Some(previous) = self.running.insert(
            key.instance_id.clone(),
            RunningHeartbeat {
                generation,
                token: token.clone(),
            },
        ) {
            previous.token.cancel();
            tracing::debug!(instance_id = %key.instance_id, "Replaced existing heartbeat task");
        }

        tracing::info!(
            service_name = %key.service_name,
            instance_id = %key.instance_id,
            interval_ms = interval.as_millis() as u64,
            "Starting heartbeat"
        );

        let task = HeartbeatTask {
            key,
            interval,
            generation,
            token,
            on_failure,
            transport: self.transport.clone(),
            config: self.config.clone(),
            running: self.running.clone(),
        };
        self.task_tracker.spawn(task.run());
    }

    /// 停止某个实例的心跳，返回是否有任务被停止
    pub fn stop(&self, instance_id: &str) -> bool {
        match self.running.remove(instance_id) {
            Some((_, heartbeat)) => {
                heartbeat.token.cancel();
                tracing::info!(instance_id = %instance_id, "Heartbeat stopped");
                self.events.publish(ClientEventKind::HeartbeatStopped {
                    instance_id: instance_id.to_string(),
                });
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let ids: Vec<String> = self.running.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.stop(&id);
        }
    }

    pub fn is_running(&self, instance_id: &str) -> bool {
        self.running.contains_key(instance_id)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// 等待所有心跳任务退出，调用前应先 stop
    pub async fn wait_stopped(&self) {
        self.task_tracker.close();
        self.task_tracker.wait().await;
        self.task_tracker.reopen();
    }
}

struct HeartbeatTask {
    key: InstanceKey,
    interval: Duration,
    generation: u64,
    token: CancellationToken,
    on_failure: FailureCallback,
    transport: Arc<dyn RegistryTransport>,
    config: HeartbeatConfig,
    running: Arc<DashMap<String, RunningHeartbeat>>,
}

impl HeartbeatTask {
    async fn run(self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tracker = FailureTracker::new(self.config.max_consecutive_failures);

        loop {
            tokio::select! {
                biased;
                () = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // 已发出的续约允许完成，但停止后结果直接丢弃
            let started = Instant::now();
            let outcome = with_timeout(self.config.call_timeout, self.transport.renew_lease(&self.key)).await;
            if self.token.is_cancelled() {
                tracing::debug!(instance_id = %self.key.instance_id, "Discarding renewal result after stop");
                break;
            }
            // 续约期间到期的 tick 丢弃，下一次续约从现在起算一个周期
            if started.elapsed() >= self.interval {
                tracing::debug!(
                    instance_id = %self.key.instance_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Renewal overran the interval, skipping missed ticks"
                );
                ticker.reset();
            }

            match outcome {
                Ok(()) => {
                    if tracker.consecutive_failures() > 0 {
                        tracing::info!(
                            instance_id = %self.key.instance_id,
                            "Heartbeat recovered"
                        );
                    }
                    tracker.record_success();
                    tracing::trace!(instance_id = %self.key.instance_id, "Lease renewed");
                }
                Err(e) => {
                    let tripped = tracker.record_failure();
                    tracing::warn!(
                        service_name = %self.key.service_name,
                        instance_id = %self.key.instance_id,
                        consecutive_failures = tracker.consecutive_failures(),
                        error = %e,
                        "Lease renewal failed"
                    );
                    if tripped {
                        // 先移除自己的登记，回调里可以安全地重新 start
                        self.running
                            .remove_if(&self.key.instance_id, |_, running| running.generation == self.generation);
                        (self.on_failure)(HeartbeatFailure {
                            key: self.key.clone(),
                            consecutive_failures: tracker.consecutive_failures(),
                            last_error: e.to_string(),
                        });
                        break;
                    }
                }
            }
        }
    }
}
