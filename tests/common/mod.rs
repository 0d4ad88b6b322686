#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use grpc_discovery::services::instance::{InstanceDescriptor, InstanceKey, InstanceStatus};
use grpc_discovery::services::registry::{
    FetchDelta, InMemoryRegistry, RegistrySnapshot, RegistryTransport, TransportError,
};

/// 包装内存注册中心，可按需注入失败并记录调用
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    pub registry: InMemoryRegistry,
    fail_register: AtomicBool,
    fail_renew: AtomicBool,
    fail_fetch: AtomicBool,
    fail_status: AtomicBool,
    // 注册中心无响应，调用一直挂起直到超时
    hang_register: AtomicBool,
    hang_deregister: AtomicBool,
    register_delay: Mutex<Duration>,
    renew_delay: Mutex<Duration>,
    renewals_in_flight: AtomicUsize,
    max_renewals_in_flight: AtomicUsize,
    // 续约结果脚本，true 表示成功；用完后按 fail_renew 处理
    renew_script: Mutex<VecDeque<bool>>,
    calls: Mutex<Vec<(&'static str, Instant)>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_register(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_renew(&self, fail: bool) {
        self.fail_renew.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_status(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }

    pub fn set_hang_register(&self, hang: bool) {
        self.hang_register.store(hang, Ordering::SeqCst);
    }

    pub fn set_hang_deregister(&self, hang: bool) {
        self.hang_deregister.store(hang, Ordering::SeqCst);
    }

    /// 注册请求在返回前等待的时间
    pub fn set_register_delay(&self, delay: Duration) {
        *self.register_delay.lock().unwrap() = delay;
    }

    /// 续约请求在返回前等待的时间
    pub fn set_renew_delay(&self, delay: Duration) {
        *self.renew_delay.lock().unwrap() = delay;
    }

    /// 同一时刻进行中的续约请求的最大数量
    pub fn max_renewals_in_flight(&self) -> usize {
        self.max_renewals_in_flight.load(Ordering::SeqCst)
    }

    pub fn script_renewals(&self, outcomes: &[bool]) {
        self.renew_script.lock().unwrap().extend(outcomes.iter().copied());
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().iter().map(|(name, _)| *name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(n, _)| *n == name).count()
    }

    /// 某类调用发生的时间点
    pub fn call_times(&self, name: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, at)| *at)
            .collect()
    }

    fn log(&self, name: &'static str) {
        self.calls.lock().unwrap().push((name, Instant::now()));
    }

    fn unavailable() -> TransportError {
        TransportError::Unavailable("scripted failure".to_string())
    }
}

#[async_trait]
impl RegistryTransport for ScriptedTransport {
    async fn register_instance(&self, instance: &InstanceDescriptor) -> Result<(), TransportError> {
        self.log("register");
        if self.hang_register.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let delay = *self.register_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.registry.register_instance(instance).await
    }

    async fn renew_lease(&self, key: &InstanceKey) -> Result<(), TransportError> {
        self.log("renew");
        let in_flight = self.renewals_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_renewals_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        let scripted = self.renew_script.lock().unwrap().pop_front();
        let delay = *self.renew_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let outcome = match scripted {
            Some(true) => Ok(()),
            Some(false) => Err(Self::unavailable()),
            None if self.fail_renew.load(Ordering::SeqCst) => Err(Self::unavailable()),
            None => self.registry.renew_lease(key).await,
        };
        self.renewals_in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn deregister_instance(&self, key: &InstanceKey) -> Result<(), TransportError> {
        self.log("deregister");
        if self.hang_deregister.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.registry.deregister_instance(key).await
    }

    async fn update_status(
        &self,
        key: &InstanceKey,
        status: InstanceStatus,
    ) -> Result<(), TransportError> {
        self.log("update_status");
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.registry.update_status(key, status).await
    }

    async fn current_version(&self) -> Result<u64, TransportError> {
        self.log("current_version");
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.registry.current_version().await
    }

    async fn fetch_full_registry(&self) -> Result<RegistrySnapshot, TransportError> {
        self.log("fetch_full");
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.registry.fetch_full_registry().await
    }

    async fn fetch_delta(&self, since_version: u64) -> Result<FetchDelta, TransportError> {
        self.log("fetch_delta");
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.registry.fetch_delta(since_version).await
    }
}

pub fn instance(service: &str, id: &str, status: InstanceStatus) -> InstanceDescriptor {
    InstanceDescriptor::builder(service, "10.0.0.1", 8080)
        .instance_id(id)
        .status(status)
        .build()
        .unwrap()
}
