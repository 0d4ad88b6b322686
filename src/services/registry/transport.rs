use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::types::{FetchDelta, RegistrySnapshot};
use crate::services::instance::{InstanceDescriptor, InstanceKey, InstanceStatus};

/// 注册中心传输层错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Registry call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Registry unavailable: {0}")]
    Unavailable(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Version gap: requested {requested}, registry at {current}")]
    VersionGap { requested: u64, current: u64 },
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    /// 网络/超时类错误，可按退避策略重试
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_))
    }
}

/// 注册中心传输接口
///
/// 注册、续约、注销对注册中心而言都是幂等的，可以安全重试。
#[async_trait]
pub trait RegistryTransport: Send + Sync + 'static {
    async fn register_instance(&self, instance: &InstanceDescriptor) -> Result<(), TransportError>;

    async fn renew_lease(&self, key: &InstanceKey) -> Result<(), TransportError>;

    async fn deregister_instance(&self, key: &InstanceKey) -> Result<(), TransportError>;

    async fn update_status(
        &self,
        key: &InstanceKey,
        status: InstanceStatus,
    ) -> Result<(), TransportError>;

    async fn current_version(&self) -> Result<u64, TransportError>;

    async fn fetch_full_registry(&self) -> Result<RegistrySnapshot, TransportError>;

    /// 版本不连续时返回 `TransportError::VersionGap`
    async fn fetch_delta(&self, since_version: u64) -> Result<FetchDelta, TransportError>;
}

impl std::fmt::Debug for dyn RegistryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RegistryTransport")
    }
}

/// 给单次调用加上超时，超时映射为 `TransportError::Timeout`
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(limit)),
    }
}
