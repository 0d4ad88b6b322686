use std::time::Duration;

use thiserror::Error;

use crate::services::registry::TransportError;
use crate::services::ClientState;

/// 发现客户端错误类型
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// 调用方输入错误，不重试
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Instance already registered: {instance_id}")]
    DuplicateInstance { instance_id: String },

    #[error("Unknown instance: {instance_id}")]
    UnknownInstance { instance_id: String },

    #[error("Registry call timed out after {0:?}")]
    RegistryTimeout(Duration),

    #[error("Registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("Registry rejected request: {0}")]
    Rejected(String),

    /// 注册请求进行中实例被注销，注册中心上的登记已撤回
    #[error("Registration of {instance_id} cancelled by deregister")]
    Cancelled { instance_id: String },

    #[error("Startup failed: {source}")]
    Startup {
        #[source]
        source: Box<DiscoveryError>,
    },

    #[error("Client not ready (state: {0})")]
    NotReady(ClientState),

    #[error("Client stopped")]
    Stopped,

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl DiscoveryError {
    pub(crate) fn startup(source: DiscoveryError) -> Self {
        Self::Startup {
            source: Box::new(source),
        }
    }

    /// 是否为可重试的注册中心错误，启动错误按其原因判断
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RegistryTimeout(_) | Self::RegistryUnavailable(_) => true,
            Self::Startup { source } => source.is_transient(),
            _ => false,
        }
    }
}

impl From<TransportError> for DiscoveryError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(elapsed) => Self::RegistryTimeout(elapsed),
            TransportError::Unavailable(msg) => Self::RegistryUnavailable(msg),
            TransportError::NotFound(msg) | TransportError::Rejected(msg) => Self::Rejected(msg),
            // 版本断层只在拉取任务内部处理，这里仅兜底
            TransportError::VersionGap { requested, current } => Self::Rejected(format!(
                "version gap: requested {requested}, registry at {current}"
            )),
        }
    }
}

pub type Result<T, E = DiscoveryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(DiscoveryError::RegistryTimeout(Duration::from_secs(5)).is_transient());
        assert!(DiscoveryError::from(TransportError::Unavailable("down".into())).is_transient());
        assert!(!DiscoveryError::Rejected("bad".into()).is_transient());
        assert!(!DiscoveryError::Validation("empty host".into()).is_transient());
    }

    #[test]
    fn test_startup_error_follows_source() {
        let retryable = DiscoveryError::startup(DiscoveryError::RegistryUnavailable("down".into()));
        assert!(retryable.is_transient());

        let fatal = DiscoveryError::startup(DiscoveryError::Rejected("bad descriptor".into()));
        assert!(!fatal.is_transient());
    }
}
