use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::DiscoveryError;
use crate::services::event::EventConfig;
use crate::services::fetcher::{BackoffPolicy, FetcherConfig};
use crate::services::heartbeat::HeartbeatConfig;
use crate::services::instance::InstanceDescriptor;
use crate::services::registration::RegistrationConfig;
use crate::services::registry::GrpcTransportConfig;

/// 默认配置文件路径，可用 `DISCOVERY_CONFIG` 覆盖
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
/// 环境变量覆盖前缀
pub const ENV_PREFIX: &str = "DISCOVERY_";
/// 注册中心地址为该值时使用进程内注册中心
pub const IN_MEMORY_ADDRESS: &str = "memory";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid environment override: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// 发现客户端配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub registry: RegistrySection,
    pub client: ClientSection,
    pub backoff: BackoffSection,
    pub events: EventConfig,
    /// 本进程要注册的实例，不配置时只作为消费者运行
    pub instance: Option<InstanceSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// 注册中心地址，`memory` 表示进程内注册中心
    pub address: String,
    pub connect_timeout_secs: u64,
    /// 注册中心租约时长，仅用于进程内注册中心
    pub lease_duration_secs: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            address: "http://localhost:50051".to_string(),
            connect_timeout_secs: 10,
            lease_duration_secs: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub heartbeat_interval_secs: u64,
    pub fetch_interval_secs: u64,
    pub max_heartbeat_failures: u32,
    /// 单次注册中心调用超时
    pub call_timeout_ms: u64,
    /// 启动时等待首次拉取的最长时间
    pub startup_timeout_secs: u64,
    /// 关闭流程中每一步的超时
    pub shutdown_step_timeout_secs: u64,
    pub register_enabled: bool,
    pub fetch_enabled: bool,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            fetch_interval_secs: 30,
            max_heartbeat_failures: 3,
            call_timeout_ms: 5000,
            startup_timeout_secs: 10,
            shutdown_step_timeout_secs: 5,
            register_enabled: true,
            fetch_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSection {
    pub base_ms: u64,
    pub factor: u32,
    pub max_ms: u64,
    /// 连续拉取失败多少次进入降级模式
    pub degraded_threshold: u32,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            base_ms: 500,
            factor: 2,
            max_ms: 30_000,
            degraded_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSection {
    pub service_name: String,
    pub host: String,
    pub port: u32,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// `DISCOVERY_*` 环境变量覆盖项
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    registry_address: Option<String>,
    heartbeat_interval_secs: Option<u64>,
    fetch_interval_secs: Option<u64>,
    call_timeout_ms: Option<u64>,
    register_enabled: Option<bool>,
    fetch_enabled: Option<bool>,
    service_name: Option<String>,
    instance_host: Option<String>,
    instance_port: Option<u32>,
    instance_id: Option<String>,
}

impl EnvOverrides {
    fn apply(self, config: &mut ClientConfig) {
        if let Some(address) = self.registry_address {
            config.registry.address = address;
        }
        if let Some(secs) = self.heartbeat_interval_secs {
            config.client.heartbeat_interval_secs = secs;
        }
        if let Some(secs) = self.fetch_interval_secs {
            config.client.fetch_interval_secs = secs;
        }
        if let Some(ms) = self.call_timeout_ms {
            config.client.call_timeout_ms = ms;
        }
        if let Some(enabled) = self.register_enabled {
            config.client.register_enabled = enabled;
        }
        if let Some(enabled) = self.fetch_enabled {
            config.client.fetch_enabled = enabled;
        }

        // 只给出服务名时用 host/port 默认值补齐实例段
        if let Some(service_name) = self.service_name {
            let instance = config.instance.get_or_insert_with(|| InstanceSection {
                service_name: String::new(),
                host: "127.0.0.1".to_string(),
                port: 8080,
                instance_id: None,
                metadata: HashMap::new(),
            });
            instance.service_name = service_name;
        }
        if let Some(instance) = config.instance.as_mut() {
            if let Some(host) = self.instance_host {
                instance.host = host;
            }
            if let Some(port) = self.instance_port {
                instance.port = port;
            }
            if let Some(id) = self.instance_id {
                instance.instance_id = Some(id);
            }
        }
    }
}

impl ClientConfig {
    /// 加载配置：.env -> 配置文件 -> 环境变量覆盖
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env file");
        }

        let path = std::env::var("DISCOVERY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = if Path::new(&path).exists() {
            Self::from_file(&path)?
        } else {
            tracing::info!(path = %path, "Config file not found, using defaults");
            Self::default()
        };

        let overrides: EnvOverrides = envy::prefixed(ENV_PREFIX).from_env()?;
        overrides.apply(&mut config);

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config_str = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml_str(&config_str)
    }

    pub fn from_toml_str(config_str: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(config_str)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let client = &self.client;
        if client.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid("heartbeat_interval_secs must be positive".into()));
        }
        if client.fetch_interval_secs == 0 {
            return Err(ConfigError::Invalid("fetch_interval_secs must be positive".into()));
        }
        if client.max_heartbeat_failures == 0 {
            return Err(ConfigError::Invalid("max_heartbeat_failures must be positive".into()));
        }
        if client.call_timeout_ms == 0 {
            return Err(ConfigError::Invalid("call_timeout_ms must be positive".into()));
        }
        if self.backoff.base_ms == 0 || self.backoff.factor == 0 {
            return Err(ConfigError::Invalid("backoff base and factor must be positive".into()));
        }
        if self.backoff.max_ms < self.backoff.base_ms {
            return Err(ConfigError::Invalid("backoff max_ms must not be below base_ms".into()));
        }
        if self.backoff.degraded_threshold == 0 {
            return Err(ConfigError::Invalid("degraded_threshold must be positive".into()));
        }
        if self.registry.address.trim().is_empty() {
            return Err(ConfigError::Invalid("registry address must not be empty".into()));
        }
        Ok(())
    }

    pub fn is_in_memory(&self) -> bool {
        self.registry.address == IN_MEMORY_ADDRESS
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.client.heartbeat_interval_secs)
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.client.fetch_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.client.call_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.client.startup_timeout_secs)
    }

    pub fn shutdown_step_timeout(&self) -> Duration {
        Duration::from_secs(self.client.shutdown_step_timeout_secs)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.registry.lease_duration_secs)
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            max_consecutive_failures: self.client.max_heartbeat_failures,
            call_timeout: self.call_timeout(),
        }
    }

    pub fn registration_config(&self) -> RegistrationConfig {
        RegistrationConfig {
            heartbeat_interval: self.heartbeat_interval(),
            call_timeout: self.call_timeout(),
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff.base_ms),
            factor: self.backoff.factor,
            max: Duration::from_millis(self.backoff.max_ms),
        }
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            call_timeout: self.call_timeout(),
            backoff: self.backoff_policy(),
            degraded_threshold: self.backoff.degraded_threshold,
        }
    }

    pub fn transport_config(&self) -> GrpcTransportConfig {
        GrpcTransportConfig {
            registry_address: self.registry.address.clone(),
            connect_timeout: Duration::from_secs(self.registry.connect_timeout_secs),
            request_timeout: self.call_timeout(),
        }
    }

    /// 根据实例段构建本地实例描述，未配置时返回 None
    pub fn instance_descriptor(&self) -> Result<Option<InstanceDescriptor>, DiscoveryError> {
        let Some(section) = &self.instance else {
            return Ok(None);
        };
        let mut builder = InstanceDescriptor::builder(&section.service_name, &section.host, section.port)
            .metadata_map(section.metadata.clone());
        if let Some(id) = &section.instance_id {
            builder = builder.instance_id(id);
        }
        builder.build().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.fetch_interval(), Duration::from_secs(30));
        assert_eq!(config.call_timeout(), Duration::from_secs(5));
        assert_eq!(config.shutdown_step_timeout(), Duration::from_secs(5));
        assert_eq!(config.backoff_policy(), BackoffPolicy::default());
        assert!(config.client.register_enabled && config.client.fetch_enabled);
        assert!(config.instance_descriptor().unwrap().is_none());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = ClientConfig::from_toml_str(
            r#"
            [registry]
            address = "memory"

            [client]
            fetch_interval_secs = 5
            register_enabled = false

            [instance]
            service_name = "orders"
            host = "10.1.2.3"
            port = 7000

            [instance.metadata]
            zone = "a"
            "#,
        )
        .unwrap();

        assert!(config.is_in_memory());
        assert_eq!(config.fetch_interval(), Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert!(!config.client.register_enabled);

        let descriptor = config.instance_descriptor().unwrap().unwrap();
        assert_eq!(descriptor.instance_id(), "10.1.2.3:7000");
        assert_eq!(descriptor.metadata().get("zone").map(String::as_str), Some("a"));
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let mut config = ClientConfig::default();
        config.client.heartbeat_interval_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ClientConfig::default();
        config.client.max_heartbeat_failures = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.backoff.max_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides_fill_instance() {
        let mut config = ClientConfig::default();
        EnvOverrides {
            registry_address: Some("http://registry:9000".into()),
            service_name: Some("billing".into()),
            instance_port: Some(9100),
            ..EnvOverrides::default()
        }
        .apply(&mut config);

        assert_eq!(config.transport_config().registry_address, "http://registry:9000");
        let descriptor = config.instance_descriptor().unwrap().unwrap();
        assert_eq!(descriptor.service_name(), "billing");
        assert_eq!(descriptor.port(), 9100);
    }

    #[test]
    fn test_invalid_instance_section_fails_validation() {
        let config = ClientConfig::from_toml_str(
            r#"
            [instance]
            service_name = ""
            host = "h"
            port = 1
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.instance_descriptor(),
            Err(DiscoveryError::Validation(_))
        ));
    }
}
