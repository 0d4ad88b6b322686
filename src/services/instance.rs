use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::DiscoveryError;

/// 实例状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Starting,
    Up,
    Down,
    OutOfService,
    #[default]
    Unknown,
}

impl InstanceStatus {
    /// STARTING 只能出现在最前面，任何状态都可以转为 DOWN
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        match (self, next) {
            (_, InstanceStatus::Down) => true,
            (InstanceStatus::Starting, _) => true,
            (_, InstanceStatus::Starting) => false,
            _ => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::Up => "UP",
            InstanceStatus::Down => "DOWN",
            InstanceStatus::OutOfService => "OUT_OF_SERVICE",
            InstanceStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 注册中心里一条注册的地址：服务名 + 实例ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub service_name: String,
    pub instance_id: String,
}

impl InstanceKey {
    pub fn new(service_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_name, self.instance_id)
    }
}

/// 服务实例描述
///
/// 身份字段（实例ID、服务名、主机、端口）在构建后不再变化；
/// 状态、元数据和更新时间属于可变字段。
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceDescriptor {
    instance_id: String,
    service_name: String,
    host: String,
    port: u16,
    pub(crate) status: InstanceStatus,
    pub(crate) metadata: HashMap<String, String>,
    pub(crate) last_updated: SystemTime,
}

impl InstanceDescriptor {
    pub fn builder(service_name: impl Into<String>, host: impl Into<String>, port: u32) -> InstanceBuilder {
        InstanceBuilder::new(service_name, host, port)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn last_updated(&self) -> SystemTime {
        self.last_updated
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.service_name.clone(), self.instance_id.clone())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_up(&self) -> bool {
        self.status == InstanceStatus::Up
    }

    pub(crate) fn set_status(&mut self, status: InstanceStatus) {
        self.status = status;
        self.touch();
    }

    pub(crate) fn touch(&mut self) {
        self.last_updated = SystemTime::now();
    }

    /// 用另一条同身份描述覆盖可变字段，身份字段保持不变
    pub(crate) fn apply_mutable_fields(&mut self, other: &InstanceDescriptor) {
        self.status = other.status;
        self.metadata = other.metadata.clone();
        self.last_updated = other.last_updated;
    }
}

/// 实例描述构建器
#[derive(Debug, Clone)]
pub struct InstanceBuilder {
    service_name: String,
    host: String,
    port: u32,
    instance_id: Option<String>,
    status: InstanceStatus,
    metadata: HashMap<String, String>,
    last_updated: Option<SystemTime>,
}

impl InstanceBuilder {
    fn new(service_name: impl Into<String>, host: impl Into<String>, port: u32) -> Self {
        Self {
            service_name: service_name.into(),
            host: host.into(),
            port,
            instance_id: None,
            status: InstanceStatus::Starting,
            metadata: HashMap::new(),
            last_updated: None,
        }
    }

    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn metadata_map(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn last_updated(mut self, at: SystemTime) -> Self {
        self.last_updated = Some(at);
        self
    }

    pub fn build(self) -> Result<InstanceDescriptor, DiscoveryError> {
        if self.service_name.trim().is_empty() {
            return Err(DiscoveryError::Validation("service name must not be empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(DiscoveryError::Validation("host must not be empty".into()));
        }
        let port = match u16::try_from(self.port) {
            Ok(port) if port != 0 => port,
            _ => {
                return Err(DiscoveryError::Validation(format!(
                    "port {} outside 1-65535",
                    self.port
                )));
            }
        };

        // 未指定时由 host:port 推导实例ID
        let instance_id = match self.instance_id {
            Some(id) if id.trim().is_empty() => {
                return Err(DiscoveryError::Validation("instance id must not be empty".into()));
            }
            Some(id) => id,
            None => format!("{}:{}", self.host, port),
        };

        Ok(InstanceDescriptor {
            instance_id,
            service_name: self.service_name,
            host: self.host,
            port,
            status: self.status,
            metadata: self.metadata,
            last_updated: self.last_updated.unwrap_or_else(SystemTime::now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_derives_instance_id() {
        let instance = InstanceDescriptor::builder("orders", "10.0.0.5", 8080)
            .build()
            .unwrap();
        assert_eq!(instance.instance_id(), "10.0.0.5:8080");
        assert_eq!(instance.status(), InstanceStatus::Starting);
        assert_eq!(instance.key(), InstanceKey::new("orders", "10.0.0.5:8080"));
    }

    #[test]
    fn test_builder_rejects_bad_input() {
        assert!(matches!(
            InstanceDescriptor::builder("", "host", 80).build(),
            Err(DiscoveryError::Validation(_))
        ));
        assert!(matches!(
            InstanceDescriptor::builder("svc", " ", 80).build(),
            Err(DiscoveryError::Validation(_))
        ));
        assert!(InstanceDescriptor::builder("svc", "host", 0).build().is_err());
        assert!(InstanceDescriptor::builder("svc", "host", 65536).build().is_err());
        assert!(InstanceDescriptor::builder("svc", "host", 65535).build().is_ok());
        assert!(InstanceDescriptor::builder("svc", "host", 80)
            .instance_id("")
            .build()
            .is_err());
    }

    #[test]
    fn test_status_transitions() {
        assert!(InstanceStatus::Starting.can_transition_to(InstanceStatus::Up));
        assert!(InstanceStatus::Up.can_transition_to(InstanceStatus::Down));
        assert!(InstanceStatus::OutOfService.can_transition_to(InstanceStatus::Down));
        assert!(InstanceStatus::Down.can_transition_to(InstanceStatus::Up));
        assert!(!InstanceStatus::Up.can_transition_to(InstanceStatus::Starting));
    }

    #[test]
    fn test_apply_mutable_fields_keeps_identity() {
        let mut local = InstanceDescriptor::builder("svc", "a", 1)
            .instance_id("i-1")
            .status(InstanceStatus::Up)
            .build()
            .unwrap();
        let remote = InstanceDescriptor::builder("svc", "b", 2)
            .instance_id("i-1")
            .status(InstanceStatus::Down)
            .metadata("zone", "z1")
            .build()
            .unwrap();

        local.apply_mutable_fields(&remote);
        assert_eq!(local.host(), "a");
        assert_eq!(local.port(), 1);
        assert_eq!(local.status(), InstanceStatus::Down);
        assert_eq!(local.metadata().get("zone").map(String::as_str), Some("z1"));
    }
}
