//! `discovery.Registry` 服务的 protobuf 消息定义
//!
//! 与 prost 代码生成结果保持相同的结构，字段号即线上协议。

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::services::instance::{InstanceDescriptor, InstanceKey, InstanceStatus};
use crate::services::registry::types::{FetchDelta, RegistrySnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Status {
    Unknown = 0,
    Starting = 1,
    Up = 2,
    Down = 3,
    OutOfService = 4,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Instance {
    #[prost(string, tag = "1")]
    pub instance_id: String,
    #[prost(string, tag = "2")]
    pub service_name: String,
    #[prost(string, tag = "3")]
    pub host: String,
    #[prost(uint32, tag = "4")]
    pub port: u32,
    #[prost(enumeration = "Status", tag = "5")]
    pub status: i32,
    #[prost(map = "string, string", tag = "6")]
    pub metadata: HashMap<String, String>,
    /// 毫秒级 Unix 时间戳
    #[prost(uint64, tag = "7")]
    pub last_updated_ms: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InstanceRef {
    #[prost(string, tag = "1")]
    pub service_name: String,
    #[prost(string, tag = "2")]
    pub instance_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RegisterRequest {
    #[prost(message, optional, tag = "1")]
    pub instance: Option<Instance>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StatusUpdateRequest {
    #[prost(message, optional, tag = "1")]
    pub instance: Option<InstanceRef>,
    #[prost(enumeration = "Status", tag = "2")]
    pub status: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Ack {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VersionRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VersionResponse {
    #[prost(uint64, tag = "1")]
    pub version: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FetchRegistryRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FetchRegistryResponse {
    #[prost(uint64, tag = "1")]
    pub version: u64,
    #[prost(message, repeated, tag = "2")]
    pub instances: Vec<Instance>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FetchDeltaRequest {
    #[prost(uint64, tag = "1")]
    pub since_version: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FetchDeltaResponse {
    #[prost(uint64, tag = "1")]
    pub from_version: u64,
    #[prost(uint64, tag = "2")]
    pub version: u64,
    #[prost(message, repeated, tag = "3")]
    pub added: Vec<Instance>,
    #[prost(message, repeated, tag = "4")]
    pub changed: Vec<Instance>,
    #[prost(message, repeated, tag = "5")]
    pub removed: Vec<InstanceRef>,
}

impl From<InstanceStatus> for Status {
    fn from(status: InstanceStatus) -> Self {
        match status {
            InstanceStatus::Starting => Status::Starting,
            InstanceStatus::Up => Status::Up,
            InstanceStatus::Down => Status::Down,
            InstanceStatus::OutOfService => Status::OutOfService,
            InstanceStatus::Unknown => Status::Unknown,
        }
    }
}

impl From<Status> for InstanceStatus {
    fn from(status: Status) -> Self {
        match status {
            Status::Starting => InstanceStatus::Starting,
            Status::Up => InstanceStatus::Up,
            Status::Down => InstanceStatus::Down,
            Status::OutOfService => InstanceStatus::OutOfService,
            Status::Unknown => InstanceStatus::Unknown,
        }
    }
}

/// 未知枚举值按 UNKNOWN 处理
pub fn status_from_wire(value: i32) -> InstanceStatus {
    Status::try_from(value).unwrap_or(Status::Unknown).into()
}

fn to_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

impl From<&InstanceDescriptor> for Instance {
    fn from(instance: &InstanceDescriptor) -> Self {
        Self {
            instance_id: instance.instance_id().to_string(),
            service_name: instance.service_name().to_string(),
            host: instance.host().to_string(),
            port: u32::from(instance.port()),
            status: Status::from(instance.status()) as i32,
            metadata: instance.metadata().clone(),
            last_updated_ms: to_millis(instance.last_updated()),
        }
    }
}

impl TryFrom<Instance> for InstanceDescriptor {
    type Error = crate::error::DiscoveryError;

    fn try_from(wire: Instance) -> Result<Self, Self::Error> {
        InstanceDescriptor::builder(wire.service_name, wire.host, wire.port)
            .instance_id(wire.instance_id)
            .status(status_from_wire(wire.status))
            .metadata_map(wire.metadata)
            .last_updated(UNIX_EPOCH + Duration::from_millis(wire.last_updated_ms))
            .build()
    }
}

impl From<&InstanceKey> for InstanceRef {
    fn from(key: &InstanceKey) -> Self {
        Self {
            service_name: key.service_name.clone(),
            instance_id: key.instance_id.clone(),
        }
    }
}

impl From<InstanceRef> for InstanceKey {
    fn from(wire: InstanceRef) -> Self {
        InstanceKey::new(wire.service_name, wire.instance_id)
    }
}

// 注册中心下发的非法实例直接丢弃，不影响其余数据
fn decode_instances(instances: Vec<Instance>) -> Vec<InstanceDescriptor> {
    instances
        .into_iter()
        .filter_map(|wire| {
            let id = wire.instance_id.clone();
            match InstanceDescriptor::try_from(wire) {
                Ok(instance) => Some(instance),
                Err(e) => {
                    tracing::warn!(instance_id = %id, error = %e, "Dropping invalid instance from registry");
                    None
                }
            }
        })
        .collect()
}

impl From<FetchRegistryResponse> for RegistrySnapshot {
    fn from(wire: FetchRegistryResponse) -> Self {
        Self {
            version: wire.version,
            instances: decode_instances(wire.instances),
        }
    }
}

impl From<FetchDeltaResponse> for FetchDelta {
    fn from(wire: FetchDeltaResponse) -> Self {
        Self {
            from_version: wire.from_version,
            version: wire.version,
            added: decode_instances(wire.added),
            changed: decode_instances(wire.changed),
            removed: wire.removed.into_iter().map(InstanceKey::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_wire_status_maps_to_unknown() {
        assert_eq!(status_from_wire(42), InstanceStatus::Unknown);
        assert_eq!(status_from_wire(Status::Up as i32), InstanceStatus::Up);
    }

    #[test]
    fn test_invalid_instances_are_dropped() {
        let response = FetchRegistryResponse {
            version: 7,
            instances: vec![
                Instance {
                    instance_id: "ok".into(),
                    service_name: "svc".into(),
                    host: "10.0.0.1".into(),
                    port: 80,
                    status: Status::Up as i32,
                    ..Default::default()
                },
                Instance {
                    instance_id: "bad".into(),
                    service_name: "svc".into(),
                    host: String::new(),
                    port: 80,
                    ..Default::default()
                },
            ],
        };

        let snapshot = RegistrySnapshot::from(response);
        assert_eq!(snapshot.version, 7);
        assert_eq!(snapshot.instances.len(), 1);
        assert_eq!(snapshot.instances[0].instance_id(), "ok");
    }
}
