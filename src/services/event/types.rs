use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::ClientState;

/// 事件总线配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// 广播通道容量，慢订阅者超出后会丢失最旧的事件
    pub channel_capacity: usize,
    /// 是否启用事件统计
    pub enable_metrics: bool,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            enable_metrics: true,
        }
    }
}

/// 客户端可观察事件
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEventKind {
    Registered {
        service_name: String,
        instance_id: String,
    },
    RegistrationFailed {
        service_name: String,
        instance_id: String,
        reason: String,
    },
    Deregistered {
        service_name: String,
        instance_id: String,
    },
    /// 连续续约失败达到阈值
    HeartbeatThresholdExceeded {
        service_name: String,
        instance_id: String,
        consecutive_failures: u32,
    },
    Reregistered {
        service_name: String,
        instance_id: String,
    },
    /// 重新注册也失败，本地标记为 DOWN
    InstanceMarkedDown {
        service_name: String,
        instance_id: String,
        reason: String,
    },
    HeartbeatStopped {
        instance_id: String,
    },
    DegradedEntered {
        consecutive_failures: u32,
    },
    DegradedExited,
    FetcherStopped,
    StateChanged {
        from: ClientState,
        to: ClientState,
    },
}

impl ClientEventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registration.succeeded",
            Self::RegistrationFailed { .. } => "registration.failed",
            Self::Deregistered { .. } => "registration.deregistered",
            Self::HeartbeatThresholdExceeded { .. } => "heartbeat.threshold_exceeded",
            Self::Reregistered { .. } => "registration.renewed",
            Self::InstanceMarkedDown { .. } => "registration.marked_down",
            Self::HeartbeatStopped { .. } => "heartbeat.stopped",
            Self::DegradedEntered { .. } => "fetch.degraded_entered",
            Self::DegradedExited => "fetch.degraded_exited",
            Self::FetcherStopped => "fetch.stopped",
            Self::StateChanged { .. } => "client.state_changed",
        }
    }
}

/// 事件信封
#[derive(Debug, Clone)]
pub struct ClientEvent {
    pub event_id: String,
    pub timestamp: SystemTime,
    pub kind: ClientEventKind,
}

impl ClientEvent {
    pub fn new(kind: ClientEventKind) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: SystemTime::now(),
            kind,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.event_type(), self.event_id)
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 已发布的事件总数
    pub events_published: u64,
    /// 已投递的事件总数（按订阅者计）
    pub events_delivered: u64,
    /// 发布时没有订阅者的事件数量
    pub events_without_subscribers: u64,
    /// 当前订阅者数量
    pub active_subscribers: usize,
}
