use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};

use super::types::{ClientEvent, ClientEventKind, EventConfig, EventStats};

/// 基于 Tokio broadcast 的事件总线
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClientEvent>,
    /// 事件统计
    stats: Arc<Mutex<EventStats>>,
    config: EventConfig,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventConfig::default())
    }
}

impl EventBus {
    pub fn new(config: EventConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            sender,
            stats: Arc::new(Mutex::new(EventStats::default())),
            config,
        }
    }

    /// 发布事件，返回收到事件的订阅者数量；没有订阅者不算错误
    pub fn publish(&self, kind: ClientEventKind) -> usize {
        let event = ClientEvent::new(kind);
        let delivered = match self.sender.send(event.clone()) {
            Ok(subscriber_count) => {
                tracing::debug!(
                    event_type = %event.event_type(),
                    event_id = %event.event_id,
                    subscriber_count = %subscriber_count,
                    "Published event successfully"
                );
                subscriber_count
            }
            Err(_) => {
                tracing::trace!(
                    event_type = %event.event_type(),
                    event_id = %event.event_id,
                    "No active subscribers for event"
                );
                0
            }
        };

        if self.config.enable_metrics {
            if let Ok(mut stats) = self.stats.lock() {
                stats.events_published += 1;
                stats.events_delivered += delivered as u64;
                if delivered == 0 {
                    stats.events_without_subscribers += 1;
                }
            }
        }

        delivered
    }

    /// 订阅所有事件
    pub fn subscribe(&self) -> impl Stream<Item = ClientEvent> + Send + Unpin + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|result| match result {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event subscriber lagged, events dropped");
                None
            }
        })
    }

    /// 只订阅指定类型的事件
    pub fn subscribe_event_types(
        &self,
        event_types: &[&str],
    ) -> impl Stream<Item = ClientEvent> + Send + Unpin + 'static {
        let wanted: Vec<String> = event_types.iter().map(|t| (*t).to_string()).collect();
        self.subscribe()
            .filter(move |event| wanted.iter().any(|t| t == event.event_type()))
    }

    /// 获取事件统计信息
    pub fn get_stats(&self) -> EventStats {
        let base_stats = self
            .stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default();

        EventStats {
            active_subscribers: self.sender.receiver_count(),
            ..base_stats
        }
    }
}
