use std::time::Duration;
use tokio::time::timeout;
use tokio_stream::StreamExt;

use grpc_discovery::services::event::{ClientEventKind, EventBus, EventConfig};

#[tokio::test]
async fn test_event_publish_subscribe() {
    let event_bus = EventBus::new(EventConfig {
        channel_capacity: 100,
        enable_metrics: true,
    });

    let mut event_stream = event_bus.subscribe();

    let delivered = event_bus.publish(ClientEventKind::Registered {
        service_name: "orders".to_string(),
        instance_id: "orders-1".to_string(),
    });
    assert_eq!(delivered, 1);

    let received = timeout(Duration::from_secs(1), event_stream.next())
        .await
        .expect("Timeout waiting for event")
        .expect("Stream ended unexpectedly");

    assert_eq!(received.event_type(), "registration.succeeded");
    assert_eq!(received.event_id.len(), 36);
    assert_eq!(
        received.kind,
        ClientEventKind::Registered {
            service_name: "orders".to_string(),
            instance_id: "orders-1".to_string(),
        }
    );
}

#[tokio::test]
async fn test_event_type_filtering() {
    let event_bus = EventBus::default();
    let mut fetch_events = event_bus.subscribe_event_types(&["fetch.degraded_entered", "fetch.degraded_exited"]);

    event_bus.publish(ClientEventKind::FetcherStopped);
    event_bus.publish(ClientEventKind::DegradedEntered {
        consecutive_failures: 3,
    });
    event_bus.publish(ClientEventKind::DegradedExited);

    let first = timeout(Duration::from_secs(1), fetch_events.next())
        .await
        .unwrap()
        .unwrap();
    let second = timeout(Duration::from_secs(1), fetch_events.next())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        first.kind,
        ClientEventKind::DegradedEntered {
            consecutive_failures: 3
        }
    );
    assert_eq!(second.kind, ClientEventKind::DegradedExited);
}

#[tokio::test]
async fn test_publish_without_subscribers() {
    let event_bus = EventBus::default();

    // 没有订阅者时发布不应报错
    assert_eq!(event_bus.publish(ClientEventKind::FetcherStopped), 0);

    let stats = event_bus.get_stats();
    assert_eq!(stats.events_published, 1);
    assert_eq!(stats.events_without_subscribers, 1);
    assert_eq!(stats.active_subscribers, 0);
}

#[tokio::test]
async fn test_multiple_subscribers_receive_same_event() {
    let event_bus = EventBus::default();
    let mut first = event_bus.subscribe();
    let mut second = event_bus.subscribe();
    assert_eq!(event_bus.get_stats().active_subscribers, 2);

    assert_eq!(event_bus.publish(ClientEventKind::DegradedExited), 2);

    let a = first.next().await.unwrap();
    let b = second.next().await.unwrap();
    assert_eq!(a.event_id, b.event_id);
    assert_eq!(event_bus.get_stats().events_delivered, 2);
}
