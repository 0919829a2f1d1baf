// Event Bus - In-process broadcast channel for domain events

use beacon_shared::DomainEvent;
use tokio::sync::broadcast;
use tracing::debug;

/// Well-known event types published by the engine itself
pub mod topics {
    pub const RULE_EXECUTED: &str = "rule.executed";
    pub const RULE_FAILED: &str = "rule.failed";
    pub const FLOW_COMPLETED: &str = "flow.completed";
    pub const FLOW_FAILED: &str = "flow.failed";
    pub const FLOW_WAITING: &str = "flow.waiting";
    pub const ANALYTICS_TRACKED: &str = "analytics.tracked";
}

/// Broadcast-based event bus.
///
/// Cloning is cheap; every clone publishes into the same channel. Subscribers
/// receive every event published after they subscribed.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Events published with no live subscribers are dropped.
    pub fn publish(&self, event: DomainEvent) {
        debug!("Publishing event: {}", event.event_type);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::new(
            "ticket.created",
            Uuid::new_v4(),
            serde_json::json!({"priority": "high"}),
        ));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "ticket.created");
        assert_eq!(received.data["priority"], "high");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        tokio_test::block_on(async {
            let bus = EventBus::new(16);
            // No receiver; must not panic
            bus.publish(DomainEvent::new("ticket.created", Uuid::new_v4(), serde_json::json!({})));
            assert_eq!(bus.subscriber_count(), 0);
        });
    }
}
