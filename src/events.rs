use anyhow::Result;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use crate::protocol::BrokerEvent;

pub const DEFAULT_BUS_DEPTH: usize = 256;

pub fn init_logging(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Single ordered stream of broker events fanned out to all control clients.
/// Publishing never blocks; a subscriber that falls behind loses its oldest
/// events and observes a synthesized `delivery_dropped{reason:"event_lag"}`
/// in their place.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BrokerEvent>,
}

impl EventBus {
    pub fn new(depth: usize) -> Self {
        let (tx, _) = broadcast::channel(depth.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: BrokerEvent) {
        // A send error only means no subscriber is currently connected.
        let receivers = self.tx.send(event).unwrap_or(0);
        tracing::trace!(target = "fleet::events", receivers, "published event");
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct EventStream {
    rx: broadcast::Receiver<BrokerEvent>,
}

impl EventStream {
    /// Next event, or `None` once the bus shuts down. Lag is surfaced inline
    /// as the back-pressure signal rather than an error.
    pub async fn recv(&mut self) -> Option<BrokerEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(count)) => {
                tracing::warn!(
                    target = "fleet::events",
                    dropped = count,
                    "subscriber lagged; events dropped"
                );
                Some(BrokerEvent::DeliveryDropped {
                    name: "*".to_string(),
                    count: count as usize,
                    reason: "event_lag".to_string(),
                })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::BrokerEvent;

    use super::EventBus;

    fn ready(name: &str) -> BrokerEvent {
        BrokerEvent::AgentReady {
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = EventBus::new(16);
        let mut stream = bus.subscribe();
        bus.publish(ready("a"));
        bus.publish(ready("b"));

        assert_eq!(stream.recv().await, Some(ready("a")));
        assert_eq!(stream.recv().await, Some(ready("b")));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new(16);
        bus.publish(ready("nobody-listening"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_sees_event_lag_drop() {
        let bus = EventBus::new(2);
        let mut stream = bus.subscribe();
        for i in 0..5 {
            bus.publish(ready(&format!("agent-{i}")));
        }

        let first = stream.recv().await.unwrap();
        match first {
            BrokerEvent::DeliveryDropped { count, reason, .. } => {
                assert_eq!(reason, "event_lag");
                assert_eq!(count, 3);
            }
            other => panic!("expected event_lag drop, got {other:?}"),
        }
        // The surviving tail still arrives in order.
        assert_eq!(stream.recv().await, Some(ready("agent-3")));
        assert_eq!(stream.recv().await, Some(ready("agent-4")));
    }

    #[tokio::test]
    async fn stream_ends_when_bus_dropped() {
        let bus = EventBus::new(4);
        let mut stream = bus.subscribe();
        drop(bus);
        assert!(stream.recv().await.is_none());
    }
}
