use tokio::sync::broadcast;

use spectate_protocol::BrokerEvent;

/// Fan-out of broker state changes to any number of subscribers.
///
/// Publishing never blocks and never fails an operation: with no
/// subscribers the event is dropped, and slow subscribers see `Lagged`.
#[derive(Clone)]
pub struct EventBroker {
    tx: broadcast::Sender<BrokerEvent>,
}

impl EventBroker {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: BrokerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::EventBroker;
    use spectate_protocol::BrokerEvent;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn publish_subscribe_cycle() {
        let broker = EventBroker::new(8);
        broker.publish(BrokerEvent::SlotRegistered {
            slot_id: "dropped".to_string(),
        });

        let mut rx = broker.subscribe();
        broker.publish(BrokerEvent::WorkloadRegistered {
            workload_id: "w1".to_string(),
        });

        let evt = rx.recv().await.expect("recv");
        assert!(matches!(evt, BrokerEvent::WorkloadRegistered { .. }));
    }

    #[tokio::test]
    async fn slow_subscriber_lags() {
        let broker = EventBroker::new(2);
        let mut rx = broker.subscribe();
        for i in 0..5 {
            broker.publish(BrokerEvent::SlotRegistered {
                slot_id: format!("s{i}"),
            });
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
    }
}
