use std::sync::Arc;

use spectate_protocol::BrokerEvent;

use crate::clock::SharedClock;
use crate::config::Timeouts;
use crate::events::EventBroker;
use crate::lock::LockManager;
use crate::store::SharedStore;

/// Shared handles every engine component works through. Cheap to clone.
#[derive(Clone)]
pub struct BrokerContext {
    pub store: SharedStore,
    pub clock: SharedClock,
    pub timeouts: Arc<Timeouts>,
    pub events: EventBroker,
    pub locks: LockManager,
}

impl BrokerContext {
    pub fn new(store: SharedStore, clock: SharedClock, timeouts: Timeouts, events: EventBroker) -> Self {
        let locks = LockManager::new(store.clone(), timeouts.lock_ttl(), timeouts.lock_wait());
        Self {
            store,
            clock,
            timeouts: Arc::new(timeouts),
            events,
            locks,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn publish(&self, event: BrokerEvent) {
        self.events.publish(event);
    }
}
