use crate::error::EventsError;
use crate::messages::TradeEvent;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Identifies one listener on an `EventBus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    name: String,
    tx: mpsc::Sender<TradeEvent>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<Listener>,
}

/// Fan-out of `TradeEvent`s to any number of listeners.
///
/// Each listener has its own bounded channel. Publishing never waits: a full
/// listener misses the event and a dropped listener is removed, while the
/// others still receive it. Clones share the same listener list.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

/// Receiving side of a listener. Dropping it unsubscribes on the next publish.
pub struct Subscription {
    id: ListenerId,
    rx: mpsc::Receiver<TradeEvent>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Next event, or `None` once the listener was removed from the bus.
    pub async fn recv(&mut self) -> Option<TradeEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TradeEvent> {
        self.rx.try_recv().ok()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Only the listener list is guarded; it stays consistent even if a
        // holder panicked.
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a listener holding at most `capacity` undelivered events.
    pub fn subscribe(&self, name: &str, capacity: usize) -> Result<Subscription, EventsError> {
        if capacity == 0 {
            return Err(EventsError::ZeroCapacity);
        }
        let (tx, rx) = mpsc::channel(capacity);
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = ListenerId(registry.next_id);
        registry.listeners.push(Listener {
            id,
            name: name.to_string(),
            tx,
        });
        debug!(listener = name, "Event listener added.");
        Ok(Subscription { id, rx })
    }

    /// Removes a listener. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut registry = self.registry();
        let before = registry.listeners.len();
        registry.listeners.retain(|l| l.id != id);
        registry.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.registry().listeners.len()
    }

    /// Delivers `event` to every listener with room for it and returns how
    /// many received it.
    pub fn publish(&self, event: TradeEvent) -> usize {
        let mut registry = self.registry();
        let mut delivered = 0;
        registry.listeners.retain(|listener| match listener.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(listener = %listener.name, event = event.name(), "Listener is full, event dropped.");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(listener = %listener.name, "Listener closed, removing.");
                false
            }
        });
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn skipped() -> TradeEvent {
        TradeEvent::TickSkipped {
            lock_name: "trade-monitor".to_string(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_all_listeners() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("a", 4).unwrap();
        let mut b = bus.subscribe("b", 4).unwrap();

        assert_eq!(bus.publish(skipped()), 2);
        assert_eq!(a.recv().await.unwrap().name(), "TickSkipped");
        assert_eq!(b.recv().await.unwrap().name(), "TickSkipped");
    }

    #[tokio::test]
    async fn test_full_listener_does_not_block_others() {
        let bus = EventBus::new();
        let _slow = bus.subscribe("slow", 1).unwrap();
        let mut fast = bus.subscribe("fast", 8).unwrap();

        bus.publish(skipped());
        assert_eq!(bus.publish(skipped()), 1);
        assert!(fast.try_recv().is_some());
        assert!(fast.try_recv().is_some());
        assert_eq!(bus.listener_count(), 2);
    }

    #[tokio::test]
    async fn test_remove_and_drop_handles() {
        let bus = EventBus::new();
        let a = bus.subscribe("a", 4).unwrap();
        let b = bus.subscribe("b", 4).unwrap();

        assert!(bus.unsubscribe(a.id()));
        assert!(!bus.unsubscribe(a.id()));
        drop(b);
        assert_eq!(bus.publish(skipped()), 0);
        assert_eq!(bus.listener_count(), 0);
        assert!(bus.subscribe("zero", 0).is_err());
    }
}
