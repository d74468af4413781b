//! Latest-wins broadcast of events.

use super::events::Event;
use std::sync::Arc;
use tokio::sync::watch;

/// Process-wide event broadcaster.
///
/// Backed by a single [`watch`] channel: every publish replaces the pending
/// value, so a subscriber that falls behind observes only the most recent
/// event. Publishing never waits on subscribers and succeeds when there are
/// none. Cloning the bus yields another handle to the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: Arc<watch::Sender<Option<Arc<Event>>>>,
}

impl EventBus {
    /// Create a bus with no pending event.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Publish an event, replacing whatever was pending.
    pub fn publish(&self, event: Event) {
        self.tx.send_replace(Some(Arc::new(event)));
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of an [`EventBus`].
#[derive(Debug)]
pub struct EventSubscriber {
    rx: watch::Receiver<Option<Arc<Event>>>,
}

impl EventSubscriber {
    /// Wait for the next unseen event.
    ///
    /// Returns `None` once every bus handle has been dropped.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(event) = self.rx.borrow_and_update().clone() {
                return Some(event);
            }
        }
    }

    /// Take the pending event without waiting, if one is unseen.
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        match self.rx.has_changed() {
            Ok(true) => self.rx.borrow_and_update().clone(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, HttpResponseEvent};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use uuid::Uuid;

    fn response(status: u16) -> Event {
        Event::now(
            Uuid::nil(),
            EventPayload::HttpResponse(HttpResponseEvent {
                status,
                message: String::new(),
                headers: BTreeMap::new(),
            }),
        )
    }

    fn status_of(event: &Event) -> u16 {
        match &event.payload {
            EventPayload::HttpResponse(r) => r.status,
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(response(200));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscribe_does_not_replay() {
        let bus = EventBus::new();
        bus.publish(response(200));

        let mut sub = bus.subscribe();
        assert!(sub.try_recv().is_none());

        bus.publish(response(201));
        assert_eq!(status_of(&sub.try_recv().unwrap()), 201);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_slow_subscriber_sees_latest_only() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        for status in 200..210 {
            bus.publish(response(status));
        }

        assert_eq!(status_of(&sub.try_recv().unwrap()), 209);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(response(204));
        });

        let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status_of(&event), 204);
    }

    #[tokio::test]
    async fn test_recv_ends_when_bus_dropped() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        drop(bus);
        assert!(sub.recv().await.is_none());
    }
}
