//! Event bus with typed pub/sub
//!
//! The bus carries the two streams the scene tracker listens to:
//! `state_changed` events from the state store and `call_service` events from
//! the service registry. Subscribers get a broadcast receiver, optionally
//! typed and filtered to a set of entities.

use dashmap::DashMap;
use scene_core::events::StateChangedData;
use scene_core::{Event, EventData, EventType};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

pub use tokio::sync::broadcast::error::RecvError;

/// Default channel capacity for event subscriptions
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// The event bus for publishing and subscribing to events
pub struct EventBus {
    /// Broadcast sender per event type, created on first subscription
    listeners: DashMap<EventType, broadcast::Sender<Event<serde_json::Value>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus whose per-type channels hold `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            listeners: DashMap::new(),
            capacity,
        }
    }

    /// Subscribe to raw events of one type
    pub fn subscribe(
        &self,
        event_type: impl Into<EventType>,
    ) -> broadcast::Receiver<Event<serde_json::Value>> {
        let event_type = event_type.into();
        trace!(event_type = %event_type, "Subscribing to event type");

        self.listeners
            .entry(event_type)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe to events with parsed data
    pub fn subscribe_typed<T: EventData + serde::de::DeserializeOwned>(
        &self,
    ) -> TypedEventReceiver<T> {
        TypedEventReceiver::new(self.subscribe(T::event_type()))
    }

    /// Subscribe to state changes of the given entities only
    pub fn track_state_changes<I, S>(&self, entity_ids: I) -> StateChangeReceiver
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StateChangeReceiver {
            inner: self.subscribe_typed(),
            entity_ids: entity_ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Fire an event to all subscribers of its type
    pub fn fire(&self, event: Event<serde_json::Value>) {
        debug!(event_type = %event.event_type, "Firing event");

        if let Some(sender) = self.listeners.get(&event.event_type) {
            // A send error only means nobody is listening
            let _ = sender.send(event);
        }
    }

    /// Fire a typed event
    pub fn fire_typed<T: EventData + serde::Serialize>(&self, data: T) {
        let event = Event::typed(data).map(|data| serde_json::to_value(&data).unwrap_or_default());
        self.fire(event);
    }

    /// Number of event types that have ever had a subscriber
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A receiver for typed events
pub struct TypedEventReceiver<T> {
    rx: broadcast::Receiver<Event<serde_json::Value>>,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: EventData + serde::de::DeserializeOwned> TypedEventReceiver<T> {
    fn new(rx: broadcast::Receiver<Event<serde_json::Value>>) -> Self {
        Self {
            rx,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Receive the next event whose data parses as `T`
    ///
    /// Malformed payloads are skipped.
    pub async fn recv(&mut self) -> Result<Event<T>, RecvError> {
        loop {
            let event = self.rx.recv().await?;
            match serde_json::from_value::<T>(event.data.clone()) {
                Ok(data) => return Ok(event.map(|_| data)),
                Err(e) => trace!(event_type = %event.event_type, error = %e, "Skipping malformed event"),
            }
        }
    }
}

/// Typed receiver for `state_changed` events of a fixed entity set
pub struct StateChangeReceiver {
    inner: TypedEventReceiver<StateChangedData>,
    entity_ids: HashSet<String>,
}

impl StateChangeReceiver {
    /// Receive the next state change for a tracked entity
    pub async fn recv(&mut self) -> Result<StateChangedData, RecvError> {
        loop {
            let event = self.inner.recv().await?;
            if self.entity_ids.contains(&event.data.entity_id) {
                return Ok(event.data);
            }
        }
    }

    /// Entities this receiver is tracking
    pub fn entity_ids(&self) -> &HashSet<String> {
        &self.entity_ids
    }
}

/// Thread-safe wrapper for EventBus
pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use scene_core::events::CallServiceData;
    use scene_core::State;
    use serde_json::json;
    use std::collections::HashMap;

    fn state_change(entity_id: &str, value: &str) -> StateChangedData {
        StateChangedData {
            entity_id: entity_id.to_string(),
            old_state: None,
            new_state: Some(State::new(entity_id, value, HashMap::new())),
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_fire() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("test_event");

        bus.fire(Event::new("test_event", json!({"key": "value"})));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type.as_str(), "test_event");
        assert_eq!(received.data["key"], "value");
    }

    #[tokio::test]
    async fn test_typed_subscription_skips_malformed() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_typed::<CallServiceData>();

        bus.fire(Event::new("call_service", json!({"domain": 3})));
        bus.fire_typed(CallServiceData {
            domain: "scene".to_string(),
            service: "turn_on".to_string(),
            service_data: json!({"entity_id": "scene.movie_night"}),
            target: json!(null),
        });

        let received = rx.recv().await.unwrap();
        assert!(received.data.is("scene", "turn_on"));
        assert_eq!(received.data.entity_ids(), vec!["scene.movie_night"]);
    }

    #[tokio::test]
    async fn test_track_state_changes_filters_entities() {
        let bus = EventBus::new();
        let mut rx = bus.track_state_changes(["light.tv", "media_player.tv"]);

        bus.fire_typed(state_change("light.kitchen", "on"));
        bus.fire_typed(state_change("light.tv", "off"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.entity_id, "light.tv");
        assert_eq!(rx.entity_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_no_cross_event_pollution() {
        let bus = EventBus::new();
        let mut rx_a = bus.subscribe("event_a");
        let mut rx_b = bus.subscribe("event_b");

        bus.fire(Event::new("event_a", json!({"type": "a"})));

        let received = rx_a.recv().await.unwrap();
        assert_eq!(received.data["type"], "a");
        assert!(rx_b.try_recv().is_err());
        assert_eq!(bus.listener_count(), 2);
    }
}
