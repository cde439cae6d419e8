//! Entity state storage with domain indexing
//!
//! The StateStore holds the current state of every entity known to the host
//! and fires a `state_changed` event on the bus for every write and removal.
//! The scene tracker reads member states from it and listens to those events.

use dashmap::DashMap;
use scene_core::events::StateChangedData;
use scene_core::{domain_of, State};
use scene_event_bus::EventBus;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

/// Current state of all entities
pub struct StateStore {
    /// All entity states keyed by entity_id
    states: DashMap<String, State>,
    /// Entity ids grouped by domain
    domain_index: DashMap<String, Vec<String>>,
    event_bus: Arc<EventBus>,
}

impl StateStore {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            states: DashMap::new(),
            domain_index: DashMap::new(),
            event_bus,
        }
    }

    /// Set the state of an entity
    ///
    /// Fires a STATE_CHANGED event carrying the previous state (if any) and
    /// the new one. Writing an identical state still fires, like the host it
    /// models; subscribers filter uninteresting updates themselves.
    #[instrument(skip(self, state, attributes), fields(entity_id = %entity_id))]
    pub fn set(
        &self,
        entity_id: &str,
        state: impl Into<String>,
        attributes: HashMap<String, serde_json::Value>,
    ) -> State {
        let old_state = self.get(entity_id);

        let new_state = match &old_state {
            Some(existing) => existing.with_update(state, attributes),
            None => State::new(entity_id, state, attributes),
        };

        debug!(
            state = %new_state.state,
            changed = old_state.as_ref().map(|s| s.state != new_state.state).unwrap_or(true),
            "Setting entity state"
        );

        self.states.insert(entity_id.to_string(), new_state.clone());

        if old_state.is_none() {
            self.domain_index
                .entry(domain_of(entity_id).to_string())
                .or_default()
                .push(entity_id.to_string());
        }

        self.event_bus.fire_typed(StateChangedData {
            entity_id: entity_id.to_string(),
            old_state,
            new_state: Some(new_state.clone()),
        });

        new_state
    }

    /// Set only the state value, keeping current attributes
    pub fn set_value(&self, entity_id: &str, state: impl Into<String>) -> State {
        let attributes = self
            .get(entity_id)
            .map(|s| s.attributes)
            .unwrap_or_default();
        self.set(entity_id, state, attributes)
    }

    pub fn get(&self, entity_id: &str) -> Option<State> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    /// Get the state value, or None if the entity doesn't exist
    pub fn get_state(&self, entity_id: &str) -> Option<String> {
        self.states.get(entity_id).map(|s| s.state.clone())
    }

    /// Get all entity ids for a domain
    pub fn entity_ids(&self, domain: &str) -> Vec<String> {
        self.domain_index
            .get(domain)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Get all states for a domain
    pub fn domain_states(&self, domain: &str) -> Vec<State> {
        self.entity_ids(domain)
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Remove an entity's state
    ///
    /// Fires a STATE_CHANGED event with None for new_state.
    #[instrument(skip(self))]
    pub fn remove(&self, entity_id: &str) -> Option<State> {
        let old_state = self.states.remove(entity_id).map(|(_, s)| s);

        if let Some(state) = &old_state {
            trace!("Removing entity state");

            if let Some(mut ids) = self.domain_index.get_mut(domain_of(entity_id)) {
                ids.retain(|id| id != entity_id);
            }

            self.event_bus.fire_typed(StateChangedData {
                entity_id: entity_id.to_string(),
                old_state: Some(state.clone()),
                new_state: None,
            });
        }

        old_state
    }

    pub fn entity_count(&self) -> usize {
        self.states.len()
    }
}

/// Thread-safe wrapper for StateStore
pub type SharedStateStore = Arc<StateStore>;
