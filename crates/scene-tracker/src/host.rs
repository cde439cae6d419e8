//! The tracker's view of its host
//!
//! The tracker reads member states, listens to state changes and service
//! calls, and dispatches scene activations and member turn-offs, all through
//! [`SceneHost`]. [`LocalHost`] implements it over the in-process event bus,
//! state store and service registry.

use crate::error::HostError;
use async_trait::async_trait;
use scene_core::events::CallServiceData;
use scene_core::{State, SCENE_DOMAIN};
use scene_event_bus::{EventBus, StateChangeReceiver, TypedEventReceiver};
use scene_service_registry::ServiceRegistry;
use scene_state_store::StateStore;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Read access to current entity states
pub trait StateSource: Send + Sync {
    fn current_state(&self, entity_id: &str) -> Option<State>;

    /// All current states of one domain
    fn domain_states(&self, domain: &str) -> Vec<State>;
}

/// Everything the tracker consumes from its host
#[async_trait]
pub trait SceneHost: StateSource {
    /// State changes of the given members only
    fn subscribe_state_changes(&self, members: Vec<String>) -> StateChangeReceiver;

    /// Every dispatched service call
    fn subscribe_service_calls(&self) -> TypedEventReceiver<CallServiceData>;

    /// Activate a host scene entity, waiting for the command to finish
    async fn activate_scene(&self, target: &str) -> Result<(), HostError>;

    /// Switch members off
    async fn turn_off(&self, members: Vec<String>) -> Result<(), HostError>;
}

/// [`SceneHost`] over the in-process bus, store and registry
#[derive(Clone)]
pub struct LocalHost {
    event_bus: Arc<EventBus>,
    states: Arc<StateStore>,
    services: Arc<ServiceRegistry>,
}

impl LocalHost {
    pub fn new(
        event_bus: Arc<EventBus>,
        states: Arc<StateStore>,
        services: Arc<ServiceRegistry>,
    ) -> Self {
        Self {
            event_bus,
            states,
            services,
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn states(&self) -> &Arc<StateStore> {
        &self.states
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }
}

impl StateSource for LocalHost {
    fn current_state(&self, entity_id: &str) -> Option<State> {
        self.states.get(entity_id)
    }

    fn domain_states(&self, domain: &str) -> Vec<State> {
        self.states.domain_states(domain)
    }
}

#[async_trait]
impl SceneHost for LocalHost {
    fn subscribe_state_changes(&self, members: Vec<String>) -> StateChangeReceiver {
        self.event_bus.track_state_changes(members)
    }

    fn subscribe_service_calls(&self) -> TypedEventReceiver<CallServiceData> {
        self.event_bus.subscribe_typed()
    }

    #[instrument(skip(self))]
    async fn activate_scene(&self, target: &str) -> Result<(), HostError> {
        debug!("Dispatching scene activation");
        self.services
            .call(
                SCENE_DOMAIN,
                "turn_on",
                json!({ "entity_id": target }),
                serde_json::Value::Null,
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(count = members.len()))]
    async fn turn_off(&self, members: Vec<String>) -> Result<(), HostError> {
        debug!("Dispatching member turn-off");
        self.services
            .call(
                "homeassistant",
                "turn_off",
                json!({ "entity_id": members }),
                serde_json::Value::Null,
            )
            .await?;
        Ok(())
    }
}
