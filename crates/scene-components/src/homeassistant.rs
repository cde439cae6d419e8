//! Generic `homeassistant.turn_on` / `homeassistant.turn_off`

use scene_core::{ServiceCall, STATE_OFF, STATE_ON};
use scene_service_registry::ServiceRegistry;
use scene_state_store::StateStore;
use std::sync::Arc;
use tracing::{debug, info};

const DOMAIN: &str = "homeassistant";

/// Register generic on/off services that work on any entity
///
/// Only entities that already exist are switched; attributes are kept.
pub fn register_homeassistant_services(services: &ServiceRegistry, states: Arc<StateStore>) {
    for (service, value) in [("turn_on", STATE_ON), ("turn_off", STATE_OFF)] {
        let states = states.clone();
        services.register(DOMAIN, service, move |call: ServiceCall| {
            let states = states.clone();
            async move {
                for entity_id in call.entity_ids() {
                    if states.get(&entity_id).is_some() {
                        states.set_value(&entity_id, value);
                    } else {
                        debug!(entity_id = %entity_id, "Skipping unknown entity");
                    }
                }
                Ok(())
            }
        });
    }

    info!("Generic on/off services registered");
}

#[cfg(test)]
mod tests {
    use super::*;
    use scene_event_bus::EventBus;
    use serde_json::json;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_turn_off_and_on() {
        let bus = Arc::new(EventBus::new());
        let states = Arc::new(StateStore::new(bus.clone()));
        let services = ServiceRegistry::new(bus);
        register_homeassistant_services(&services, states.clone());

        states.set(
            "light.tv",
            "on",
            HashMap::from([("brightness".to_string(), json!(200))]),
        );
        states.set("switch.fan", "on", HashMap::new());

        services
            .call(
                "homeassistant",
                "turn_off",
                json!({"entity_id": ["light.tv", "switch.fan", "light.missing"]}),
                json!(null),
            )
            .await
            .unwrap();

        assert_eq!(states.get_state("light.tv").as_deref(), Some("off"));
        assert_eq!(states.get_state("switch.fan").as_deref(), Some("off"));
        assert!(states.get("light.missing").is_none());
        assert_eq!(states.get("light.tv").unwrap().attribute::<i64>("brightness"), Some(200));

        services
            .call("homeassistant", "turn_on", json!(null), json!({"entity_id": "switch.fan"}))
            .await
            .unwrap();
        assert_eq!(states.get_state("switch.fan").as_deref(), Some("on"));
    }
}
