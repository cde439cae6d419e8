//! Scene entities
//!
//! Every loaded definition gets a `scene.<slug>` entity whose attributes carry
//! the scene id, its display name and its members. `scene.turn_on` writes the
//! expected snapshots of the targeted scenes into the state store.

use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use scene_core::{
    slugify, ExpectedSnapshot, SceneDefinition, ServiceCall, State, SCENE_DOMAIN, STATE_ON,
    STATE_UNKNOWN,
};
use scene_service_registry::{ServiceError, ServiceRegistry};
use scene_state_store::StateStore;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Scene entities known to the host, keyed by entity id
pub struct SceneEntities {
    states: Arc<StateStore>,
    scenes: DashMap<String, SceneDefinition>,
}

impl SceneEntities {
    pub fn new(states: Arc<StateStore>) -> Self {
        Self {
            states,
            scenes: DashMap::new(),
        }
    }

    /// Replace the loaded scenes, creating one entity per definition
    ///
    /// Entities of previously loaded scenes are removed. Entity ids derive
    /// from the scene name; clashes get a numeric suffix.
    pub fn load(&self, definitions: &[SceneDefinition]) -> usize {
        let previous: Vec<String> = self.scenes.iter().map(|e| e.key().clone()).collect();
        for entity_id in previous {
            self.scenes.remove(&entity_id);
            self.states.remove(&entity_id);
        }

        for definition in definitions {
            let entity_id = self.unused_entity_id(definition);

            let mut attributes = HashMap::from([
                ("id".to_string(), json!(definition.id)),
                ("friendly_name".to_string(), json!(definition.name)),
                (
                    "entity_id".to_string(),
                    json!(definition.member_ids().collect::<Vec<_>>()),
                ),
            ]);
            if let Some(icon) = &definition.icon {
                attributes.insert("icon".to_string(), json!(icon));
            }

            self.states.set(&entity_id, STATE_UNKNOWN, attributes);
            debug!(entity_id = %entity_id, scene_id = %definition.id, "Loaded scene entity");
            self.scenes.insert(entity_id, definition.clone());
        }

        info!(count = definitions.len(), "Loaded scene entities");
        definitions.len()
    }

    fn unused_entity_id(&self, definition: &SceneDefinition) -> String {
        let base = match slugify(&definition.name) {
            slug if slug.is_empty() => slugify(&definition.id),
            slug => slug,
        };
        let base = format!("{}.{}", SCENE_DOMAIN, base);

        let mut candidate = base.clone();
        let mut n = 2;
        while self.scenes.contains_key(&candidate) {
            candidate = format!("{}_{}", base, n);
            n += 1;
        }
        candidate
    }

    /// Entity id of the scene with the given id
    pub fn entity_id_for(&self, scene_id: &str) -> Option<String> {
        self.scenes
            .iter()
            .find(|entry| entry.value().id == scene_id)
            .map(|entry| entry.key().clone())
    }

    pub fn definition(&self, entity_id: &str) -> Option<SceneDefinition> {
        self.scenes.get(entity_id).map(|d| d.clone())
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    /// Write a scene's snapshots into the state store
    ///
    /// Members keep their current attributes; expected attributes are
    /// layered on top. A snapshot without a target state keeps the current
    /// state, or `on` for an entity that does not exist yet.
    pub fn apply(&self, entity_id: &str) -> Result<usize, ServiceError> {
        let definition = self.definition(entity_id).ok_or_else(|| {
            ServiceError::InvalidData(format!("{} is not a known scene", entity_id))
        })?;

        for (member, expected) in &definition.entities {
            let current = self.states.get(member);
            let (state, attributes) = applied_state(current.as_ref(), expected);
            self.states.set(member, state, attributes);
        }

        let activated = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.states.set_value(entity_id, activated);

        debug!(entity_id = %entity_id, members = definition.entities.len(), "Applied scene");
        Ok(definition.entities.len())
    }
}

fn applied_state(
    current: Option<&State>,
    expected: &ExpectedSnapshot,
) -> (String, HashMap<String, serde_json::Value>) {
    let state = match (&expected.state, current) {
        (Some(state), _) => state.clone(),
        (None, Some(current)) => current.state.clone(),
        (None, None) => STATE_ON.to_string(),
    };

    let mut attributes = current.map(|c| c.attributes.clone()).unwrap_or_default();
    attributes.extend(expected.attributes.clone());
    (state, attributes)
}

/// Register `scene.turn_on`
///
/// `transition` is accepted and ignored; members are set immediately.
pub fn register_scene_services(services: &ServiceRegistry, scenes: Arc<SceneEntities>) {
    services.register(SCENE_DOMAIN, "turn_on", move |call: ServiceCall| {
        let scenes = scenes.clone();
        async move {
            let targets = call.entity_ids();
            if targets.is_empty() {
                return Err(ServiceError::InvalidData(
                    "scene.turn_on requires an entity_id".to_string(),
                ));
            }

            for entity_id in targets {
                if let Err(e) = scenes.apply(&entity_id) {
                    warn!(entity_id = %entity_id, error = %e, "Cannot activate scene");
                }
            }
            Ok(())
        }
    });

    info!("Scene services registered");
}
