//! Switch entities mirroring tracked scenes
//!
//! Every tracked scene gets a `switch.<scene_id>` entity whose state follows
//! the tracker's active flag. Scene ids that slugify to the same entity id
//! get `_2`, `_3`, ... suffixes in load order. Turning the switch on or off
//! is routed to the tracker by the server.

use scene_core::{slugify, STATE_OFF, STATE_ON};
use scene_event_bus::RecvError;
use scene_state_store::StateStore;
use scene_tracker::{SceneChange, SceneTracker};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const SWITCH_DOMAIN: &str = "switch";

/// Entity id of the switch presenting `scene_id`, before collision suffixes
pub fn switch_entity_id(scene_id: &str) -> String {
    format!("{}.{}", SWITCH_DOMAIN, slugify(scene_id))
}

/// The switches of one tracker
pub struct SceneSwitches {
    states: Arc<StateStore>,
    tracker: Arc<SceneTracker>,
    /// Switch entity id to scene id
    switches: HashMap<String, String>,
    /// Scene id to switch entity id
    entities: HashMap<String, String>,
    mirror: Mutex<Option<JoinHandle<()>>>,
}

impl SceneSwitches {
    /// Create a switch per tracked scene and keep them in sync
    pub async fn attach(states: Arc<StateStore>, tracker: Arc<SceneTracker>) -> Arc<Self> {
        let changes = tracker.subscribe_changes();

        let mut switches = HashMap::new();
        let mut entities = HashMap::new();
        for scene_id in tracker.scene_ids().await {
            let base = switch_entity_id(&scene_id);
            let mut entity_id = base.clone();
            let mut n = 2;
            while switches.contains_key(&entity_id) {
                entity_id = format!("{}_{}", base, n);
                n += 1;
            }
            if entity_id != base {
                warn!(
                    scene_id = %scene_id,
                    entity_id = %entity_id,
                    "Switch entity id already taken by another scene, using suffix"
                );
            }
            switches.insert(entity_id.clone(), scene_id.clone());
            entities.insert(scene_id, entity_id);
        }

        let this = Arc::new(Self {
            states,
            tracker,
            switches,
            entities,
            mirror: Mutex::new(None),
        });
        this.refresh_all().await;

        let mirror = tokio::spawn(Self::mirror(this.clone(), changes));
        *this.mirror.lock().unwrap_or_else(PoisonError::into_inner) = Some(mirror);

        debug!(count = this.switches.len(), "Scene switches attached");
        this
    }

    async fn mirror(this: Arc<Self>, mut changes: broadcast::Receiver<SceneChange>) {
        loop {
            match changes.recv().await {
                Ok(change) => this.write(&change.scene_id, change.active).await,
                Err(RecvError::Lagged(n)) => {
                    warn!("Scene switches lagged by {} changes, refreshing", n);
                    this.refresh_all().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Stop mirroring and remove every switch entity
    pub fn detach(&self) {
        if let Some(mirror) = self
            .mirror
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            mirror.abort();
        }
        for entity_id in self.switches.keys() {
            self.states.remove(entity_id);
        }
    }

    /// The scene behind a switch entity
    pub fn scene_for(&self, entity_id: &str) -> Option<&str> {
        self.switches.get(entity_id).map(String::as_str)
    }

    /// The switch entity presenting a scene
    pub fn entity_for(&self, scene_id: &str) -> Option<&str> {
        self.entities.get(scene_id).map(String::as_str)
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &str> {
        self.switches.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.switches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.switches.is_empty()
    }

    /// Rewrite every switch from the tracker's current answers
    pub async fn refresh_all(&self) {
        for scene_id in self.switches.values() {
            let active = self.tracker.is_active(scene_id).await;
            self.write(scene_id, active).await;
        }
    }

    async fn write(&self, scene_id: &str, active: bool) {
        let Some(entity_id) = self.entity_for(scene_id) else {
            return;
        };
        let Some(definition) = self.tracker.definition(scene_id).await else {
            return;
        };
        let target = self.tracker.resolved_target(scene_id).await;

        let mut attributes = HashMap::from([
            ("friendly_name".to_string(), json!(definition.name)),
            ("scene_id".to_string(), json!(scene_id)),
            ("scene_entity_id".to_string(), json!(target)),
            (
                "tracked_entities".to_string(),
                Value::from(definition.member_ids().collect::<Vec<_>>()),
            ),
        ]);
        if let Some(icon) = &definition.icon {
            attributes.insert("icon".to_string(), json!(icon));
        }

        let state = if active { STATE_ON } else { STATE_OFF };
        self.states.set(entity_id, state, attributes);
    }
}
