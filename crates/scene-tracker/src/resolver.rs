//! Resolving scenes to the host's scene entities
//!
//! Activation commands address a host scene entity (`scene.movie_night`),
//! not a scene id. [`TargetResolver`] finds that entity for a definition;
//! [`TargetTable`] maps entity ids seen in dispatched commands back to scene
//! ids, first through bindings learned at runtime, then through guesses
//! derived from each scene's id and name.

use crate::host::StateSource;
use scene_core::{slugify, SceneDefinition, State, SCENE_DOMAIN};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::trace;

/// Finds the host scene entity that activates a scene
pub trait TargetResolver: Send + Sync {
    fn resolve(&self, scene: &SceneDefinition) -> Option<String>;

    /// Resolve many scenes at once, in order
    fn resolve_all(&self, scenes: &[SceneDefinition]) -> Vec<Option<String>> {
        scenes.iter().map(|scene| self.resolve(scene)).collect()
    }
}

/// Entity ids a scene's host entity is likely to have
///
/// `scene.<slug(id)>`, `scene.<id>` and `scene.<slug(name)>`, without
/// duplicates.
pub fn guess_candidates(scene: &SceneDefinition) -> Vec<String> {
    let mut candidates = Vec::with_capacity(3);
    let mut push = |suffix: String| {
        if suffix.is_empty() {
            return;
        }
        let candidate = format!("{}.{}", SCENE_DOMAIN, suffix);
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    };

    push(slugify(&scene.id));
    push(scene.id.clone());
    push(slugify(&scene.name));
    candidates
}

fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Lookup maps over one snapshot of the host's scene entities
#[derive(Debug, Default)]
pub struct SceneEntityIndex {
    entity_ids: HashSet<String>,
    by_id: HashMap<String, String>,
    by_name: HashMap<String, String>,
}

impl SceneEntityIndex {
    pub fn build(entities: &[State]) -> Self {
        let mut index = Self::default();
        for state in entities {
            index.entity_ids.insert(state.entity_id.clone());
            if let Some(id) = state.attribute::<String>("id").filter(|id| !id.is_empty()) {
                index.by_id.insert(id, state.entity_id.clone());
            }
            if let Some(name) = state
                .attribute::<String>("friendly_name")
                .filter(|name| !name.is_empty())
            {
                index.by_name.insert(name_key(&name), state.entity_id.clone());
            }
        }
        index
    }

    /// A scene entity whose `id` attribute equals the scene id wins;
    /// otherwise the first existing guess candidate; otherwise a scene
    /// entity whose `friendly_name` equals the scene name, ignoring case and
    /// surrounding whitespace.
    pub fn resolve(&self, scene: &SceneDefinition) -> Option<String> {
        if let Some(entity_id) = self.by_id.get(&scene.id) {
            return Some(entity_id.clone());
        }

        if let Some(candidate) = guess_candidates(scene)
            .into_iter()
            .find(|candidate| self.entity_ids.contains(candidate))
        {
            return Some(candidate);
        }

        let name = name_key(&scene.name);
        if name.is_empty() {
            return None;
        }
        self.by_name.get(&name).cloned()
    }
}

/// Resolves against the scene entities currently in the state store
pub struct StateTargetResolver {
    states: Arc<dyn StateSource>,
}

impl StateTargetResolver {
    pub fn new(states: Arc<dyn StateSource>) -> Self {
        Self { states }
    }

    fn index(&self) -> SceneEntityIndex {
        SceneEntityIndex::build(&self.states.domain_states(SCENE_DOMAIN))
    }
}

impl TargetResolver for StateTargetResolver {
    fn resolve(&self, scene: &SceneDefinition) -> Option<String> {
        let resolved = self.index().resolve(scene);
        trace!(scene_id = %scene.id, resolved = ?resolved, "Resolved scene entity");
        resolved
    }

    fn resolve_all(&self, scenes: &[SceneDefinition]) -> Vec<Option<String>> {
        let index = self.index();
        scenes.iter().map(|scene| index.resolve(scene)).collect()
    }
}

/// Target entity id to scene id lookup
#[derive(Debug, Clone, Default)]
pub struct TargetTable {
    direct: HashMap<String, String>,
    guesses: HashMap<String, String>,
}

impl TargetTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scene's guess candidates; earlier scenes keep a candidate
    pub fn add_guesses(&mut self, scene: &SceneDefinition) {
        for candidate in guess_candidates(scene) {
            self.guesses
                .entry(candidate)
                .or_insert_with(|| scene.id.clone());
        }
    }

    /// Bind a target to a scene, replacing any previous binding
    pub fn bind(&mut self, target: impl Into<String>, scene_id: impl Into<String>) {
        self.direct.insert(target.into(), scene_id.into());
    }

    pub fn lookup(&self, target: &str) -> Option<&str> {
        self.direct
            .get(target)
            .or_else(|| self.guesses.get(target))
            .map(String::as_str)
    }
}
