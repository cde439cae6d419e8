//! Scene definitions and the expectations they place on member entities

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{ATTR_STATE, STATE_OFF, STATE_ON};

/// What one member entity must look like for its scene to be active
///
/// `state` is the target state value; `attributes` holds every other expected
/// key. Attribute values are compared recursively by the matcher, so they may
/// be scalars, sequences or mappings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpectedSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(flatten)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl ExpectedSnapshot {
    /// Snapshot expecting only a target state value
    pub fn state(state: impl Into<String>) -> Self {
        Self {
            state: Some(state.into()),
            attributes: HashMap::new(),
        }
    }

    /// Add an attribute expectation
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Normalize a raw per-entity scene value
    ///
    /// - `null` expects nothing
    /// - a mapping splits into the `state` key and attribute expectations
    /// - a boolean expects `on`/`off`
    /// - any other scalar expects its string form as state
    pub fn from_value(value: &serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Self::default(),
            Value::Object(map) => {
                let mut snapshot = Self::default();
                for (key, v) in map {
                    if key == ATTR_STATE {
                        snapshot.state = state_string(v);
                    } else {
                        snapshot.attributes.insert(key.clone(), v.clone());
                    }
                }
                snapshot
            }
            other => Self {
                state: state_string(other),
                attributes: HashMap::new(),
            },
        }
    }

    /// Attribute keys that can influence a match, sorted
    pub fn watched_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.attributes.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// String form of a state value; `null` means no expectation
fn state_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(true) => Some(STATE_ON.to_string()),
        serde_json::Value::Bool(false) => Some(STATE_OFF.to_string()),
        other => Some(other.to_string()),
    }
}

/// An immutable scene: id, display data, and member expectations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneDefinition {
    /// Unique, stable scene id
    pub id: String,

    /// Display name
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    /// Member entity id to expected snapshot, in definition order
    #[serde(default)]
    pub entities: IndexMap<String, ExpectedSnapshot>,
}

impl SceneDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            icon: None,
            entities: IndexMap::new(),
        }
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    /// Add or replace a member expectation
    pub fn with_entity(mut self, entity_id: impl Into<String>, expected: ExpectedSnapshot) -> Self {
        self.entities.insert(entity_id.into(), expected);
        self
    }

    /// Member entity ids in definition order
    pub fn member_ids(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// A copy of this definition without the members `exclude` rejects
    pub fn filtered(&self, exclude: impl Fn(&str) -> bool) -> Self {
        Self {
            id: self.id.clone(),
            name: self.name.clone(),
            icon: self.icon.clone(),
            entities: self
                .entities
                .iter()
                .filter(|(id, _)| !exclude(id))
                .map(|(id, expected)| (id.clone(), expected.clone()))
                .collect(),
        }
    }
}

/// Comparison options shared by every scene of one tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOptions {
    /// Maximum absolute difference for numeric attributes to still match
    pub number_tolerance: u32,

    /// Treat missing, unavailable and unknown members as ignored
    pub ignore_unavailable: bool,

    /// Compare target state only, never attributes
    pub ignore_attributes: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            number_tolerance: 1,
            ignore_unavailable: false,
            ignore_attributes: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_from_mapping() {
        let snapshot =
            ExpectedSnapshot::from_value(&json!({"state": "on", "brightness": 120, "rgb": [1, 2, 3]}));
        assert_eq!(snapshot.state.as_deref(), Some("on"));
        assert_eq!(snapshot.watched_keys(), vec!["brightness", "rgb"]);
    }

    #[test]
    fn test_snapshot_from_scalars() {
        assert_eq!(ExpectedSnapshot::from_value(&json!(true)).state.as_deref(), Some("on"));
        assert_eq!(ExpectedSnapshot::from_value(&json!(false)).state.as_deref(), Some("off"));
        assert_eq!(ExpectedSnapshot::from_value(&json!(21.5)).state.as_deref(), Some("21.5"));
        assert_eq!(ExpectedSnapshot::from_value(&json!("heat")).state.as_deref(), Some("heat"));
        assert_eq!(ExpectedSnapshot::from_value(&json!(null)), ExpectedSnapshot::default());
    }

    #[test]
    fn test_snapshot_null_state_means_no_expectation() {
        let snapshot = ExpectedSnapshot::from_value(&json!({"state": null, "volume": 0.3}));
        assert!(snapshot.state.is_none());
        assert_eq!(snapshot.watched_keys(), vec!["volume"]);
    }

    #[test]
    fn test_filtered_definition_keeps_order() {
        let scene = SceneDefinition::new("evening", "Evening")
            .with_entity("light.a", ExpectedSnapshot::state("on"))
            .with_entity("switch.circadian_lighting_x", ExpectedSnapshot::state("on"))
            .with_entity("light.b", ExpectedSnapshot::state("off"));

        let filtered = scene.filtered(|id| id.starts_with("switch.circadian"));
        assert_eq!(filtered.member_ids().collect::<Vec<_>>(), vec!["light.a", "light.b"]);
        assert_eq!(scene.entities.len(), 3);
    }
}
