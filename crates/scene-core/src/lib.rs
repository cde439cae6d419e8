//! Core types for stateful scenes
//!
//! This crate provides the fundamental types shared by the scene tracker and
//! the in-process host it runs against: entity [`State`], bus [`Event`]s,
//! [`ServiceCall`]s, and the immutable [`SceneDefinition`] model.

mod event;
mod scene;
mod service_call;
mod state;

pub use event::{Event, EventData, EventType};
pub use scene::{ExpectedSnapshot, MatchOptions, SceneDefinition};
pub use service_call::{target_entity_ids, ServiceCall};
pub use state::State;

/// Key under which a snapshot stores its target state value
pub const ATTR_STATE: &str = "state";

/// State value for an entity that is switched on
pub const STATE_ON: &str = "on";

/// State value for an entity that is switched off
pub const STATE_OFF: &str = "off";

/// State value reported when an entity cannot be reached
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// State value reported when an entity has no known state
pub const STATE_UNKNOWN: &str = "unknown";

/// Domain of scene entities
pub const SCENE_DOMAIN: &str = "scene";

/// Slugify a display name or id the way entity ids are derived from names
///
/// `"Movie Night!"` becomes `"movie_night"`.
pub fn slugify(value: &str) -> String {
    slug::slugify(value).replace('-', "_")
}

/// Return the domain part of an entity id (`light` for `light.kitchen`)
pub fn domain_of(entity_id: &str) -> &str {
    entity_id
        .split_once('.')
        .map(|(domain, _)| domain)
        .unwrap_or(entity_id)
}

/// Standard event types carried on the bus
pub mod events {
    use super::*;

    /// Event type for state changes
    pub const STATE_CHANGED: &str = "state_changed";

    /// Event type for service calls
    pub const CALL_SERVICE: &str = "call_service";

    /// Data for STATE_CHANGED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct StateChangedData {
        pub entity_id: String,
        pub old_state: Option<State>,
        pub new_state: Option<State>,
    }

    impl EventData for StateChangedData {
        fn event_type() -> &'static str {
            STATE_CHANGED
        }
    }

    /// Data for CALL_SERVICE events
    ///
    /// Target entity ids may appear under `target.entity_id` or under
    /// `service_data.entity_id`; both are optional.
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct CallServiceData {
        pub domain: String,
        pub service: String,
        #[serde(default)]
        pub service_data: serde_json::Value,
        #[serde(default)]
        pub target: serde_json::Value,
    }

    impl CallServiceData {
        /// Whether this call is `<domain>.<service>`
        pub fn is(&self, domain: &str, service: &str) -> bool {
            self.domain == domain && self.service == service
        }

        /// All string entity ids named by the call, target first
        pub fn entity_ids(&self) -> Vec<String> {
            target_entity_ids(&self.target, &self.service_data)
        }

        /// The `transition` field in seconds, if present and numeric
        ///
        /// Numeric strings are accepted; anything else is treated as absent.
        pub fn transition(&self) -> Option<f64> {
            match self.service_data.get("transition")? {
                serde_json::Value::Number(n) => n.as_f64(),
                serde_json::Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }
        }
    }

    impl EventData for CallServiceData {
        fn event_type() -> &'static str {
            CALL_SERVICE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::events::CallServiceData;
    use super::*;
    use serde_json::json;

    fn call(service_data: serde_json::Value, target: serde_json::Value) -> CallServiceData {
        CallServiceData {
            domain: "scene".to_string(),
            service: "turn_on".to_string(),
            service_data,
            target,
        }
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Movie Night"), "movie_night");
        assert_eq!(slugify("  Kitchen: Bright!  "), "kitchen_bright");
        assert_eq!(slugify("already_slugged"), "already_slugged");
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of("light.kitchen"), "light");
        assert_eq!(domain_of("scene.movie_night"), "scene");
        assert_eq!(domain_of("nodot"), "nodot");
    }

    #[test]
    fn test_call_entity_ids_from_both_locations() {
        let data = call(
            json!({"entity_id": ["scene.b", 7, "scene.c"]}),
            json!({"entity_id": "scene.a"}),
        );
        assert!(data.is("scene", "turn_on"));
        assert_eq!(data.entity_ids(), vec!["scene.a", "scene.b", "scene.c"]);
    }

    #[test]
    fn test_call_transition_parsing() {
        assert_eq!(call(json!({"transition": 5}), json!(null)).transition(), Some(5.0));
        assert_eq!(
            call(json!({"transition": " 2.5 "}), json!(null)).transition(),
            Some(2.5)
        );
        assert_eq!(call(json!({"transition": "soon"}), json!(null)).transition(), None);
        assert_eq!(call(json!({}), json!(null)).transition(), None);
    }

    #[test]
    fn test_call_service_data_defaults() {
        let data: CallServiceData =
            serde_json::from_value(json!({"domain": "scene", "service": "turn_on"})).unwrap();
        assert!(data.entity_ids().is_empty());
        assert!(data.transition().is_none());
    }
}
