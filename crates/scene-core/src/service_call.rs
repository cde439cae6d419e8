//! Service call type passed to registered service handlers

use serde::{Deserialize, Serialize};

/// A call to a service such as `scene.turn_on`
///
/// Entities can be targeted through `target.entity_id` or through
/// `service_data.entity_id`; [`ServiceCall::entity_ids`] merges both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCall {
    /// The domain the service belongs to (e.g. "scene", "homeassistant")
    pub domain: String,

    /// The service name (e.g. "turn_on")
    pub service: String,

    /// Data passed to the service (entity_id, transition, ...)
    #[serde(default)]
    pub service_data: serde_json::Value,

    /// Explicit target selector, `null` when absent
    #[serde(default)]
    pub target: serde_json::Value,
}

impl ServiceCall {
    pub fn new(
        domain: impl Into<String>,
        service: impl Into<String>,
        service_data: serde_json::Value,
        target: serde_json::Value,
    ) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            service_data,
            target,
        }
    }

    /// Get the full service identifier (domain.service)
    pub fn service_id(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }

    /// Get a typed value from service_data
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.service_data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Entity ids named by the call, target first
    pub fn entity_ids(&self) -> Vec<String> {
        target_entity_ids(&self.target, &self.service_data)
    }
}

/// Collect `entity_id` values from a target selector and service data
///
/// Each location may hold a single string or a list; non-string list items
/// are skipped.
pub fn target_entity_ids(
    target: &serde_json::Value,
    service_data: &serde_json::Value,
) -> Vec<String> {
    let mut ids = Vec::new();
    for location in [target, service_data] {
        match location.get("entity_id") {
            Some(serde_json::Value::String(s)) => ids.push(s.clone()),
            Some(serde_json::Value::Array(arr)) => {
                ids.extend(arr.iter().filter_map(|v| v.as_str().map(String::from)))
            }
            _ => {}
        }
    }
    ids
}
