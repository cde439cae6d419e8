//! Error types for the scene tracker

use scene_service_registry::ServiceError;
use thiserror::Error;

/// Errors returned by tracker commands
#[derive(Debug, Clone, Error)]
pub enum TrackerError {
    #[error("unknown scene: {0}")]
    UnknownScene(String),

    /// No scene entity could be found to activate
    #[error("no scene entity resolved for scene {0}")]
    UnresolvedTarget(String),

    /// The activation command failed; the optimistic window stays in place
    #[error("activating scene {scene_id} failed: {source}")]
    Dispatch {
        scene_id: String,
        #[source]
        source: HostError,
    },

    #[error("invalid exclusion pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Errors reported by a [`crate::SceneHost`]
#[derive(Debug, Clone, Error)]
pub enum HostError {
    #[error(transparent)]
    Service(#[from] ServiceError),
}
