//! Built-in components of the in-process host
//!
//! Scene entities with `scene.turn_on`, and the generic
//! `homeassistant.turn_on` / `homeassistant.turn_off` services used to
//! switch scene members.

mod homeassistant;
mod scene;

pub use homeassistant::register_homeassistant_services;
pub use scene::{register_scene_services, SceneEntities};
