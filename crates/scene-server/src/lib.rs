//! Stateful scenes server
//!
//! Wires the in-process host, the scene loader and the tracker together and
//! presents every tracked scene as a switch.

pub mod server;
pub mod switch;

pub use server::{StatefulScenes, DOMAIN};
pub use switch::{switch_entity_id, SceneSwitches, SWITCH_DOMAIN};
