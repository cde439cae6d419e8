//! Scene loading and options for stateful scenes
//!
//! Scene definitions are read from YAML with support for the usual custom
//! tags (`!include`, `!include_dir_list`, `!include_dir_merge_list`,
//! `!include_dir_named`, `!env_var`).
//!
//! # Example
//!
//! ```ignore
//! use scene_config::StatefulScenesConfig;
//!
//! let options = StatefulScenesConfig::load("/config")?;
//! options.validate()?;
//! let scenes = options.load_scenes("/config")?;
//! ```

mod error;
mod loader;
mod options;
mod scenes;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_yaml, yaml_files, yaml_to_json, YamlLoader};
pub use options::{StatefulScenesConfig, MAX_NUMBER_TOLERANCE, MAX_SETTLE_TIME, OPTIONS_FILE};
pub use scenes::{dedupe_scenes, load_scenes, parse_scene_items, SceneSource};
