//! Stateful scenes options
//!
//! Parsed from `stateful_scenes.yaml` in the config directory. Every key is
//! optional; a missing file yields the defaults.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};
use crate::loader::YamlLoader;
use crate::scenes::{load_scenes, SceneSource};
use scene_core::{MatchOptions, SceneDefinition};

/// File holding the options, relative to the config directory
pub const OPTIONS_FILE: &str = "stateful_scenes.yaml";

/// Largest accepted numeric tolerance
pub const MAX_NUMBER_TOLERANCE: u32 = 15;

/// Largest accepted settle time in seconds
pub const MAX_SETTLE_TIME: f64 = 300.0;

/// Options controlling scene loading and matching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatefulScenesConfig {
    pub source: SceneSource,

    /// Scene file for [`SceneSource::SceneFile`], relative to the config dir
    pub scene_file: String,

    /// Scene directory for [`SceneSource::SceneDir`]; empty falls back to
    /// `scene_file`
    pub scene_dir: String,

    pub number_tolerance: u32,

    pub ignore_unavailable: bool,

    pub ignore_attributes: bool,

    /// Seconds a scene is held optimistically active or inactive
    pub settle_time: f64,

    pub exclude_circadian_controls: bool,

    /// Comma-separated glob patterns of members to leave out of every scene
    pub circadian_pattern: String,
}

impl Default for StatefulScenesConfig {
    fn default() -> Self {
        Self {
            source: SceneSource::ConfigurationYaml,
            scene_file: "scenes.yaml".to_string(),
            scene_dir: "scenes".to_string(),
            number_tolerance: 4,
            ignore_unavailable: true,
            ignore_attributes: false,
            settle_time: 1.5,
            exclude_circadian_controls: true,
            circadian_pattern: "switch.circadian_lighting*".to_string(),
        }
    }
}

impl StatefulScenesConfig {
    /// Load options from `stateful_scenes.yaml`, or defaults if it is absent
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let mut loader = YamlLoader::new(config_dir.as_ref());
        let path = loader.resolve(OPTIONS_FILE);
        if !path.is_file() {
            return Ok(Self::default());
        }

        Self::from_yaml(loader.load_file(&path)?)
    }

    /// Parse options from a YAML value; `null` yields the defaults
    pub fn from_yaml(yaml: Value) -> ConfigResult<Self> {
        if yaml.is_null() {
            return Ok(Self::default());
        }

        serde_yaml::from_value(yaml).map_err(|e| ConfigError::InvalidValue {
            key: "stateful_scenes".to_string(),
            reason: e.to_string(),
        })
    }

    /// Check value ranges
    pub fn validate(&self) -> ConfigResult<()> {
        if self.number_tolerance > MAX_NUMBER_TOLERANCE {
            return Err(ConfigError::InvalidValue {
                key: "number_tolerance".to_string(),
                reason: format!("must be between 0 and {}", MAX_NUMBER_TOLERANCE),
            });
        }

        if !(0.0..=MAX_SETTLE_TIME).contains(&self.settle_time) {
            return Err(ConfigError::InvalidValue {
                key: "settle_time".to_string(),
                reason: format!("must be between 0 and {} seconds", MAX_SETTLE_TIME),
            });
        }

        Ok(())
    }

    pub fn match_options(&self) -> MatchOptions {
        MatchOptions {
            number_tolerance: self.number_tolerance,
            ignore_unavailable: self.ignore_unavailable,
            ignore_attributes: self.ignore_attributes,
        }
    }

    pub fn settle_duration(&self) -> Duration {
        // f64::max maps NaN to 0
        Duration::from_secs_f64(self.settle_time.max(0.0).min(MAX_SETTLE_TIME))
    }

    /// Exclusion globs, empty unless circadian exclusion is enabled
    pub fn exclude_patterns(&self) -> Vec<String> {
        if !self.exclude_circadian_controls {
            return Vec::new();
        }

        self.circadian_pattern
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// File or directory the configured source reads from
    pub fn source_path(&self) -> Option<&str> {
        match self.source {
            SceneSource::ConfigurationYaml => None,
            SceneSource::SceneFile => Some(self.scene_file.as_str()),
            SceneSource::SceneDir if self.scene_dir.trim().is_empty() => {
                Some(self.scene_file.as_str())
            }
            SceneSource::SceneDir => Some(self.scene_dir.as_str()),
        }
    }

    /// Load the scene definitions these options point at
    pub fn load_scenes(&self, config_dir: impl AsRef<Path>) -> ConfigResult<Vec<SceneDefinition>> {
        load_scenes(config_dir.as_ref(), self.source, self.source_path())
    }
}
