//! Scene definition loading
//!
//! Only YAML scene items with an `entities:` mapping are understood; anything
//! else (platform scenes, stray values) is skipped.

use crate::error::{ConfigError, ConfigResult};
use crate::loader::{yaml_files, yaml_to_json, YamlLoader};
use scene_core::{slugify, ExpectedSnapshot, SceneDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

const CONFIGURATION_YAML: &str = "configuration.yaml";
const SCENE_KEY: &str = "scene";
const UNNAMED_SCENE: &str = "Unnamed Scene";

/// Where scene definitions are read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneSource {
    /// The `scene:` key of `configuration.yaml`
    #[default]
    ConfigurationYaml,
    /// A standalone YAML file holding a scene list or a single scene
    SceneFile,
    /// A directory of YAML files, each a scene list or a single scene
    SceneDir,
}

impl std::fmt::Display for SceneSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ConfigurationYaml => "configuration_yaml",
            Self::SceneFile => "scene_file",
            Self::SceneDir => "scene_dir",
        })
    }
}

/// Load scenes from `source`, resolving relative paths against `config_dir`
///
/// `path` is the scene file or directory; it is unused for
/// [`SceneSource::ConfigurationYaml`]. The result is already deduplicated.
pub fn load_scenes(
    config_dir: &Path,
    source: SceneSource,
    path: Option<&str>,
) -> ConfigResult<Vec<SceneDefinition>> {
    let mut loader = YamlLoader::new(config_dir);

    let items = match source {
        SceneSource::ConfigurationYaml => {
            let file = loader.resolve(CONFIGURATION_YAML);
            if !file.is_file() {
                return Err(ConfigError::SourceNotFound(format!(
                    "configuration.yaml not found at {}",
                    file.display()
                )));
            }

            let Value::Object(mut root) = yaml_to_json(loader.load_file(&file)?) else {
                return Err(ConfigError::SourceInvalid(
                    "configuration.yaml did not parse to a mapping".to_string(),
                ));
            };

            match root.remove(SCENE_KEY) {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(items)) => items,
                Some(item @ Value::Object(_)) => vec![item],
                Some(_) => {
                    return Err(ConfigError::SourceInvalid(
                        "scene section in configuration.yaml is not a list or mapping"
                            .to_string(),
                    ))
                }
            }
        }
        SceneSource::SceneFile => {
            let file = loader.resolve(required_path(path, "scene_file")?);
            if !file.is_file() {
                return Err(ConfigError::SourceNotFound(format!(
                    "scene file not found: {}",
                    file.display()
                )));
            }

            match yaml_to_json(loader.load_file(&file)?) {
                Value::Null => Vec::new(),
                Value::Array(items) => items,
                item @ Value::Object(_) => vec![item],
                _ => {
                    return Err(ConfigError::SourceInvalid(format!(
                        "scene file did not parse to a list or mapping: {}",
                        file.display()
                    )))
                }
            }
        }
        SceneSource::SceneDir => {
            let dir = loader.resolve(required_path(path, "scene_dir")?);
            if !dir.is_dir() {
                return Err(ConfigError::SourceNotFound(format!(
                    "scene directory not found: {}",
                    dir.display()
                )));
            }

            let mut items = Vec::new();
            for file in yaml_files(&dir)? {
                match yaml_to_json(loader.load_file(&file)?) {
                    Value::Null => {}
                    Value::Array(list) => items.extend(list),
                    item @ Value::Object(_) => items.push(item),
                    _ => warn!(file = %file.display(), "Skipping scene file that is not a list or mapping"),
                }
            }
            items
        }
    };

    let scenes = dedupe_scenes(parse_scene_items(&items));
    info!(source = %source, count = scenes.len(), "Loaded scene definitions");
    Ok(scenes)
}

fn required_path<'a>(path: Option<&'a str>, what: &str) -> ConfigResult<&'a str> {
    path.filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ConfigError::SourceNotFound(format!("no {} configured", what)))
}

/// Parse raw scene items into definitions
///
/// Items that are not mappings or lack an `entities` mapping are skipped.
/// The id is the trimmed `id` field, else the slug of the name, else
/// `scene_<n>` where `n` counts the scenes parsed so far.
pub fn parse_scene_items(items: &[Value]) -> Vec<SceneDefinition> {
    let mut scenes: Vec<SceneDefinition> = Vec::new();

    for item in items {
        let Some(Value::Object(entities)) = item.get("entities") else {
            debug!("Skipping scene item without an entities mapping");
            continue;
        };

        let name = item
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(UNNAMED_SCENE);

        let id = match item.get("id").and_then(Value::as_str).map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let slug = slugify(name);
                if slug.is_empty() {
                    format!("scene_{}", scenes.len() + 1)
                } else {
                    slug
                }
            }
        };

        let mut scene = SceneDefinition::new(id, name);
        if let Some(icon) = item.get("icon").and_then(Value::as_str) {
            scene = scene.with_icon(icon);
        }
        for (entity_id, expected) in entities {
            scene = scene.with_entity(entity_id.clone(), ExpectedSnapshot::from_value(expected));
        }

        scenes.push(scene);
    }

    scenes
}

/// Drop scenes whose id was already seen, keeping the first
pub fn dedupe_scenes(scenes: Vec<SceneDefinition>) -> Vec<SceneDefinition> {
    let mut seen = HashSet::new();
    scenes
        .into_iter()
        .filter(|scene| {
            let first = seen.insert(scene.id.clone());
            if !first {
                warn!(scene_id = %scene.id, "Duplicate scene id, only the first definition is used");
            }
            first
        })
        .collect()
}
