//! YAML loader with include tag support
//!
//! Scene files are usually split across several documents, so the loader
//! understands the usual include tags:
//! - `!include path`
//! - `!include_dir_list dir`
//! - `!include_dir_merge_list dir`
//! - `!include_dir_named dir`
//! - `!env_var VAR`
//!
//! Relative include paths resolve against the including file's directory.

use crate::error::{ConfigError, ConfigResult};
use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// How the files of an included directory are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirInclude {
    /// One list item per file
    List,
    /// Lists are concatenated, other documents appended as single items
    MergeList,
    /// Mapping keyed by file stem
    Named,
}

/// YAML loader resolving include tags relative to a config directory
pub struct YamlLoader {
    config_dir: PathBuf,
    /// Files currently being loaded, for circular include detection
    loading: HashSet<PathBuf>,
}

impl YamlLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            loading: HashSet::new(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Resolve a path against the config directory unless it is absolute
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_dir.join(path)
        }
    }

    /// Load a YAML file and expand its tags
    ///
    /// An empty document loads as `Value::Null`.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = self.resolve(path);
        debug!(path = %path.display(), "Loading YAML file");

        if self.loading.contains(&path) {
            return Err(ConfigError::CircularInclude { path });
        }

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;

        self.loading.insert(path.clone());
        let result = self.load_str(&content, &path);
        self.loading.remove(&path);

        result
    }

    /// Parse YAML text as if it had been read from `source_path`
    pub fn load_str(&mut self, content: &str, source_path: &Path) -> ConfigResult<Value> {
        if content.trim().is_empty() {
            return Ok(Value::Null);
        }

        let value: Value =
            serde_yaml::from_str(content).map_err(|source| ConfigError::ParseYaml {
                path: source_path.to_path_buf(),
                source,
            })?;

        self.expand(value, source_path)
    }

    fn expand(&mut self, value: Value, source_path: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.expand_tag(*tagged, source_path),
            Value::Mapping(map) => {
                let mut out = Mapping::with_capacity(map.len());
                for (key, value) in map {
                    out.insert(key, self.expand(value, source_path)?);
                }
                Ok(Value::Mapping(out))
            }
            Value::Sequence(items) => items
                .into_iter()
                .map(|item| self.expand(item, source_path))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            other => Ok(other),
        }
    }

    fn expand_tag(&mut self, tagged: TaggedValue, source_path: &Path) -> ConfigResult<Value> {
        let tag = tagged.tag.to_string();
        trace!(tag = %tag, "Expanding tag");

        match tag.as_str() {
            "!include" => {
                let path = self.tag_path(&tagged.value, source_path)?;
                self.load_file(path)
            }
            "!include_dir_list" => self.include_dir(&tagged.value, source_path, DirInclude::List),
            "!include_dir_merge_list" => {
                self.include_dir(&tagged.value, source_path, DirInclude::MergeList)
            }
            "!include_dir_named" => {
                self.include_dir(&tagged.value, source_path, DirInclude::Named)
            }
            "!env_var" => env_var(&tagged.value),
            _ => {
                warn!(tag = %tag, "Unsupported YAML tag, using untagged value");
                self.expand(tagged.value, source_path)
            }
        }
    }

    fn include_dir(
        &mut self,
        value: &Value,
        source_path: &Path,
        kind: DirInclude,
    ) -> ConfigResult<Value> {
        let dir = self.tag_path(value, source_path)?;
        debug!(dir = %dir.display(), kind = ?kind, "Including directory");

        let files = yaml_files(&dir)?;
        match kind {
            DirInclude::List => files
                .iter()
                .map(|file| self.load_file(file))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            DirInclude::MergeList => {
                let mut items = Vec::new();
                for file in &files {
                    match self.load_file(file)? {
                        Value::Sequence(seq) => items.extend(seq),
                        Value::Null => {}
                        other => items.push(other),
                    }
                }
                Ok(Value::Sequence(items))
            }
            DirInclude::Named => {
                let mut named = Mapping::new();
                for file in &files {
                    let stem = file
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or_default()
                        .to_string();
                    named.insert(Value::String(stem), self.load_file(file)?);
                }
                Ok(Value::Mapping(named))
            }
        }
    }

    fn tag_path(&self, value: &Value, source_path: &Path) -> ConfigResult<PathBuf> {
        let Value::String(raw) = value else {
            return Err(ConfigError::InvalidIncludePath {
                path: format!("{:?}", value),
                reason: "path must be a string".to_string(),
            });
        };

        let raw = Path::new(raw);
        if raw.is_absolute() {
            return Ok(raw.to_path_buf());
        }
        let base = source_path.parent().unwrap_or(&self.config_dir);
        Ok(base.join(raw))
    }
}

fn env_var(value: &Value) -> ConfigResult<Value> {
    let Value::String(name) = value else {
        return Err(ConfigError::InvalidValue {
            key: "!env_var".to_string(),
            reason: "environment variable name must be a string".to_string(),
        });
    };

    std::env::var(name)
        .map(Value::String)
        .map_err(|_| ConfigError::EnvVarNotFound { var: name.clone() })
}

/// All `*.yaml` / `*.yml` files of a directory, sorted by path
pub fn yaml_files(dir: &Path) -> ConfigResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(ConfigError::DirectoryNotFound {
            path: dir.to_path_buf(),
        });
    }

    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|source| ConfigError::ReadFile {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
        })
        .collect();

    files.sort();
    Ok(files)
}

/// Convert a YAML value into JSON
///
/// Non-string mapping keys are stringified, tags are dropped and
/// non-finite floats become `null`.
pub fn yaml_to_json(value: Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into()
            } else if let Some(u) = n.as_u64() {
                u.into()
            } else {
                n.as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
        }
        Value::String(s) => serde_json::Value::String(s),
        Value::Sequence(items) => {
            serde_json::Value::Array(items.into_iter().map(yaml_to_json).collect())
        }
        Value::Mapping(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(k, v)| (yaml_key(k), yaml_to_json(v)))
                .collect(),
        ),
        Value::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

fn yaml_key(key: Value) -> String {
    match key {
        Value::String(s) => s,
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "null".to_string(),
        other => serde_yaml::to_string(&other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

/// Load a YAML file relative to `config_dir` with tag expansion
pub fn load_yaml(config_dir: impl Into<PathBuf>, file: impl AsRef<Path>) -> ConfigResult<Value> {
    YamlLoader::new(config_dir).load_file(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn load_json(dir: &TempDir, file: &str) -> serde_json::Value {
        yaml_to_json(load_yaml(dir.path(), file).unwrap())
    }

    #[test]
    fn test_include_file() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "scenes.yaml", "- name: Movie Night\n  entities: {}\n");
        write(dir.path(), "configuration.yaml", "scene: !include scenes.yaml\n");

        let value = load_json(&dir, "configuration.yaml");
        assert_eq!(value["scene"][0]["name"], "Movie Night");
    }

    #[test]
    fn test_include_is_relative_to_including_file() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "packages/living.yaml", "scene: !include scenes/evening.yaml\n");
        write(dir.path(), "packages/scenes/evening.yaml", "name: Evening\n");

        let value = load_json(&dir, "packages/living.yaml");
        assert_eq!(value["scene"]["name"], "Evening");
    }

    #[test]
    fn test_include_dir_merge_list() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "scenes/a.yaml", "- name: A\n- name: B\n");
        write(dir.path(), "scenes/b.yml", "name: C\n");
        write(dir.path(), "scenes/empty.yaml", "");
        write(dir.path(), "scenes/notes.txt", "ignored");
        write(dir.path(), "configuration.yaml", "scene: !include_dir_merge_list scenes\n");

        let value = load_json(&dir, "configuration.yaml");
        let names: Vec<_> = value["scene"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_include_dir_list_and_named() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "scenes/bright.yaml", "name: Bright\n");
        write(dir.path(), "scenes/dim.yaml", "name: Dim\n");
        write(
            dir.path(),
            "configuration.yaml",
            "listed: !include_dir_list scenes\nnamed: !include_dir_named scenes\n",
        );

        let value = load_json(&dir, "configuration.yaml");
        assert_eq!(value["listed"].as_array().unwrap().len(), 2);
        assert_eq!(value["named"]["dim"]["name"], "Dim");
    }

    #[test]
    fn test_env_var() {
        let dir = TempDir::new().unwrap();
        std::env::set_var("SCENE_CONFIG_TEST_ICON", "mdi:movie");
        write(dir.path(), "scene.yaml", "icon: !env_var SCENE_CONFIG_TEST_ICON\n");

        let value = load_json(&dir, "scene.yaml");
        assert_eq!(value["icon"], "mdi:movie");
        std::env::remove_var("SCENE_CONFIG_TEST_ICON");

        write(dir.path(), "missing.yaml", "icon: !env_var SCENE_CONFIG_TEST_UNSET\n");
        let result = load_yaml(dir.path(), "missing.yaml");
        assert!(matches!(result, Err(ConfigError::EnvVarNotFound { .. })));
    }

    #[test]
    fn test_circular_include_detection() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.yaml", "next: !include b.yaml\n");
        write(dir.path(), "b.yaml", "next: !include a.yaml\n");

        let result = load_yaml(dir.path(), "a.yaml");
        assert!(matches!(result, Err(ConfigError::CircularInclude { .. })));
    }

    #[test]
    fn test_missing_include_dir() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "configuration.yaml", "scene: !include_dir_list nowhere\n");

        let result = load_yaml(dir.path(), "configuration.yaml");
        assert!(matches!(result, Err(ConfigError::DirectoryNotFound { .. })));
    }

    #[test]
    fn test_empty_file_is_null() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "scenes.yaml", "\n\n");
        assert_eq!(load_yaml(dir.path(), "scenes.yaml").unwrap(), Value::Null);
    }

    #[test]
    fn test_yaml_to_json_keys_and_numbers() {
        let yaml: Value = serde_yaml::from_str(
            "1: one\ntrue: yes\nbrightness: 128\nlevel: 0.5\ncolor: [255, 0, 0]\n",
        )
        .unwrap();

        assert_eq!(
            yaml_to_json(yaml),
            json!({
                "1": "one",
                "true": "yes",
                "brightness": 128,
                "level": 0.5,
                "color": [255, 0, 0]
            })
        );
    }
}
