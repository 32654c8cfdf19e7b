//! Hierarchical configuration access and the config repository seam.
//!
//! Configuration documents are JSON; [`Config`] navigates them with
//! dot-separated paths the way the rest of the engine names nested keys
//! (`"structure.id.name"`). The repository trait abstracts where config
//! files live so tests can point the registry at a temp directory.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde_json::Value;

use crate::error::{CinderError, Result};

/// An immutable hierarchical configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    root: Value,
}

impl Config {
    /// Wrap a parsed JSON value.
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    /// The underlying JSON value.
    pub fn as_value(&self) -> &Value {
        &self.root
    }

    /// Parse a JSON document.
    pub fn parse(text: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(text)
            .map_err(|e| CinderError::config(format!("invalid config document: {}", e)))?;
        Ok(Self { root })
    }

    /// Resolve a dot-separated path; the empty path is the root.
    fn resolve(&self, path: &str) -> Option<&Value> {
        let mut current = &self.root;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Whether a path exists.
    pub fn has(&self, path: &str) -> bool {
        self.resolve(path).is_some()
    }

    /// String value at a path; numbers and booleans render as text.
    pub fn get_string(&self, path: &str) -> Option<String> {
        match self.resolve(path)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Unsigned integer at a path; accepts a numeric string.
    pub fn get_u64(&self, path: &str) -> Option<u64> {
        match self.resolve(path)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Boolean at a path; accepts `"true"`/`"false"`/`"1"`/`"0"`.
    pub fn get_bool(&self, path: &str) -> Option<bool> {
        match self.resolve(path)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            Value::Number(n) => match n.as_u64() {
                Some(0) => Some(false),
                Some(1) => Some(true),
                _ => None,
            },
            _ => None,
        }
    }

    /// Child object keys at a path, if it is an object.
    pub fn keys(&self, path: &str) -> Vec<String> {
        match self.resolve(path) {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// The subtree at a path as its own config.
    pub fn child(&self, path: &str) -> Option<Config> {
        self.resolve(path).map(|v| Config::from_value(v.clone()))
    }

    /// Array elements at a path as configs.
    ///
    /// A single object is treated as a one-element array, so a config may
    /// write one attribute without wrapping it in a list.
    pub fn get_array(&self, path: &str) -> Vec<Config> {
        match self.resolve(path) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| Config::from_value(v.clone()))
                .collect(),
            Some(value @ Value::Object(_)) => vec![Config::from_value(value.clone())],
            _ => Vec::new(),
        }
    }
}

/// Where configuration files live and how to load them.
pub trait ConfigRepository: Send + Sync {
    /// Paths configured under `path_setting_name` in the main config.
    fn list(&self, main: &Config, path_setting_name: &str) -> Vec<PathBuf>;

    /// Whether a config file exists.
    fn exists(&self, path: &Path) -> bool;

    /// Last modification time of a config file.
    fn last_modification_time(&self, path: &Path) -> Result<SystemTime>;

    /// Parse a config file; relative paths resolve against `root_dir`.
    fn load(&self, path: &Path, root_dir: &Path) -> Result<Config>;
}

/// Filesystem-backed config repository over JSON documents.
#[derive(Debug, Default)]
pub struct FileConfigRepository;

impl FileConfigRepository {
    pub fn new() -> Self {
        Self
    }

    fn resolve_path(path: &Path, root_dir: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            root_dir.join(path)
        }
    }
}

impl ConfigRepository for FileConfigRepository {
    fn list(&self, main: &Config, path_setting_name: &str) -> Vec<PathBuf> {
        // The setting may hold one path or a list of them.
        if let Some(single) = main.get_string(path_setting_name) {
            return vec![PathBuf::from(single)];
        }
        main.get_array(path_setting_name)
            .iter()
            .filter_map(|entry| entry.get_string(""))
            .map(PathBuf::from)
            .collect()
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn last_modification_time(&self, path: &Path) -> Result<SystemTime> {
        Ok(std::fs::metadata(path)?.modified()?)
    }

    fn load(&self, path: &Path, root_dir: &Path) -> Result<Config> {
        let resolved = Self::resolve_path(path, root_dir);
        let text = std::fs::read_to_string(&resolved)?;
        Config::parse(&text)
    }
}
