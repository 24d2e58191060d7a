//! File-backed key/value configuration.
//!
//! Keys are dotted paths into a JSON document (`logger.Level`). Values set
//! from the command line live in memory only; `store` persists a single key
//! back into the file it was loaded from.

use crate::error::ConfigError;
use serde_json::{Map, Value};
use std::env;
use std::fs;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, error};

/// Environment variable naming a config file when `--config` is absent.
pub const CONFIG_ENV: &str = "SANDBOXD_CONFIG";

pub const DEFAULT_CONFIG_NAME: &str = "config.json";

#[derive(Debug, Default)]
pub struct Config {
    path: Option<PathBuf>,
    values: RwLock<Value>,
}

impl Config {
    pub fn empty() -> Self {
        Self::from_value(Value::Object(Map::new()))
    }

    pub fn from_value(values: Value) -> Self {
        Self {
            path: None,
            values: RwLock::new(values),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let values = read_document(&path)?;
        debug!(path = %path.display(), "config loaded");
        Ok(Self {
            path: Some(path),
            values: RwLock::new(values),
        })
    }

    /// Locates and loads the configuration for this process.
    pub fn resolve(explicit: Option<&str>) -> Result<Self, ConfigError> {
        let from_env = env::var(CONFIG_ENV).ok().filter(|v| !v.is_empty());
        resolve_in(explicit, from_env.as_deref(), &search_dirs())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read(&self) -> RwLockReadGuard<'_, Value> {
        self.values.read().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        lookup(&self.read(), key).cloned()
    }

    /// Strings as-is, numbers and booleans in their textual form.
    pub fn get_string(&self, key: &str) -> Option<String> {
        match lookup(&self.read(), key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> bool {
        match lookup(&self.read(), key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
            Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
            _ => false,
        }
    }

    /// An array of strings, or a single comma-separated string.
    pub fn get_string_list(&self, key: &str) -> Vec<String> {
        match lookup(&self.read(), key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// In-memory only.
    pub fn set(&self, key: &str, value: Value) {
        let mut values = self.values.write().unwrap_or_else(|p| p.into_inner());
        insert(&mut values, key, value);
    }

    /// Updates `key` in memory and in the backing file. The file is re-read
    /// first so in-memory overrides are not written out with it.
    pub fn store(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        let path = self.path.as_ref().ok_or(ConfigError::NotFileBacked)?;
        let mut document = if path.exists() {
            read_document(path)?
        } else {
            Value::Object(Map::new())
        };
        insert(&mut document, key, value.clone());

        let text = serde_json::to_string_pretty(&document).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.clone(),
            source,
        })?;
        self.set(key, value);
        Ok(())
    }
}

fn read_document(path: &Path) -> Result<Value, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if text.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn lookup<'a>(root: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.').try_fold(root, |node, part| node.get(part))
}

fn insert(root: &mut Value, key: &str, value: Value) {
    let mut parts: Vec<&str> = key.split('.').collect();
    let Some(last) = parts.pop() else {
        return;
    };
    let mut node = root;
    for part in parts {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(last.to_string(), value);
    }
}

/// Working directory, executable directory, and their `config/` children.
pub fn search_dirs() -> Vec<PathBuf> {
    let mut bases = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        bases.push(cwd);
    }
    if let Some(dir) = env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf)) {
        if !bases.contains(&dir) {
            bases.push(dir);
        }
    }
    let nested: Vec<PathBuf> = bases.iter().map(|b| b.join("config")).collect();
    bases.extend(nested);
    bases
}

fn search(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter().map(|d| d.join(name)).find(|p| p.is_file())
}

fn has_separator(name: &str) -> bool {
    name.contains(MAIN_SEPARATOR) || name.contains('/')
}

pub(crate) fn resolve_in(
    explicit: Option<&str>,
    from_env: Option<&str>,
    dirs: &[PathBuf],
) -> Result<Config, ConfigError> {
    let required = explicit.or(from_env).filter(|p| !p.is_empty());
    match required {
        Some(p) if has_separator(p) || explicit.is_none() => {
            let path = PathBuf::from(p);
            if !path.is_file() {
                return Err(ConfigError::NotFound(path));
            }
            Config::load(path)
        }
        Some(name) => match search(name, dirs) {
            Some(path) => Config::load(path),
            None => {
                error!(config = %name, "config file not found, using empty config");
                Ok(Config::empty())
            }
        },
        None => match search(DEFAULT_CONFIG_NAME, dirs) {
            Some(path) => Config::load(path),
            None => Ok(Config::empty()),
        },
    }
}
