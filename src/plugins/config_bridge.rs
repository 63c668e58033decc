//! Persisted plugin configuration and its conversion to and from script tables

use mlua::{Lua, Table, Value};
use serde_yaml::{Mapping, Number, Value as YamlValue};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::binding::value::{is_sequence, key_to_string, TablePath, MAX_DEPTH};
use crate::error::ConfigError;

/// Ordered string-keyed configuration for one plugin
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigStore {
    entries: Mapping,
}

impl ConfigStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&YamlValue> {
        self.entries.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<YamlValue>) {
        self.entries.insert(YamlValue::String(key.into()), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<YamlValue> {
        self.entries.remove(key)
    }

    /// Keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().filter_map(YamlValue::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn as_mapping(&self) -> &Mapping {
        &self.entries
    }
}

impl From<Mapping> for ConfigStore {
    fn from(entries: Mapping) -> Self {
        Self { entries }
    }
}

/// Where plugin configurations are persisted, keyed by plugin name
pub trait ConfigStorage {
    /// `Ok(None)` when nothing has been saved for `name` yet
    fn load(&self, name: &str) -> Result<Option<ConfigStore>, ConfigError>;

    fn save(&self, name: &str, store: &ConfigStore) -> Result<(), ConfigError>;

    fn exists(&self, name: &str) -> bool;
}

/// One YAML file per plugin: `<dir>/<name>.yaml`
#[derive(Debug, Clone)]
pub struct YamlConfigStorage {
    dir: PathBuf,
}

impl YamlConfigStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.yaml"))
    }
}

impl ConfigStorage for YamlConfigStorage {
    fn load(&self, name: &str) -> Result<Option<ConfigStore>, ConfigError> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        if contents.trim().is_empty() {
            return Ok(Some(ConfigStore::new()));
        }

        match serde_yaml::from_str::<YamlValue>(&contents) {
            Ok(YamlValue::Mapping(entries)) => Ok(Some(ConfigStore::from(entries))),
            Ok(YamlValue::Null) => Ok(Some(ConfigStore::new())),
            Ok(_) => Err(ConfigError::NotAMapping(path)),
            Err(source) => Err(ConfigError::Yaml { path, source }),
        }
    }

    fn save(&self, name: &str, store: &ConfigStore) -> Result<(), ConfigError> {
        let path = self.path_for(name);
        let contents = serde_yaml::to_string(store.as_mapping()).map_err(|source| ConfigError::Yaml {
            path: path.clone(),
            source,
        })?;

        fs::create_dir_all(&self.dir).map_err(|source| ConfigError::Io {
            path: self.dir.clone(),
            source,
        })?;
        fs::write(&path, contents).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        debug!(target: "plugins", "Saved config for {} to {}", name, path.display());
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.path_for(name).exists()
    }
}

/// Converts between a [`ConfigStore`] and a plugin's `Config` table
pub struct ConfigBridge;

impl ConfigBridge {
    /// Build a fresh script table from the store. Null entries have no script
    /// form and are left out.
    pub fn to_table<'lua>(lua: &'lua Lua, store: &ConfigStore) -> mlua::Result<Table<'lua>> {
        mapping_to_table(lua, store.as_mapping(), 0)
    }

    /// Replace the store's contents with the table's. Keys absent from the
    /// table, and values with no persisted form (functions, userdata), are
    /// dropped. Keys are written in sorted order so saved files are stable.
    ///
    /// An empty table has no shape of its own. It is saved as `[]` when the
    /// value it replaces was a sequence and as `{}` otherwise.
    pub fn from_table(table: &Table<'_>, store: &mut ConfigStore) {
        let previous = YamlValue::Mapping(std::mem::take(&mut store.entries));
        let mut path = TablePath::default();
        if !path.enter(table) {
            return;
        }
        for (key, value) in sorted_pairs(table) {
            let hint = previous.get(key.as_str());
            if let Some(converted) = to_yaml(&value, hint, &mut path) {
                store.set(key, converted);
            }
        }
    }
}

fn sorted_pairs<'lua>(table: &Table<'lua>) -> Vec<(String, Value<'lua>)> {
    let mut pairs: Vec<(String, Value<'lua>)> = table
        .clone()
        .pairs::<Value, Value>()
        .filter_map(Result::ok)
        .filter_map(|(k, v)| key_to_string(&k).map(|k| (k, v)))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
}

fn to_yaml(value: &Value<'_>, hint: Option<&YamlValue>, path: &mut TablePath) -> Option<YamlValue> {
    match value {
        Value::Boolean(b) => Some(YamlValue::Bool(*b)),
        Value::Integer(i) => Some(YamlValue::Number(Number::from(*i))),
        Value::Number(n) => Some(YamlValue::Number(Number::from(*n))),
        Value::String(s) => Some(YamlValue::String(s.to_string_lossy().into_owned())),
        Value::Table(t) => {
            if !path.enter(t) {
                return None;
            }
            let converted = table_to_yaml(t, hint, path);
            path.leave();
            Some(converted)
        }
        _ => None,
    }
}

fn table_to_yaml(table: &Table<'_>, hint: Option<&YamlValue>, path: &mut TablePath) -> YamlValue {
    if is_sequence(table) {
        let items = table
            .clone()
            .sequence_values::<Value>()
            .filter_map(Result::ok)
            .enumerate()
            .filter_map(|(idx, v)| to_yaml(&v, hint.and_then(|h| h.get(idx)), path))
            .collect();
        return YamlValue::Sequence(items);
    }
    let empty = table.clone().pairs::<Value, Value>().next().is_none();
    if empty && matches!(hint, Some(YamlValue::Sequence(_))) {
        return YamlValue::Sequence(Vec::new());
    }
    let mut mapping = Mapping::new();
    for (key, item) in sorted_pairs(table) {
        let item_hint = hint.and_then(|h| h.get(key.as_str()));
        if let Some(converted) = to_yaml(&item, item_hint, path) {
            mapping.insert(YamlValue::String(key), converted);
        }
    }
    YamlValue::Mapping(mapping)
}

fn mapping_to_table<'lua>(lua: &'lua Lua, mapping: &Mapping, depth: usize) -> mlua::Result<Table<'lua>> {
    let table = lua.create_table()?;
    for (key, value) in mapping {
        let key = match key {
            YamlValue::String(s) => s.clone(),
            YamlValue::Number(n) => n.to_string(),
            YamlValue::Bool(b) => b.to_string(),
            _ => continue,
        };
        let converted = yaml_to_script(lua, value, depth + 1)?;
        if !matches!(converted, Value::Nil) {
            table.set(key, converted)?;
        }
    }
    Ok(table)
}

fn yaml_to_script<'lua>(lua: &'lua Lua, value: &YamlValue, depth: usize) -> mlua::Result<Value<'lua>> {
    if depth > MAX_DEPTH {
        return Ok(Value::Nil);
    }
    Ok(match value {
        YamlValue::Null => Value::Nil,
        YamlValue::Bool(b) => Value::Boolean(*b),
        YamlValue::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        },
        YamlValue::String(s) => Value::String(lua.create_string(s)?),
        YamlValue::Sequence(items) => {
            let table = lua.create_table()?;
            for (idx, item) in items.iter().enumerate() {
                table.raw_set(idx + 1, yaml_to_script(lua, item, depth + 1)?)?;
            }
            Value::Table(table)
        }
        YamlValue::Mapping(mapping) => Value::Table(mapping_to_table(lua, mapping, depth)?),
        YamlValue::Tagged(tagged) => yaml_to_script(lua, &tagged.value, depth)?,
    })
}
