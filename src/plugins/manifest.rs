//! Plugin metadata declared on the module's main object, and its validation

use mlua::{Table, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

use crate::error::LoadError;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap_or_else(|_| unreachable!("identifier pattern is valid"))
});

/// Derive a module name from its file stem. The stem must be a Lua identifier
/// because the script declares a global of the same name.
pub fn module_name(path: &Path) -> Result<String, LoadError> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    if IDENTIFIER.is_match(stem) {
        Ok(stem.to_string())
    } else {
        Err(LoadError::InvalidName(stem.to_string()))
    }
}

/// A `major.minor.patch` triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VersionNumber {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl VersionNumber {
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Accepts `{1, 0, 0}`, `{Major = 1, Minor = 0, Patch = 0}` or `"1.0.0"`
    pub fn from_script(value: &Value<'_>) -> Option<Self> {
        match value {
            Value::String(s) => s.to_str().ok()?.parse().ok(),
            Value::Table(t) => {
                let part = |idx: i64, key: &str| -> Option<u32> {
                    let value = match t.get::<_, Value>(idx).ok()? {
                        Value::Nil => t.get::<_, Value>(key).ok()?,
                        v => v,
                    };
                    component(&value)
                };
                Some(Self {
                    major: part(1, "Major")?,
                    minor: part(2, "Minor")?,
                    patch: part(3, "Patch")?,
                })
            }
            _ => None,
        }
    }
}

fn component(value: &Value<'_>) -> Option<u32> {
    match value {
        Value::Integer(i) => u32::try_from(*i).ok(),
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Value::Number(n) if n.fract() == 0.0 && *n >= 0.0 && *n <= f64::from(u32::MAX) => Some(*n as u32),
        _ => None,
    }
}

impl FromStr for VersionNumber {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(format!("expected major.minor.patch, got '{s}'"));
        }
        let parse = |p: &str| p.parse::<u32>().map_err(|e| format!("bad version component '{p}': {e}"));
        Ok(Self {
            major: parse(parts[0])?,
            minor: parse(parts[1])?,
            patch: parse(parts[2])?,
        })
    }
}

impl fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Metadata every plugin must declare, validated before a module exists
#[derive(Debug, Clone, PartialEq)]
pub struct PluginManifest {
    pub name: String,
    pub title: String,
    pub author: String,
    pub version: VersionNumber,
    pub resource_id: Option<i64>,
    pub has_config: bool,
}

impl PluginManifest {
    /// Check the main object's declared properties.
    ///
    /// `Title` and `Author` must be strings and `Version` a valid triple.
    /// `ResourceId` and `HasConfig` are optional; a wrongly typed optional
    /// property is ignored with a warning.
    pub fn validate(name: &str, object: &Table<'_>) -> Result<Self, LoadError> {
        let required_string = |field: &'static str| -> Result<String, LoadError> {
            match object.get::<_, Value>(field)? {
                Value::String(s) => Ok(s.to_string_lossy().into_owned()),
                _ => Err(LoadError::MissingMetadata {
                    name: name.to_string(),
                    field,
                }),
            }
        };

        let title = required_string("Title")?;
        let author = required_string("Author")?;

        let version = VersionNumber::from_script(&object.get::<_, Value>("Version")?).ok_or_else(|| {
            LoadError::MissingVersion {
                name: name.to_string(),
            }
        })?;

        let resource_id = match object.get::<_, Value>("ResourceId")? {
            Value::Nil => None,
            Value::Integer(i) => Some(i),
            #[allow(clippy::cast_possible_truncation)]
            Value::Number(n) if n.fract() == 0.0 => Some(n as i64),
            other => {
                warn!(target: "plugins", "{}: ignoring ResourceId of type {}", name, other.type_name());
                None
            }
        };

        let has_config = match object.get::<_, Value>("HasConfig")? {
            Value::Nil => false,
            Value::Boolean(b) => b,
            other => {
                warn!(target: "plugins", "{}: ignoring HasConfig of type {}", name, other.type_name());
                false
            }
        };

        Ok(Self {
            name: name.to_string(),
            title,
            author,
            version,
            resource_id,
            has_config,
        })
    }
}
