//! Values crossing the host/script boundary and the coercion rules between them

use mlua::{Lua, Table, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::fmt;
use tracing::warn;

use crate::error::ConversionFailure;

/// Nesting limit when walking script tables. Deeper levels become `Void`.
pub const MAX_DEPTH: usize = 32;

/// A host-side dynamic value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HostValue {
    /// Nothing / nil / undefined
    #[default]
    Void,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<HostValue>),
    Map(BTreeMap<String, HostValue>),
}

impl HostValue {
    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self, HostValue::Void)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HostValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            HostValue::Float(f) => Some(*f),
            #[allow(clippy::cast_precision_loss)]
            HostValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[HostValue]> {
        match self {
            HostValue::List(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, HostValue>> {
        match self {
            HostValue::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

impl From<i64> for HostValue {
    fn from(value: i64) -> Self {
        HostValue::Int(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::Float(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::Str(value.to_string())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        HostValue::Str(value)
    }
}

/// Declared type of a bound function parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Bool,
    Int,
    Float,
    Str,
    List,
    Map,
    /// Accept whatever the script passes, converted naturally
    Any,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamType::Bool => "boolean",
            ParamType::Int => "integer",
            ParamType::Float => "number",
            ParamType::Str => "string",
            ParamType::List => "list",
            ParamType::Map => "table",
            ParamType::Any => "any",
        };
        f.write_str(name)
    }
}

/// One formal parameter of a bound function
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
    /// Used when the script omits the argument or passes nil
    pub default: Option<HostValue>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, ty: ParamType, default: HostValue) -> Self {
        Self {
            name: name.into(),
            ty,
            default: Some(default),
        }
    }
}

/// Convert one script argument to the host type a parameter requires.
///
/// Order: exact match, numeric conversion, string parsing, then structural
/// table conversion for `List`/`Map` parameters.
pub fn coerce(value: Option<&Value<'_>>, param: &ParamSpec) -> Result<HostValue, ConversionFailure> {
    let value = match value {
        None | Some(Value::Nil) => {
            return param.default.clone().ok_or(ConversionFailure::Missing);
        }
        Some(v) => v,
    };

    match (param.ty, value) {
        (ParamType::Any, v) => Ok(from_script(v)),

        // exact
        (ParamType::Bool, Value::Boolean(b)) => Ok(HostValue::Bool(*b)),
        (ParamType::Int, Value::Integer(i)) => Ok(HostValue::Int(*i)),
        (ParamType::Float, Value::Number(n)) => Ok(HostValue::Float(*n)),
        (ParamType::Str, Value::String(s)) => Ok(HostValue::Str(s.to_string_lossy().into_owned())),

        // numeric
        #[allow(clippy::cast_precision_loss)]
        (ParamType::Float, Value::Integer(i)) => Ok(HostValue::Float(*i as f64)),
        (ParamType::Int, Value::Number(n)) => integral(*n).map(HostValue::Int),

        // string parsing
        (ParamType::Bool, Value::String(s)) => {
            let text = s.to_string_lossy();
            match text.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(HostValue::Bool(true)),
                "false" => Ok(HostValue::Bool(false)),
                _ => Err(unparsable(ParamType::Bool, &text)),
            }
        }
        (ParamType::Int, Value::String(s)) => {
            let text = s.to_string_lossy();
            let trimmed = text.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return Ok(HostValue::Int(i));
            }
            match trimmed.parse::<f64>() {
                Ok(n) => integral(n).map(HostValue::Int),
                Err(_) => Err(unparsable(ParamType::Int, &text)),
            }
        }
        (ParamType::Float, Value::String(s)) => {
            let text = s.to_string_lossy();
            text.trim()
                .parse::<f64>()
                .map(HostValue::Float)
                .map_err(|_| unparsable(ParamType::Float, &text))
        }

        // structural
        (ParamType::Map, Value::Table(t)) => Ok(HostValue::Map(walk_root(t, table_to_map))),
        (ParamType::List, Value::Table(t)) => Ok(HostValue::List(walk_root(t, table_to_list))),

        (expected, other) => Err(ConversionFailure::Mismatch {
            expected,
            found: other.type_name(),
        }),
    }
}

fn unparsable(expected: ParamType, input: &str) -> ConversionFailure {
    ConversionFailure::Unparsable {
        expected,
        input: input.to_string(),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn integral(n: f64) -> Result<i64, ConversionFailure> {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 {
        Ok(n as i64)
    } else {
        Err(ConversionFailure::OutOfRange(n))
    }
}

/// Natural script → host conversion. Functions, userdata and threads have no
/// host counterpart and become `Void`.
pub fn from_script(value: &Value<'_>) -> HostValue {
    from_script_at(value, &mut TablePath::default())
}

/// Tables currently being walked, outermost first. Its length is the depth.
#[derive(Default)]
pub(crate) struct TablePath(Vec<*const c_void>);

impl TablePath {
    /// Step into `table`. Returns `false` when the walk must stop there,
    /// either because the table is already on the path or the nesting limit
    /// is reached.
    pub(crate) fn enter(&mut self, table: &Table<'_>) -> bool {
        let ptr = table.to_pointer();
        if self.0.contains(&ptr) {
            warn!(target: "plugins", "Cyclic table reference dropped");
            return false;
        }
        if self.0.len() >= MAX_DEPTH {
            warn!(target: "plugins", "Table nesting deeper than {} levels truncated", MAX_DEPTH);
            return false;
        }
        self.0.push(ptr);
        true
    }

    pub(crate) fn leave(&mut self) {
        self.0.pop();
    }
}

fn walk_root<'lua, T, F>(table: &Table<'lua>, walk: F) -> T
where
    T: Default,
    F: FnOnce(&Table<'lua>, &mut TablePath) -> T,
{
    let mut path = TablePath::default();
    if !path.enter(table) {
        return T::default();
    }
    walk(table, &mut path)
}

fn from_script_at(value: &Value<'_>, path: &mut TablePath) -> HostValue {
    match value {
        Value::Boolean(b) => HostValue::Bool(*b),
        Value::Integer(i) => HostValue::Int(*i),
        Value::Number(n) => HostValue::Float(*n),
        Value::String(s) => HostValue::Str(s.to_string_lossy().into_owned()),
        Value::Table(t) => {
            if !path.enter(t) {
                return HostValue::Void;
            }
            let converted = if is_sequence(t) {
                HostValue::List(table_to_list(t, path))
            } else {
                HostValue::Map(table_to_map(t, path))
            };
            path.leave();
            converted
        }
        _ => HostValue::Void,
    }
}

/// A non-empty table whose keys are exactly 1..n
pub fn is_sequence(table: &Table<'_>) -> bool {
    let len = table.raw_len();
    if len == 0 {
        return false;
    }
    let mut count = 0usize;
    for pair in table.clone().pairs::<Value, Value>() {
        match pair {
            Ok((Value::Integer(i), _)) if i >= 1 && usize::try_from(i).is_ok_and(|i| i <= len) => {
                count += 1;
            }
            _ => return false,
        }
    }
    count == len
}

/// Stringify a table key. Only string and number keys have a host form.
pub fn key_to_string(key: &Value<'_>) -> Option<String> {
    match key {
        Value::String(s) => Some(s.to_string_lossy().into_owned()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn table_to_map(table: &Table<'_>, path: &mut TablePath) -> BTreeMap<String, HostValue> {
    let mut map = BTreeMap::new();
    for pair in table.clone().pairs::<Value, Value>() {
        let Ok((key, value)) = pair else { continue };
        let Some(key) = key_to_string(&key) else { continue };
        let converted = from_script_at(&value, path);
        if !converted.is_void() {
            map.insert(key, converted);
        }
    }
    map
}

fn table_to_list(table: &Table<'_>, path: &mut TablePath) -> Vec<HostValue> {
    table
        .clone()
        .sequence_values::<Value>()
        .filter_map(Result::ok)
        .map(|v| from_script_at(&v, path))
        .collect()
}

/// Host → script conversion
pub fn to_script<'lua>(lua: &'lua Lua, value: &HostValue) -> mlua::Result<Value<'lua>> {
    Ok(match value {
        HostValue::Void => Value::Nil,
        HostValue::Bool(b) => Value::Boolean(*b),
        HostValue::Int(i) => Value::Integer(*i),
        HostValue::Float(f) => Value::Number(*f),
        HostValue::Str(s) => Value::String(lua.create_string(s)?),
        HostValue::List(items) => {
            let table = lua.create_table()?;
            for (idx, item) in items.iter().enumerate() {
                table.raw_set(idx + 1, to_script(lua, item)?)?;
            }
            Value::Table(table)
        }
        HostValue::Map(map) => {
            let table = lua.create_table()?;
            for (key, item) in map {
                table.raw_set(key.as_str(), to_script(lua, item)?)?;
            }
            Value::Table(table)
        }
    })
}
