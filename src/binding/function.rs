//! Host functions exposed to scripts with automatic argument/return marshaling

use anyhow::{anyhow, Result};
use mlua::{Function, Lua, MultiValue, Value};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use super::value::{coerce, to_script, HostValue, ParamSpec, ParamType};
use crate::error::ArgumentConversionError;

/// Converted arguments handed to a host function, one per declared parameter
#[derive(Debug, Clone, Copy)]
pub struct Args<'a>(&'a [HostValue]);

impl<'a> Args<'a> {
    #[must_use]
    pub fn new(values: &'a [HostValue]) -> Self {
        Self(values)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> &'a HostValue {
        const VOID: &HostValue = &HostValue::Void;
        self.0.get(idx).unwrap_or(VOID)
    }

    pub fn int(&self, idx: usize) -> Result<i64> {
        self.get(idx)
            .as_int()
            .ok_or_else(|| anyhow!("argument {} is not an integer", idx + 1))
    }

    pub fn float(&self, idx: usize) -> Result<f64> {
        self.get(idx)
            .as_float()
            .ok_or_else(|| anyhow!("argument {} is not a number", idx + 1))
    }

    pub fn bool(&self, idx: usize) -> Result<bool> {
        self.get(idx)
            .as_bool()
            .ok_or_else(|| anyhow!("argument {} is not a boolean", idx + 1))
    }

    pub fn str(&self, idx: usize) -> Result<&'a str> {
        self.get(idx)
            .as_str()
            .ok_or_else(|| anyhow!("argument {} is not a string", idx + 1))
    }

    pub fn map(&self, idx: usize) -> Result<&'a BTreeMap<String, HostValue>> {
        self.get(idx)
            .as_map()
            .ok_or_else(|| anyhow!("argument {} is not a table", idx + 1))
    }
}

/// The host side of a binding. Receives the runtime so reserved plugin methods
/// can read script state.
pub type Invoker = Rc<dyn Fn(&Lua, Args<'_>) -> Result<HostValue>>;

/// A host function with its parameter signature. Immutable once built.
#[derive(Clone)]
pub struct FunctionBinding {
    name: String,
    params: Vec<ParamSpec>,
    invoker: Invoker,
}

impl fmt::Debug for FunctionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionBinding")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl FunctionBinding {
    pub fn new<F>(name: impl Into<String>, invoker: F) -> Self
    where
        F: Fn(&Lua, Args<'_>) -> Result<HostValue> + 'static,
    {
        Self {
            name: name.into(),
            params: Vec::new(),
            invoker: Rc::new(invoker),
        }
    }

    /// Append a required parameter
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, ty: ParamType) -> Self {
        self.params.push(ParamSpec::required(name, ty));
        self
    }

    /// Append a parameter that falls back to `default` when omitted
    #[must_use]
    pub fn optional(mut self, name: impl Into<String>, ty: ParamType, default: HostValue) -> Self {
        self.params.push(ParamSpec::optional(name, ty, default));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Number of parameters without a default
    #[must_use]
    pub fn required_count(&self) -> usize {
        self.params.iter().filter(|p| p.default.is_none()).count()
    }

    /// Convert script arguments into `out`, one entry per formal parameter.
    /// Surplus arguments are ignored.
    pub fn convert_arguments(
        &self,
        args: &[Value<'_>],
        out: &mut Vec<HostValue>,
    ) -> Result<(), ArgumentConversionError> {
        out.clear();
        for (idx, param) in self.params.iter().enumerate() {
            let converted = coerce(args.get(idx), param).map_err(|failure| ArgumentConversionError {
                function: self.name.clone(),
                position: idx + 1,
                parameter: param.name.clone(),
                failure,
            })?;
            out.push(converted);
        }
        Ok(())
    }

    /// Call the host function with already converted arguments
    pub fn invoke(&self, lua: &Lua, args: &[HostValue]) -> Result<HostValue> {
        (self.invoker)(lua, Args::new(args))
    }
}

/// Turns [`FunctionBinding`]s into script-callable functions
pub struct FunctionBinder;

impl FunctionBinder {
    /// Wrap `binding` as a Lua function.
    ///
    /// Conversion failures are raised as [`ArgumentConversionError`] inside the
    /// calling script; host faults are raised as runtime errors naming the
    /// function. Neither unwinds through the host.
    pub fn bind<'lua>(lua: &'lua Lua, binding: Rc<FunctionBinding>) -> mlua::Result<Function<'lua>> {
        let buffer = RefCell::new(Vec::with_capacity(binding.params.len()));

        lua.create_function(move |lua, args: MultiValue| {
            let args = args.into_vec();
            // taken rather than borrowed so a re-entrant call gets its own buffer
            let mut converted = buffer.take();

            let result = match binding.convert_arguments(&args, &mut converted) {
                Ok(()) => binding.invoke(lua, &converted).map_err(|e| {
                    mlua::Error::external(e.context(format!("host function '{}' failed", binding.name)))
                }),
                Err(e) => Err(mlua::Error::external(e)),
            };

            converted.clear();
            *buffer.borrow_mut() = converted;

            to_script(lua, &result?)
        })
    }
}
