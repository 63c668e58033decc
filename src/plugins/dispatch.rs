//! Routing a named hook into one plugin module

use mlua::{Lua, MultiValue, Value};
use tracing::{trace, warn};

use super::module::PluginModule;
use crate::binding::{from_script, to_script, HostValue};

/// Outcome of dispatching one hook to one module
#[derive(Debug, Clone, PartialEq)]
pub enum HookResult {
    /// The module does not implement the hook. Not an error.
    Unhandled,
    /// The handler ran; `Void` when it returned nothing
    Value(HostValue),
    /// The handler raised an error, already logged
    Faulted(String),
}

impl HookResult {
    #[must_use]
    pub fn is_handled(&self) -> bool {
        matches!(self, HookResult::Value(_))
    }

    /// The handler's return value, if it produced a non-void one
    #[must_use]
    pub fn into_value(self) -> Option<HostValue> {
        match self {
            HookResult::Value(v) if !v.is_void() => Some(v),
            _ => None,
        }
    }
}

pub struct HookDispatcher;

impl HookDispatcher {
    /// Call `hook` on `module` if it exports it and the member is still a
    /// function. The handler receives the main object first, then `args`.
    ///
    /// Errors never escape: a failing handler is logged with the module's
    /// identity and reported as [`HookResult::Faulted`].
    pub fn dispatch(lua: &Lua, module: &PluginModule, hook: &str, args: &[HostValue]) -> HookResult {
        if !module.exports_hook(hook) {
            return HookResult::Unhandled;
        }

        match Self::call(lua, module, hook, args) {
            Ok(Some(value)) => HookResult::Value(value),
            Ok(None) => {
                trace!(target: "plugins", "{}.{} is no longer callable", module.name(), hook);
                HookResult::Unhandled
            }
            Err(e) => {
                warn!(
                    target: "plugins",
                    "Failed to call hook '{}' on plugin '{} v{}': {}",
                    hook,
                    module.name(),
                    module.version(),
                    e
                );
                HookResult::Faulted(e.to_string())
            }
        }
    }

    fn call(lua: &Lua, module: &PluginModule, hook: &str, args: &[HostValue]) -> mlua::Result<Option<HostValue>> {
        let Some(object) = module.object(lua)? else {
            return Ok(None);
        };
        let Value::Function(handler) = object.raw_get::<_, Value>(hook)? else {
            return Ok(None);
        };

        let mut call_args = Vec::with_capacity(args.len() + 1);
        call_args.push(Value::Table(object));
        for arg in args {
            call_args.push(to_script(lua, arg)?);
        }

        let results: MultiValue = handler.call(MultiValue::from_vec(call_args))?;
        Ok(Some(
            results
                .into_iter()
                .next()
                .map_or(HostValue::Void, |v| from_script(&v)),
        ))
    }
}
