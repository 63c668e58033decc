//! Named collections of host functions exposed under a script namespace

use mlua::{Lua, Table};
use std::rc::Rc;
use tracing::debug;

use super::function::{FunctionBinder, FunctionBinding};
use super::surface::namespace_table;

/// A native library: a set of [`FunctionBinding`]s published together.
///
/// Non-global libraries live under their (possibly dotted) name, e.g.
/// `Server.Chat.Broadcast`. Global libraries are merged into `_G`.
#[derive(Debug, Clone)]
pub struct LibraryBinding {
    name: String,
    global: bool,
    functions: Vec<Rc<FunctionBinding>>,
}

impl LibraryBinding {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            global: false,
            functions: Vec::new(),
        }
    }

    /// Merge this library's functions into global scope
    #[must_use]
    pub fn global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }

    #[must_use]
    pub fn function(mut self, binding: FunctionBinding) -> Self {
        self.functions.push(Rc::new(binding));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        self.global
    }

    #[must_use]
    pub fn functions(&self) -> &[Rc<FunctionBinding>] {
        &self.functions
    }

    /// Publish the library into the script global namespace
    pub fn expose<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Table<'lua>> {
        let globals = lua.globals();
        let target = if self.global {
            globals
        } else {
            namespace_table(lua, &globals, &self.name)?
        };

        for binding in &self.functions {
            let function = FunctionBinder::bind(lua, Rc::clone(binding))?;
            target.set(binding.name(), function)?;
        }

        debug!(
            target: "plugins",
            "Exposed library {} ({} functions{})",
            self.name,
            self.functions.len(),
            if self.global { ", global" } else { "" }
        );
        Ok(target)
    }
}
