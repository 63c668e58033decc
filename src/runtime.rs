//! The embedded Lua runtime shared by every plugin
//!
//! One `ScriptRuntime` exists per host process. It is created once, borrowed
//! by the binders and plugin modules, and torn down on shutdown.

use anyhow::Result;
use mlua::{Function, Lua, Value};
use tracing::{debug, warn};

/// Owner of the process-wide Lua state
pub struct ScriptRuntime {
    lua: Lua,
    sandboxed: bool,
}

impl ScriptRuntime {
    /// Create a runtime, optionally stripping process-level functions
    pub fn new(sandbox: bool) -> Result<Self> {
        let lua = Lua::new();

        if sandbox {
            lua.load(
                r#"
                -- Disable dangerous functions
                os.execute = nil
                os.exit = nil
                io.popen = nil
                loadfile = nil
                dofile = nil
            "#,
            )
            .set_name("=sandbox")
            .exec()?;
        }

        debug!(target: "plugins", "Script runtime created (sandbox: {})", sandbox);
        Ok(Self { lua, sandboxed: sandbox })
    }

    #[must_use]
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    #[must_use]
    pub fn is_sandboxed(&self) -> bool {
        self.sandboxed
    }

    /// Compile `source` without running it. `name` shows up in error messages
    /// and tracebacks.
    pub fn compile<'lua>(&'lua self, source: &str, name: &str) -> mlua::Result<Function<'lua>> {
        self.lua.load(source).set_name(format!("@{name}")).into_function()
    }

    /// Read a global by name, `Nil` when absent
    pub fn global<'lua>(&'lua self, name: &str) -> mlua::Result<Value<'lua>> {
        self.lua.globals().get(name)
    }

    /// Release the Lua state. Any plugin still registered must be unloaded first.
    pub fn teardown(self) {
        if let Err(e) = self.lua.gc_collect() {
            warn!(target: "plugins", "Final garbage collection failed: {}", e);
        }
        debug!(
            target: "plugins",
            "Script runtime torn down ({} KiB in use)",
            self.lua.used_memory() / 1024
        );
    }
}
