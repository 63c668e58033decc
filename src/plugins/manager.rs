use mlua::Lua;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use super::dispatch::{HookDispatcher, HookResult};
use super::module::PluginModule;
use crate::binding::{HostValue, LibraryBinding};
use crate::error::LoadError;

/// Registry of libraries and loaded plugins, and the hook fan-out across them
#[derive(Default)]
pub struct PluginManager {
    libraries: BTreeMap<String, LibraryBinding>,
    plugins: Vec<PluginModule>,
    subscriptions: HashMap<String, Vec<String>>,
}

impl PluginManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a library. Returns `false` if one with the same name exists; the
    /// first registration wins.
    pub fn register_library(&mut self, library: LibraryBinding) -> bool {
        if self.libraries.contains_key(library.name()) {
            warn!(target: "plugins", "Library {} is already registered", library.name());
            return false;
        }
        debug!(target: "plugins", "Registered library {}", library.name());
        self.libraries.insert(library.name().to_string(), library);
        true
    }

    #[must_use]
    pub fn library(&self, name: &str) -> Option<&LibraryBinding> {
        self.libraries.get(name)
    }

    #[must_use]
    pub fn library_names(&self) -> Vec<&str> {
        self.libraries.keys().map(String::as_str).collect()
    }

    pub fn libraries(&self) -> impl Iterator<Item = &LibraryBinding> {
        self.libraries.values()
    }

    /// Take ownership of a bound module and subscribe each of its exports
    pub fn register(&mut self, module: PluginModule) -> Result<(), LoadError> {
        if self.plugin(module.name()).is_some() {
            return Err(LoadError::AlreadyLoaded(module.name().to_string()));
        }

        for hook in module.exports() {
            self.subscriptions
                .entry(hook.clone())
                .or_default()
                .push(module.name().to_string());
        }
        module.mark_registered();
        debug!(
            target: "plugins",
            "Registered plugin {} with {} hook subscriptions",
            module.name(),
            module.exports().len()
        );
        self.plugins.push(module);
        Ok(())
    }

    /// Detach a module and drop its subscriptions
    pub fn unregister(&mut self, name: &str) -> Option<PluginModule> {
        let idx = self.plugins.iter().position(|p| p.name() == name)?;
        let module = self.plugins.remove(idx);

        self.subscriptions.retain(|_, subscribers| {
            subscribers.retain(|s| s != name);
            !subscribers.is_empty()
        });
        debug!(target: "plugins", "Unregistered plugin {}", name);
        Some(module)
    }

    #[must_use]
    pub fn plugin(&self, name: &str) -> Option<&PluginModule> {
        self.plugins.iter().find(|p| p.name() == name)
    }

    /// Names in registration order
    #[must_use]
    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(PluginModule::name).collect()
    }

    pub fn plugins(&self) -> impl Iterator<Item = &PluginModule> {
        self.plugins.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Plugins subscribed to `hook`, in registration order
    #[must_use]
    pub fn subscribers(&self, hook: &str) -> &[String] {
        self.subscriptions
            .get(hook)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Raise `hook` on every subscribed plugin.
    ///
    /// All subscribers run even after one returns or faults. The first
    /// non-void result is returned, `Void` if there is none.
    pub fn call_hook(&self, lua: &Lua, hook: &str, args: &[HostValue]) -> HostValue {
        let mut returned = None;
        for name in self.subscribers(hook) {
            let Some(module) = self.plugin(name) else {
                continue;
            };
            match HookDispatcher::dispatch(lua, module, hook, args) {
                HookResult::Value(value) if returned.is_none() && !value.is_void() => {
                    returned = Some(value);
                }
                HookResult::Value(value) if !value.is_void() => {
                    debug!(
                        target: "plugins",
                        "Ignoring result of {} from {}, an earlier plugin already returned",
                        hook,
                        name
                    );
                }
                _ => {}
            }
        }
        returned.unwrap_or_default()
    }

    /// Take every module out, most recently registered first
    pub fn drain(&mut self) -> Vec<PluginModule> {
        self.subscriptions.clear();
        let mut modules: Vec<PluginModule> = self.plugins.drain(..).collect();
        modules.reverse();
        modules
    }
}
