//! The assembled plugin host: runtime, manager, loader and reload coordinator

use anyhow::{bail, Context, Result};
use mlua::Lua;
use std::rc::Rc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::binding::{HostAssembly, HostValue, LibraryBinding, SurfaceReport, TypeSurfaceBuilder, WhitelistPolicy};
use crate::config::HostConfig;
use crate::error::LoadError;
use crate::plugins::{
    core_library, ConfigStorage, PluginLoader, PluginManager, ReloadCoordinator, WatchEvent, YamlConfigStorage,
};
use crate::runtime::ScriptRuntime;

pub struct PluginHost {
    runtime: ScriptRuntime,
    manager: PluginManager,
    coordinator: ReloadCoordinator,
    policy: WhitelistPolicy,
    watch: bool,
    started: bool,
}

impl PluginHost {
    /// Build a host with YAML-persisted plugin configuration
    pub fn new(config: &HostConfig) -> Result<Self> {
        let storage = Rc::new(YamlConfigStorage::new(&config.plugins.config_directory));
        Self::with_storage(config, storage)
    }

    pub fn with_storage(config: &HostConfig, storage: Rc<dyn ConfigStorage>) -> Result<Self> {
        let runtime = ScriptRuntime::new(config.runtime.sandbox).context("Failed to create script runtime")?;
        let loader = PluginLoader::new(&config.plugins.directory, &config.plugins.extension, storage);

        let mut manager = PluginManager::new();
        manager.register_library(core_library());

        Ok(Self {
            runtime,
            manager,
            coordinator: ReloadCoordinator::new(loader),
            policy: config.whitelist.to_policy(),
            watch: config.plugins.watch,
            started: false,
        })
    }

    #[must_use]
    pub fn runtime(&self) -> &ScriptRuntime {
        &self.runtime
    }

    #[must_use]
    pub fn lua(&self) -> &Lua {
        self.runtime.lua()
    }

    #[must_use]
    pub fn manager(&self) -> &PluginManager {
        &self.manager
    }

    #[must_use]
    pub fn coordinator(&self) -> &ReloadCoordinator {
        &self.coordinator
    }

    #[must_use]
    pub fn policy(&self) -> &WhitelistPolicy {
        &self.policy
    }

    /// Add a native library. Once started, it is exposed right away.
    pub fn register_library(&mut self, library: LibraryBinding) -> Result<()> {
        let name = library.name().to_string();
        if !self.manager.register_library(library) {
            bail!("Library {} is already registered", name);
        }
        if self.started {
            if let Some(library) = self.manager.library(&name) {
                library
                    .expose(self.runtime.lua())
                    .with_context(|| format!("Failed to expose library {name}"))?;
            }
        }
        Ok(())
    }

    /// Publish the whitelisted part of `assemblies` to scripts
    pub fn bind_surface(&self, assemblies: &[HostAssembly]) -> SurfaceReport {
        TypeSurfaceBuilder::new(&self.policy).build(self.runtime.lua(), assemblies)
    }

    /// Expose libraries, load every plugin and start watching for changes.
    /// Returns the number of plugins loaded.
    pub fn start(&mut self) -> Result<usize> {
        if self.started {
            bail!("Plugin host already started");
        }

        for library in self.manager.libraries() {
            library
                .expose(self.runtime.lua())
                .with_context(|| format!("Failed to expose library {}", library.name()))?;
        }
        self.started = true;

        let loaded = self.coordinator.load_all(&self.runtime, &mut self.manager);
        info!(
            target: "plugins",
            "Loaded {} plugin(s) from {}",
            loaded,
            self.coordinator.loader().directory().display()
        );

        if self.watch {
            if let Err(e) = self.coordinator.watch() {
                warn!(target: "plugins", "Hot reload disabled: {:#}", e);
            }
        }
        Ok(loaded)
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Raise a hook on every subscribed plugin
    pub fn call_hook(&self, hook: &str, args: &[HostValue]) -> HostValue {
        self.manager.call_hook(self.runtime.lua(), hook, args)
    }

    /// Apply queued file changes. Call between hook dispatches.
    pub fn pump(&mut self) -> usize {
        self.coordinator.process_pending(&self.runtime, &mut self.manager)
    }

    pub fn reload(&mut self, name: &str) -> Result<(), LoadError> {
        self.coordinator.reload(&self.runtime, &mut self.manager, name)
    }

    pub fn unload(&mut self, name: &str) -> bool {
        self.coordinator.unload(self.runtime.lua(), &mut self.manager, name)
    }

    /// Queue a file event as if the watcher had seen it
    #[must_use]
    pub fn notifier(&self) -> UnboundedSender<WatchEvent> {
        self.coordinator.notifier()
    }

    /// Unload every plugin and release the runtime
    pub fn shutdown(self) {
        let Self {
            runtime,
            mut manager,
            mut coordinator,
            ..
        } = self;
        coordinator.shutdown(runtime.lua(), &mut manager);
        drop(manager);
        drop(coordinator);
        runtime.teardown();
        info!(target: "plugins", "Plugin host shut down");
    }
}
