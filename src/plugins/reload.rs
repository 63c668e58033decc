//! File watching and the unload → load sequence for changed plugins
//!
//! The watcher runs on its own thread and only ever pushes [`WatchEvent`]s
//! into a queue. The queue is drained by [`ReloadCoordinator::process_pending`]
//! on the script thread, between hook calls, so a reload never overlaps a
//! dispatch and two reloads of one file never interleave.

use anyhow::{Context, Result};
use mlua::Lua;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use super::loader::PluginLoader;
use super::manager::PluginManager;
use crate::error::LoadError;
use crate::runtime::ScriptRuntime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(PathBuf),
    Changed(PathBuf),
    Removed(PathBuf),
}

impl WatchEvent {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Added(p) | WatchEvent::Changed(p) | WatchEvent::Removed(p) => p,
        }
    }

    fn from_notify(event: &Event) -> Vec<Self> {
        let make: fn(PathBuf) -> Self = match event.kind {
            EventKind::Create(_) => WatchEvent::Added,
            EventKind::Remove(_) => WatchEvent::Removed,
            EventKind::Access(_) => return Vec::new(),
            _ => WatchEvent::Changed,
        };
        event.paths.iter().cloned().map(make).collect()
    }
}

pub struct ReloadCoordinator {
    loader: PluginLoader,
    mappings: BTreeMap<String, PathBuf>,
    tx: UnboundedSender<WatchEvent>,
    rx: UnboundedReceiver<WatchEvent>,
    watcher: Option<RecommendedWatcher>,
}

impl ReloadCoordinator {
    #[must_use]
    pub fn new(loader: PluginLoader) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            loader,
            mappings: BTreeMap::new(),
            tx,
            rx,
            watcher: None,
        }
    }

    #[must_use]
    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    /// Start watching the plugin directory, creating it if needed
    pub fn watch(&mut self) -> Result<()> {
        let dir = self.loader.directory().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create plugin directory {}", dir.display()))?;

        let tx = self.tx.clone();
        let extension = self.loader.extension().to_string();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in WatchEvent::from_notify(&event) {
                    let matches = change.path().extension().and_then(|e| e.to_str()) == Some(extension.as_str());
                    if matches && tx.send(change).is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(target: "plugins", "File watcher error: {}", e),
        })
        .context("Failed to create file watcher")?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;

        info!(target: "plugins", "Watching {} for *.{} changes", dir.display(), self.loader.extension());
        self.watcher = Some(watcher);
        Ok(())
    }

    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    /// A handle for queueing events by hand, as the watcher does
    #[must_use]
    pub fn notifier(&self) -> UnboundedSender<WatchEvent> {
        self.tx.clone()
    }

    /// The file a loaded plugin came from
    #[must_use]
    pub fn mapping(&self, name: &str) -> Option<&Path> {
        self.mappings.get(name).map(PathBuf::as_path)
    }

    pub fn mappings(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.mappings.iter().map(|(n, p)| (n.as_str(), p.as_path()))
    }

    /// Load every plugin file in the directory. Failures are logged and do
    /// not stop the rest. Returns how many loaded.
    pub fn load_all(&mut self, runtime: &ScriptRuntime, manager: &mut PluginManager) -> usize {
        let files = match self.loader.scan() {
            Ok(files) => files,
            Err(e) => {
                error!(target: "plugins", "{:#}", e);
                return 0;
            }
        };

        let mut loaded = 0;
        for path in files {
            match self.load_file(runtime, manager, &path) {
                Ok(()) => loaded += 1,
                Err(e) => error!(target: "plugins", "Failed to load {}: {}", path.display(), e),
            }
        }
        loaded
    }

    /// Load, register, map and initialise one plugin file
    pub fn load_file(
        &mut self,
        runtime: &ScriptRuntime,
        manager: &mut PluginManager,
        path: &Path,
    ) -> Result<(), LoadError> {
        let name = self.loader.module_name(path)?;
        // loading re-runs the chunk, which would clobber the live global
        if manager.plugin(&name).is_some() {
            return Err(LoadError::AlreadyLoaded(name));
        }

        let lua = runtime.lua();
        let module = self.loader.load(runtime, path)?;
        manager.register(module)?;
        self.mappings.insert(name.clone(), path.to_path_buf());

        if let Some(module) = manager.plugin(&name) {
            module.init(lua);
        }
        Ok(())
    }

    /// Run `Unload`, drop the mapping and detach from the manager.
    /// Returns `false` if no plugin by that name is loaded.
    pub fn unload(&mut self, lua: &Lua, manager: &mut PluginManager, name: &str) -> bool {
        let Some(module) = manager.plugin(name) else {
            self.mappings.remove(name);
            return false;
        };
        module.unload(lua);

        self.mappings.remove(name);
        if let Some(module) = manager.unregister(name) {
            module.dispose(lua);
        }
        true
    }

    /// Replace whatever is loaded from `path` with a fresh instance
    pub fn reload_file(
        &mut self,
        runtime: &ScriptRuntime,
        manager: &mut PluginManager,
        path: &Path,
    ) -> Result<(), LoadError> {
        let name = self.loader.module_name(path)?;
        if self.unload(runtime.lua(), manager, &name) {
            debug!(target: "plugins", "Reloading {}", name);
        }
        self.load_file(runtime, manager, path)
    }

    /// Reload a plugin by name, picking the file up from the plugin
    /// directory if it is not loaded yet
    pub fn reload(
        &mut self,
        runtime: &ScriptRuntime,
        manager: &mut PluginManager,
        name: &str,
    ) -> Result<(), LoadError> {
        let path = self.mappings.get(name).cloned().unwrap_or_else(|| {
            self.loader
                .directory()
                .join(format!("{}.{}", name, self.loader.extension()))
        });
        self.reload_file(runtime, manager, &path)
    }

    /// Drain the event queue and act on each affected file once.
    ///
    /// Events are coalesced per path and the decision is made from what is
    /// on disk now: a present file is (re)loaded, a missing one unloaded.
    /// Returns the number of files acted on.
    pub fn process_pending(&mut self, runtime: &ScriptRuntime, manager: &mut PluginManager) -> usize {
        let mut paths = Vec::new();
        let mut seen = HashSet::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    let path = event.path().to_path_buf();
                    if seen.insert(path.clone()) {
                        paths.push(path);
                    }
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        let mut handled = 0;
        for path in paths {
            if !self.loader.is_plugin_file(&path) {
                continue;
            }
            let name = match self.loader.module_name(&path) {
                Ok(name) => name,
                Err(e) => {
                    warn!(target: "plugins", "Ignoring {}: {}", path.display(), e);
                    continue;
                }
            };

            if path.is_file() {
                if let Err(e) = self.reload_file(runtime, manager, &path) {
                    error!(target: "plugins", "Failed to reload {}: {}", name, e);
                }
                handled += 1;
            } else if self.mappings.contains_key(&name) {
                info!(target: "plugins", "Plugin file for {} removed", name);
                self.unload(runtime.lua(), manager, &name);
                handled += 1;
            }
        }
        handled
    }

    /// Unload everything, most recently loaded first, and stop watching
    pub fn shutdown(&mut self, lua: &Lua, manager: &mut PluginManager) {
        self.watcher = None;
        for module in manager.drain() {
            module.unload(lua);
            self.mappings.remove(module.name());
            module.dispose(lua);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::config_bridge::YamlConfigStorage;
    use std::rc::Rc;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        runtime: ScriptRuntime,
        manager: PluginManager,
        coordinator: ReloadCoordinator,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let storage = Rc::new(YamlConfigStorage::new(dir.path().join("config")));
            let loader = PluginLoader::new(dir.path(), "lua", storage);
            Self {
                runtime: ScriptRuntime::new(true).unwrap(),
                manager: PluginManager::new(),
                coordinator: ReloadCoordinator::new(loader),
                dir,
            }
        }

        fn write(&self, name: &str, source: &str) -> PathBuf {
            let path = self.dir.path().join(format!("{name}.lua"));
            fs::write(&path, source).unwrap();
            path
        }

        fn process(&mut self) -> usize {
            self.coordinator.process_pending(&self.runtime, &mut self.manager)
        }

        fn log(&self) -> Vec<String> {
            self.runtime.lua().load("return log or {}").eval().unwrap()
        }
    }

    fn tracked(version: &str) -> String {
        format!(
            r#"
            log = log or {{}}
            Foo = {{ Title = "Foo", Author = "dev", Version = "{version}" }}
            function Foo:Init() table.insert(log, "init " .. self.Plugin.Version) end
            function Foo:Unload() table.insert(log, "unload " .. self.Plugin.Version) end
            "#
        )
    }

    #[test]
    fn test_change_unloads_then_loads() {
        let mut fx = Fixture::new();
        let path = fx.write("Foo", &tracked("1.0.0"));
        fx.coordinator.load_file(&fx.runtime, &mut fx.manager, &path).unwrap();

        fx.write("Foo", &tracked("1.0.1"));
        fx.coordinator.notifier().send(WatchEvent::Changed(path.clone())).unwrap();
        assert_eq!(fx.process(), 1);

        assert_eq!(fx.log(), vec!["init 1.0.0", "unload 1.0.0", "init 1.0.1"]);
        assert_eq!(fx.coordinator.mappings().count(), 1);
        assert_eq!(fx.coordinator.mapping("Foo"), Some(path.as_path()));
        assert_eq!(fx.manager.plugin("Foo").map(|m| m.version().to_string()), Some("1.0.1".into()));
    }

    #[test]
    fn test_burst_is_coalesced() {
        let mut fx = Fixture::new();
        let path = fx.write("Foo", &tracked("1.0.0"));
        fx.coordinator.load_file(&fx.runtime, &mut fx.manager, &path).unwrap();

        let notifier = fx.coordinator.notifier();
        for _ in 0..3 {
            notifier.send(WatchEvent::Changed(path.clone())).unwrap();
        }
        assert_eq!(fx.process(), 1);
        assert_eq!(fx.log(), vec!["init 1.0.0", "unload 1.0.0", "init 1.0.0"]);
    }

    #[test]
    fn test_removed_file_unloads() {
        let mut fx = Fixture::new();
        let path = fx.write("Foo", &tracked("1.0.0"));
        fx.coordinator.load_file(&fx.runtime, &mut fx.manager, &path).unwrap();

        fs::remove_file(&path).unwrap();
        fx.coordinator.notifier().send(WatchEvent::Removed(path)).unwrap();
        assert_eq!(fx.process(), 1);

        assert!(fx.manager.plugin("Foo").is_none());
        assert!(fx.coordinator.mapping("Foo").is_none());
        assert_eq!(fx.log(), vec!["init 1.0.0", "unload 1.0.0"]);
    }

    #[test]
    fn test_added_file_loads() {
        let mut fx = Fixture::new();
        let path = fx.write("Foo", &tracked("2.0.0"));
        fx.coordinator.notifier().send(WatchEvent::Added(path)).unwrap();
        fx.coordinator
            .notifier()
            .send(WatchEvent::Added(fx.dir.path().join("readme.txt")))
            .unwrap();

        assert_eq!(fx.process(), 1);
        assert_eq!(fx.manager.plugin_names(), vec!["Foo"]);
    }

    #[test]
    fn test_broken_reload_leaves_plugin_absent() {
        let mut fx = Fixture::new();
        let path = fx.write("Foo", &tracked("1.0.0"));
        fx.coordinator.load_file(&fx.runtime, &mut fx.manager, &path).unwrap();

        fx.write("Foo", "Foo = {");
        fx.coordinator.notifier().send(WatchEvent::Changed(path)).unwrap();
        fx.process();

        assert!(fx.manager.plugin("Foo").is_none());
        assert!(fx.coordinator.mapping("Foo").is_none());
    }

    #[test]
    fn test_load_all_skips_failures() {
        let mut fx = Fixture::new();
        fx.write("Foo", &tracked("1.0.0"));
        fx.write("Bar", r#"Bar = { Title = "Bar", Version = {1, 0, 0} }"#);
        fx.write("bad-name", "");

        let loaded = fx.coordinator.load_all(&fx.runtime, &mut fx.manager);
        assert_eq!(loaded, 1);
        assert_eq!(fx.manager.plugin_names(), vec!["Foo"]);
    }

    #[test]
    fn test_reload_by_name_and_shutdown() {
        let mut fx = Fixture::new();
        fx.write("Foo", &tracked("1.0.0"));
        fx.coordinator.reload(&fx.runtime, &mut fx.manager, "Foo").unwrap();
        fx.coordinator.reload(&fx.runtime, &mut fx.manager, "Foo").unwrap();
        assert_eq!(fx.log(), vec!["init 1.0.0", "unload 1.0.0", "init 1.0.0"]);

        fx.coordinator.shutdown(fx.runtime.lua(), &mut fx.manager);
        assert!(fx.manager.is_empty());
        assert_eq!(fx.coordinator.mappings().count(), 0);
        assert_eq!(fx.log().last().map(String::as_str), Some("unload 1.0.0"));
    }
}
