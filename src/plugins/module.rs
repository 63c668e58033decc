//! One loaded plugin script and its lifecycle

use anyhow::anyhow;
use mlua::{Lua, RegistryKey, Table, UserData, UserDataFields, Value};
use once_cell::unsync::OnceCell;
use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use tracing::{debug, info, warn};

use super::config_bridge::{ConfigBridge, ConfigStorage, ConfigStore};
use super::dispatch::{HookDispatcher, HookResult};
use super::manifest::{module_name, PluginManifest, VersionNumber};
use crate::binding::{FunctionBinder, FunctionBinding, HostValue};
use crate::error::{ConfigError, LoadError};
use crate::runtime::ScriptRuntime;

/// Methods the host binds onto every main object. They are never exported,
/// so a script cannot subscribe them as hooks.
pub const RESERVED_METHODS: &[&str] = &["SaveConfig"];

/// Where a [`PluginModule`] stands. Compiling and validating happen before a
/// module value exists, so they are not states of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unloaded,
    Bound,
    Registered,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Unloaded => "unloaded",
            LifecycleState::Bound => "bound",
            LifecycleState::Registered => "registered",
        };
        f.write_str(s)
    }
}

struct PluginCore {
    manifest: PluginManifest,
    filename: PathBuf,
    storage: Rc<dyn ConfigStorage>,
    store: RefCell<ConfigStore>,
    object: RefCell<Option<RegistryKey>>,
    exports: OnceCell<BTreeSet<String>>,
    state: Cell<LifecycleState>,
}

impl PluginCore {
    fn object<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Option<Table<'lua>>> {
        match self.object.borrow().as_ref() {
            Some(key) => lua.registry_value(key).map(Some),
            None => Ok(None),
        }
    }

    fn save_config(&self, lua: &Lua) -> Result<(), ConfigError> {
        // the previous contents only guide the shape of empty tables
        let mut fresh = self.store.borrow().clone();
        match self.object(lua)?.map(|o| o.get::<_, Value>("Config")).transpose()? {
            Some(Value::Table(config)) => ConfigBridge::from_table(&config, &mut fresh),
            _ => fresh.clear(),
        }
        self.storage.save(&self.manifest.name, &fresh)?;
        *self.store.borrow_mut() = fresh;
        Ok(())
    }
}

/// Read-only view of a plugin exposed to its own script as `Plugin`
struct PluginRef(Weak<PluginCore>);

impl PluginRef {
    fn with<R>(&self, f: impl FnOnce(&PluginCore) -> R) -> mlua::Result<R> {
        self.0
            .upgrade()
            .map(|core| f(&core))
            .ok_or_else(|| mlua::Error::RuntimeError("plugin has been unloaded".to_string()))
    }
}

impl UserData for PluginRef {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_field_method_get("Name", |_, this| this.with(|c| c.manifest.name.clone()));
        fields.add_field_method_get("Title", |_, this| this.with(|c| c.manifest.title.clone()));
        fields.add_field_method_get("Author", |_, this| this.with(|c| c.manifest.author.clone()));
        fields.add_field_method_get("Version", |_, this| this.with(|c| c.manifest.version.to_string()));
        fields.add_field_method_get("Filename", |_, this| {
            this.with(|c| c.filename.display().to_string())
        });
    }
}

/// A compiled, validated plugin bound to its main object
pub struct PluginModule {
    core: Rc<PluginCore>,
}

impl fmt::Debug for PluginModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginModule")
            .field("name", &self.core.manifest.name)
            .field("version", &self.core.manifest.version)
            .field("state", &self.core.state.get())
            .finish_non_exhaustive()
    }
}

impl PluginModule {
    /// Compile, execute and validate the script at `path`, then bind the
    /// host-side members onto its main object.
    ///
    /// On success the module is `Bound`: not yet visible to any manager and
    /// its `Init` has not run. On failure nothing of the script stays
    /// reachable under its name.
    pub fn load(
        runtime: &ScriptRuntime,
        path: &Path,
        storage: Rc<dyn ConfigStorage>,
    ) -> Result<Self, LoadError> {
        let lua = runtime.lua();
        let name = module_name(path)?;
        debug!(target: "plugins", "{}: compiling", name);

        let source = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let chunk_name = path
            .file_name()
            .map_or_else(|| name.clone(), |f| f.to_string_lossy().into_owned());
        let chunk = runtime.compile(&source, &chunk_name).map_err(|e| LoadError::Compile {
            name: name.clone(),
            message: e.to_string(),
        })?;
        if let Err(source) = chunk.call::<_, ()>(()) {
            clear_global(lua, &name);
            return Err(LoadError::Execute { name, source });
        }

        debug!(target: "plugins", "{}: validating", name);
        let object = match runtime.global(&name)? {
            Value::Table(t) => t,
            _ => {
                clear_global(lua, &name);
                return Err(LoadError::MissingMainObject { name });
            }
        };
        let manifest = match PluginManifest::validate(&name, &object) {
            Ok(manifest) => manifest,
            Err(e) => {
                clear_global(lua, &name);
                return Err(e);
            }
        };

        let module = Self::bind(lua, object, manifest, path, storage)?;
        if module.has_config() {
            if let Err(e) = module.load_config(lua) {
                warn!(target: "plugins", "{}: failed to load config: {}", module.name(), e);
            }
        }
        Ok(module)
    }

    fn bind(
        lua: &Lua,
        object: Table<'_>,
        manifest: PluginManifest,
        path: &Path,
        storage: Rc<dyn ConfigStorage>,
    ) -> Result<Self, LoadError> {
        let core = Rc::new(PluginCore {
            manifest,
            filename: path.to_path_buf(),
            storage,
            store: RefCell::new(ConfigStore::new()),
            object: RefCell::new(Some(lua.create_registry_value(object.clone())?)),
            exports: OnceCell::new(),
            state: Cell::new(LifecycleState::Bound),
        });

        object.set("Plugin", lua.create_userdata(PluginRef(Rc::downgrade(&core)))?)?;
        object.set("Config", lua.create_table()?)?;

        let exports = collect_exports(&object);
        let _ = core.exports.set(exports);

        let weak = Rc::downgrade(&core);
        let save = FunctionBinding::new("SaveConfig", move |lua, _| {
            let core = weak.upgrade().ok_or_else(|| anyhow!("plugin has been unloaded"))?;
            core.save_config(lua)?;
            Ok(HostValue::Void)
        });
        object.set("SaveConfig", FunctionBinder::bind(lua, Rc::new(save))?)?;

        let module = Self { core };
        debug!(
            target: "plugins",
            "{}: {} with exports {:?}",
            module.name(),
            LifecycleState::Bound,
            module.exports()
        );
        Ok(module)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.manifest.name
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.core.manifest.title
    }

    #[must_use]
    pub fn author(&self) -> &str {
        &self.core.manifest.author
    }

    #[must_use]
    pub fn version(&self) -> VersionNumber {
        self.core.manifest.version
    }

    #[must_use]
    pub fn resource_id(&self) -> Option<i64> {
        self.core.manifest.resource_id
    }

    #[must_use]
    pub fn has_config(&self) -> bool {
        self.core.manifest.has_config
    }

    #[must_use]
    pub fn filename(&self) -> &Path {
        &self.core.filename
    }

    #[must_use]
    pub fn manifest(&self) -> &PluginManifest {
        &self.core.manifest
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.core.state.get()
    }

    pub(crate) fn mark_registered(&self) {
        self.core.state.set(LifecycleState::Registered);
    }

    /// Names of the callable top-level members, fixed at load
    pub fn exports(&self) -> &BTreeSet<String> {
        static EMPTY: BTreeSet<String> = BTreeSet::new();
        self.core.exports.get().unwrap_or(&EMPTY)
    }

    #[must_use]
    pub fn exports_hook(&self, hook: &str) -> bool {
        self.exports().contains(hook)
    }

    /// The script's main object, `None` once disposed
    pub fn object<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Option<Table<'lua>>> {
        self.core.object(lua)
    }

    /// Copy of the configuration as last loaded or saved
    #[must_use]
    pub fn config(&self) -> ConfigStore {
        self.core.store.borrow().clone()
    }

    /// Run a lifecycle export such as `Init` or `Unload`. A missing export is
    /// fine, a failing one is logged. Returns whether it ran to completion.
    pub fn call_lifecycle(&self, lua: &Lua, hook: &str) -> bool {
        match HookDispatcher::dispatch(lua, self, hook, &[]) {
            HookResult::Value(_) => true,
            HookResult::Unhandled | HookResult::Faulted(_) => false,
        }
    }

    /// Signal successful activation to the script
    pub fn init(&self, lua: &Lua) {
        if self.call_lifecycle(lua, "Init") {
            debug!(target: "plugins", "{}: Init completed", self.name());
        }
        info!(
            target: "plugins",
            "Loaded plugin {} v{} by {}",
            self.title(),
            self.version(),
            self.author()
        );
    }

    /// Reset to an empty configuration and let the script fill in defaults
    pub fn load_default_config(&self, lua: &Lua) -> Result<(), ConfigError> {
        self.core.store.borrow_mut().clear();
        if let Some(object) = self.object(lua)? {
            object.set("Config", lua.create_table()?)?;
        }
        self.call_lifecycle(lua, "LoadDefaultConfig");
        Ok(())
    }

    /// Read the persisted configuration into the script's `Config` table.
    ///
    /// With nothing persisted yet, defaults are generated and saved. A file
    /// that cannot be read is left alone and defaults are used in memory.
    pub fn load_config(&self, lua: &Lua) -> Result<(), ConfigError> {
        match self.core.storage.load(self.name()) {
            Ok(Some(store)) => {
                if let Some(object) = self.object(lua)? {
                    object.set("Config", ConfigBridge::to_table(lua, &store)?)?;
                }
                *self.core.store.borrow_mut() = store;
                Ok(())
            }
            Ok(None) => {
                debug!(target: "plugins", "{}: no saved config, generating defaults", self.name());
                self.load_default_config(lua)?;
                self.save_config(lua)
            }
            Err(e) => {
                warn!(target: "plugins", "{}: {}; using defaults", self.name(), e);
                self.load_default_config(lua)
            }
        }
    }

    /// Persist the script's `Config` table, replacing whatever was stored
    pub fn save_config(&self, lua: &Lua) -> Result<(), ConfigError> {
        self.core.save_config(lua)
    }

    /// Run the script's `Unload` export. The module stays bound until
    /// [`PluginModule::dispose`].
    pub fn unload(&self, lua: &Lua) {
        self.call_lifecycle(lua, "Unload");
        self.core.state.set(LifecycleState::Unloaded);
        info!(target: "plugins", "Unloaded plugin {} v{}", self.title(), self.version());
    }

    /// Drop every link between the script state and this module
    pub fn dispose(self, lua: &Lua) {
        self.core.state.set(LifecycleState::Unloaded);
        let Some(key) = self.core.object.borrow_mut().take() else {
            return;
        };

        if let Ok(object) = lua.registry_value::<Table>(&key) {
            for member in RESERVED_METHODS.iter().chain(&["Plugin"]) {
                if let Err(e) = object.raw_set(*member, Value::Nil) {
                    debug!(target: "plugins", "{}: could not clear {}: {}", self.name(), member, e);
                }
            }
            let globals = lua.globals();
            let still_ours = matches!(
                globals.raw_get::<_, Value>(self.name()),
                Ok(Value::Table(current)) if current == object
            );
            if still_ours {
                clear_global(lua, self.name());
            }
        }

        if let Err(e) = lua.remove_registry_value(key) {
            debug!(target: "plugins", "{}: registry cleanup failed: {}", self.name(), e);
        }
    }
}

fn collect_exports(object: &Table<'_>) -> BTreeSet<String> {
    object
        .clone()
        .pairs::<Value, Value>()
        .filter_map(Result::ok)
        .filter_map(|(key, value)| match (key, value) {
            (Value::String(key), Value::Function(_)) => key.to_str().ok().map(str::to_string),
            _ => None,
        })
        .filter(|name| !RESERVED_METHODS.contains(&name.as_str()))
        .collect()
}

fn clear_global(lua: &Lua, name: &str) {
    if let Err(e) = lua.globals().raw_set(name, Value::Nil) {
        debug!(target: "plugins", "Could not clear global {}: {}", name, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::config_bridge::YamlConfigStorage;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        runtime: ScriptRuntime,
        dir: TempDir,
        storage: Rc<YamlConfigStorage>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let storage = Rc::new(YamlConfigStorage::new(dir.path().join("config")));
            Self {
                runtime: ScriptRuntime::new(true).unwrap(),
                dir,
                storage,
            }
        }

        fn write(&self, file: &str, source: &str) -> PathBuf {
            let path = self.dir.path().join(file);
            fs::write(&path, source).unwrap();
            path
        }

        fn load(&self, file: &str, source: &str) -> Result<PluginModule, LoadError> {
            let path = self.write(file, source);
            PluginModule::load(&self.runtime, &path, self.storage.clone())
        }
    }

    const TEST_PLUGIN: &str = r#"
        Test = { Title = "Test", Author = "dev", Version = {1, 0, 0} }
        function Test:OnPlayerConnect(player) return "hello " .. player end
        function Test:Init() inits = (inits or 0) + 1 end
        Test.Counter = 3
    "#;

    #[test]
    fn test_load_binds_module() {
        let fx = Fixture::new();
        let module = fx.load("Test.lua", TEST_PLUGIN).unwrap();

        assert_eq!(module.name(), "Test");
        assert_eq!(module.version(), VersionNumber::new(1, 0, 0));
        assert_eq!(module.state(), LifecycleState::Bound);
        let exports: Vec<&str> = module.exports().iter().map(String::as_str).collect();
        assert_eq!(exports, vec!["Init", "OnPlayerConnect"]);
        assert!(!module.exports_hook("SaveConfig"));
    }

    #[test]
    fn test_plugin_back_reference() {
        let fx = Fixture::new();
        let _module = fx.load("Test.lua", TEST_PLUGIN).unwrap();
        let lua = fx.runtime.lua();
        let (name, version): (String, String) =
            lua.load("return Test.Plugin.Name, Test.Plugin.Version").eval().unwrap();
        assert_eq!(name, "Test");
        assert_eq!(version, "1.0.0");
    }

    #[test]
    fn test_missing_main_object() {
        let fx = Fixture::new();
        let err = fx
            .load("Other.lua", r#"Test = { Title = "T", Author = "a", Version = {1, 0, 0} }"#)
            .unwrap_err();
        assert!(matches!(err, LoadError::MissingMainObject { .. }));
    }

    #[test]
    fn test_non_table_main_object_is_cleared() {
        let fx = Fixture::new();
        let err = fx.load("Foo.lua", "Foo = 5").unwrap_err();
        assert!(matches!(err, LoadError::MissingMainObject { .. }));
        assert!(matches!(fx.runtime.global("Foo").unwrap(), Value::Nil));
    }

    #[test]
    fn test_compile_error() {
        let fx = Fixture::new();
        let err = fx.load("Broken.lua", "Broken = {").unwrap_err();
        assert!(matches!(err, LoadError::Compile { .. }));
    }

    #[test]
    fn test_validation_failure_clears_global() {
        let fx = Fixture::new();
        let err = fx.load("NoAuthor.lua", r#"NoAuthor = { Title = "T", Version = {1, 0, 0} }"#);
        assert!(matches!(err, Err(LoadError::MissingMetadata { field: "Author", .. })));
        assert!(matches!(fx.runtime.global("NoAuthor").unwrap(), Value::Nil));
    }

    #[test]
    fn test_default_config_generated_and_saved() {
        let fx = Fixture::new();
        let module = fx
            .load(
                "Cfg.lua",
                r#"
                Cfg = { Title = "Cfg", Author = "dev", Version = "0.2.0", HasConfig = true }
                function Cfg:LoadDefaultConfig() self.Config.greeting = "hi"; self.Config.count = 2 end
                "#,
            )
            .unwrap();

        assert!(fx.storage.exists("Cfg"));
        let store = module.config();
        assert_eq!(store.keys().collect::<Vec<_>>(), vec!["count", "greeting"]);
    }

    #[test]
    fn test_failing_default_config_is_contained() {
        let fx = Fixture::new();
        let module = fx
            .load(
                "Cfg.lua",
                r#"
                Cfg = { Title = "Cfg", Author = "dev", Version = {1, 0, 0}, HasConfig = true }
                function Cfg:LoadDefaultConfig()
                    self.Config.partial = true
                    error("defaults are broken")
                end
                "#,
            )
            .unwrap();

        assert_eq!(module.state(), LifecycleState::Bound);
        assert!(fx.storage.exists("Cfg"));
        assert_eq!(module.config().keys().collect::<Vec<_>>(), vec!["partial"]);
    }

    #[test]
    fn test_empty_list_survives_save() {
        let fx = Fixture::new();
        let mapping: serde_yaml::Mapping = serde_yaml::from_str("items: []\n").unwrap();
        fx.storage.save("Cfg", &ConfigStore::from(mapping.clone())).unwrap();

        let _module = fx
            .load(
                "Cfg.lua",
                r#"Cfg = { Title = "Cfg", Author = "dev", Version = {1, 0, 0}, HasConfig = true }"#,
            )
            .unwrap();
        fx.runtime.lua().load("Cfg:SaveConfig()").exec().unwrap();

        let saved = fx.storage.load("Cfg").unwrap().unwrap();
        assert_eq!(saved.as_mapping(), &mapping);
    }

    #[test]
    fn test_saved_config_is_loaded() {
        let fx = Fixture::new();
        let mut store = ConfigStore::new();
        store.set("greeting", "persisted");
        fx.storage.save("Cfg", &store).unwrap();

        let _module = fx
            .load(
                "Cfg.lua",
                r#"
                Cfg = { Title = "Cfg", Author = "dev", Version = {1, 0, 0}, HasConfig = true }
                function Cfg:LoadDefaultConfig() self.Config.greeting = "default" end
                "#,
            )
            .unwrap();
        let greeting: String = fx.runtime.lua().load("return Cfg.Config.greeting").eval().unwrap();
        assert_eq!(greeting, "persisted");
    }

    #[test]
    fn test_save_config_from_script_drops_stale_keys() {
        let fx = Fixture::new();
        let mut store = ConfigStore::new();
        store.set("z", "old");
        fx.storage.save("Cfg", &store).unwrap();

        let module = fx
            .load(
                "Cfg.lua",
                r#"Cfg = { Title = "Cfg", Author = "dev", Version = {1, 0, 0}, HasConfig = true }"#,
            )
            .unwrap();
        fx.runtime
            .lua()
            .load(r#"Cfg.Config = { x = 1, y = "hi" }; Cfg:SaveConfig()"#)
            .exec()
            .unwrap();

        let saved = fx.storage.load("Cfg").unwrap().unwrap();
        assert_eq!(saved.keys().collect::<Vec<_>>(), vec!["x", "y"]);
        assert_eq!(module.config(), saved);
    }

    #[test]
    fn test_corrupt_config_not_overwritten() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.storage.dir()).unwrap();
        fs::write(fx.storage.path_for("Cfg"), "a: [1, 2\n").unwrap();

        let _module = fx
            .load(
                "Cfg.lua",
                r#"Cfg = { Title = "Cfg", Author = "dev", Version = {1, 0, 0}, HasConfig = true }"#,
            )
            .unwrap();
        let contents = fs::read_to_string(fx.storage.path_for("Cfg")).unwrap();
        assert_eq!(contents, "a: [1, 2\n");
    }

    #[test]
    fn test_unload_and_dispose() {
        let fx = Fixture::new();
        let module = fx
            .load(
                "Gone.lua",
                r#"
                Gone = { Title = "Gone", Author = "dev", Version = {1, 0, 0} }
                function Gone:Unload() unloaded = true end
                "#,
            )
            .unwrap();
        let lua = fx.runtime.lua();

        module.unload(lua);
        assert_eq!(module.state(), LifecycleState::Unloaded);
        assert!(matches!(fx.runtime.global("unloaded").unwrap(), Value::Boolean(true)));

        module.dispose(lua);
        assert!(matches!(fx.runtime.global("Gone").unwrap(), Value::Nil));
    }

    #[test]
    fn test_failing_unload_is_contained() {
        let fx = Fixture::new();
        let module = fx
            .load(
                "Bad.lua",
                r#"
                Bad = { Title = "Bad", Author = "dev", Version = {1, 0, 0} }
                function Bad:Unload() error("nope") end
                "#,
            )
            .unwrap();
        module.unload(fx.runtime.lua());
        assert_eq!(module.state(), LifecycleState::Unloaded);
    }
}
