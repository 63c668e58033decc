// Script plugin system:
// - Modules are compiled, validated and bound before anyone can see them
// - Hooks reach a module only through its frozen export set
// - File changes are queued and applied between hook calls
pub mod api;
pub mod config_bridge;
pub mod dispatch;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod module;
pub mod reload;

pub use api::core_library;
pub use config_bridge::{ConfigBridge, ConfigStorage, ConfigStore, YamlConfigStorage};
pub use dispatch::{HookDispatcher, HookResult};
pub use loader::PluginLoader;
pub use manager::PluginManager;
pub use manifest::{PluginManifest, VersionNumber};
pub use module::{LifecycleState, PluginModule};
pub use reload::{ReloadCoordinator, WatchEvent};
