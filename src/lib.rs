//! Hookhost - a Lua plugin host with hot reload
//!
//! This library embeds a Lua runtime, exposes a whitelisted surface of host
//! types and native libraries to it, and manages plugin scripts that react to
//! named hooks raised by the host.
//!
//! # Modules
//!
//! - [`binding`]: Host values, function marshaling, libraries and the type surface
//! - [`plugins`]: Plugin modules, hook dispatch, configuration and hot reload
//! - [`runtime`]: The shared Lua state
//! - [`host`]: `PluginHost`, which wires everything together
//! - [`config`]: Host configuration management and serialization
//! - [`error`]: Load, configuration and argument conversion errors
//! - [`command`]: Console commands for the `hookhost` binary

pub mod binding;
pub mod command;
pub mod config;
pub mod error;
pub mod host;
pub mod plugins;
pub mod runtime;

pub use binding::HostValue;
pub use host::PluginHost;
