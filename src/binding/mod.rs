//! Host → script binding layer
//!
//! - [`value`]: `HostValue`, parameter types and the coercion rules
//! - [`function`]: `FunctionBinding` and the `FunctionBinder` that wraps it for Lua
//! - [`library`]: named groups of functions exposed under a namespace
//! - [`surface`]: whitelist policy and the host type surface builder

pub mod function;
pub mod library;
pub mod surface;
pub mod value;

pub use function::{Args, FunctionBinder, FunctionBinding, Invoker};
pub use library::LibraryBinding;
pub use surface::{
    namespace_table, HostAssembly, HostType, SurfaceReport, TypeKind, TypeSurfaceBuilder,
    WhitelistPolicy,
};
pub use value::{coerce, from_script, to_script, HostValue, ParamSpec, ParamType};
