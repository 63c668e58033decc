//! Error types for plugin loading, configuration and argument marshaling

use std::path::PathBuf;
use thiserror::Error;

use crate::binding::ParamType;

/// Why a plugin module could not be loaded
///
/// Every variant is local to the module being loaded. The coordinator logs it
/// and moves on to the next file.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read plugin source {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("'{0}' is not a valid plugin name (expected a Lua identifier)")]
    InvalidName(String),

    #[error("plugin {name} failed to compile: {message}")]
    Compile { name: String, message: String },

    #[error("plugin {name} failed while executing its main chunk: {source}")]
    Execute {
        name: String,
        #[source]
        source: mlua::Error,
    },

    #[error("plugin {name} does not define a main object named '{name}'")]
    MissingMainObject { name: String },

    #[error("plugin {name} is missing required string property '{field}'")]
    MissingMetadata { name: String, field: &'static str },

    #[error("plugin {name} is missing a valid 'Version' (expected major.minor.patch)")]
    MissingVersion { name: String },

    #[error("plugin {0} is already loaded")]
    AlreadyLoaded(String),

    #[error("script runtime error: {0}")]
    Script(#[from] mlua::Error),
}

/// Failures while reading or writing a plugin's persisted configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config {path} is not valid YAML: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("config root of {0} must be a mapping")]
    NotAMapping(PathBuf),

    #[error("script runtime error: {0}")]
    Script(#[from] mlua::Error),
}

/// What went wrong converting one argument
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversionFailure {
    #[error("argument is missing")]
    Missing,

    #[error("expected {expected}, got {found}")]
    Mismatch {
        expected: ParamType,
        found: &'static str,
    },

    #[error("cannot parse {input:?} as {expected}")]
    Unparsable { expected: ParamType, input: String },

    #[error("number {0} does not fit an integer parameter")]
    OutOfRange(f64),
}

/// Raised at the host/script boundary when a script passes arguments a bound
/// function cannot accept. Surfaces inside the calling script as a Lua error.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("bad argument #{position} ('{parameter}') to '{function}': {failure}")]
pub struct ArgumentConversionError {
    pub function: String,
    /// 1-based, as Lua reports positions
    pub position: usize,
    pub parameter: String,
    pub failure: ConversionFailure,
}

/// Find an [`ArgumentConversionError`] anywhere in an mlua error chain
pub fn find_conversion_error(err: &mlua::Error) -> Option<&ArgumentConversionError> {
    match err {
        mlua::Error::CallbackError { cause, .. } => find_conversion_error(cause),
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<ArgumentConversionError>(),
        mlua::Error::WithContext { cause, .. } => find_conversion_error(cause),
        _ => None,
    }
}
