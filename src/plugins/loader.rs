use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use super::config_bridge::ConfigStorage;
use super::manifest;
use super::module::PluginModule;
use crate::error::LoadError;
use crate::runtime::ScriptRuntime;

/// Finds plugin scripts in one directory and turns them into bound modules
pub struct PluginLoader {
    directory: PathBuf,
    extension: String,
    storage: Rc<dyn ConfigStorage>,
}

impl PluginLoader {
    pub fn new(directory: impl Into<PathBuf>, extension: &str, storage: Rc<dyn ConfigStorage>) -> Self {
        Self {
            directory: directory.into(),
            extension: extension.trim_start_matches('.').to_string(),
            storage,
        }
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    #[must_use]
    pub fn extension(&self) -> &str {
        &self.extension
    }

    #[must_use]
    pub fn is_plugin_file(&self, path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some(self.extension.as_str())
    }

    /// Plugin files currently in the directory, sorted by path.
    /// A missing directory holds no plugins.
    pub fn scan(&self) -> Result<Vec<PathBuf>> {
        if !self.directory.exists() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        let entries = fs::read_dir(&self.directory)
            .with_context(|| format!("Failed to read plugin directory {}", self.directory.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && self.is_plugin_file(&path) {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }

    pub fn module_name(&self, path: &Path) -> Result<String, LoadError> {
        manifest::module_name(path)
    }

    pub fn load(&self, runtime: &ScriptRuntime, path: &Path) -> Result<PluginModule, LoadError> {
        PluginModule::load(runtime, path, Rc::clone(&self.storage))
    }
}
