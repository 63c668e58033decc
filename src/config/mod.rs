use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::binding::WhitelistPolicy;

/// Host configuration, read once at start-up
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostConfig {
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub whitelist: WhitelistConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Directory scanned for plugin scripts
    #[serde(default = "default_plugin_dir")]
    pub directory: PathBuf,

    /// Where each plugin's `<name>.yaml` configuration is kept
    #[serde(default = "default_plugin_config_dir")]
    pub config_directory: PathBuf,

    /// Script file extension, without the dot
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Reload plugins when their files change
    #[serde(default = "default_true")]
    pub watch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistConfig {
    /// Host assemblies whose types may be exposed
    #[serde(default = "default_assemblies")]
    pub assemblies: Vec<String>,

    /// Namespace prefixes exposed from those assemblies
    #[serde(default = "default_namespaces")]
    pub namespaces: Vec<String>,

    /// Core host API type, exposed wherever it lives
    #[serde(default = "default_entry_type")]
    pub entry_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Strip process-level functions (`os.execute`, `io.popen`, ...) from scripts
    #[serde(default = "default_true")]
    pub sandbox: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_base_dir() -> PathBuf {
    dirs::home_dir().map_or_else(|| PathBuf::from(".hookhost"), |home| home.join(".hookhost"))
}

fn default_plugin_dir() -> PathBuf {
    default_base_dir().join("plugins")
}

fn default_plugin_config_dir() -> PathBuf {
    default_base_dir().join("config")
}

fn default_extension() -> String {
    "lua".to_string()
}

fn default_assemblies() -> Vec<String> {
    vec!["Host.Core".to_string()]
}

fn default_namespaces() -> Vec<String> {
    vec!["Game".to_string()]
}

fn default_entry_type() -> Option<String> {
    Some("Host.Interface".to_string())
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directory: default_plugin_dir(),
            config_directory: default_plugin_config_dir(),
            extension: default_extension(),
            watch: true,
        }
    }
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            assemblies: default_assemblies(),
            namespaces: default_namespaces(),
            entry_type: default_entry_type(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { sandbox: true }
    }
}

impl WhitelistConfig {
    #[must_use]
    pub fn to_policy(&self) -> WhitelistPolicy {
        WhitelistPolicy::new(
            self.assemblies.iter().cloned(),
            self.namespaces.iter().cloned(),
            self.entry_type.clone(),
        )
    }
}

impl HostConfig {
    /// Load configuration from default location
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        if contents.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: HostConfig = serde_yaml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_yaml::to_string(self).context("Failed to serialize config")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        fs::write(path.as_ref(), contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get default configuration path
    pub fn default_config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;

        Ok(home.join(".hookhost").join("config.yaml"))
    }
}
