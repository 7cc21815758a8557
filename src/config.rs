use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::auth::{FileStore, Provider};
use crate::engine::{Options, DEFAULT_APPLICATION_TAG};

/// Engine behavior settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Refresh credentials when they expire
    pub auto_refresh: bool,
    /// Namespace for stored credentials
    pub application_tag: String,
    /// Ask the browser for a private session
    pub ephemeral_browsing: bool,
    /// Require a biometric check before restoring credentials
    pub require_biometric_gate: bool,
    /// Credential file (defaults to the platform data directory)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<PathBuf>,
    /// Log filter used when RUST_LOG is unset
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auto_refresh: true,
            application_tag: DEFAULT_APPLICATION_TAG.to_string(),
            ephemeral_browsing: false,
            require_biometric_gate: false,
            credentials_path: None,
            log_filter: "oauthkit=info".to_string(),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    /// JSON provider descriptor to load in addition to inline providers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers_file: Option<PathBuf>,
    pub engine: EngineConfig,
    /// Providers declared inline as `[[providers]]` tables
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub providers: Vec<Provider>,
}

impl Config {
    /// Returns the default config file path: ~/.config/oauthkit/config.toml
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("oauthkit").join("config.toml"))
    }

    /// Load configuration from the default path, falling back to defaults.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from_path(&path).ok())
            .unwrap_or_default()
    }

    /// Load configuration from a specific path.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Invalid config: {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        match Self::default_path() {
            Some(path) => self.save_to_path(&path),
            None => Err(anyhow::anyhow!("Could not determine config directory")),
        }
    }

    /// Save configuration to a specific path.
    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Providers from `providers_file` followed by inline ones. An inline
    /// provider replaces a file provider with the same id.
    pub fn resolve_providers(&self) -> Result<Vec<Provider>> {
        let mut providers = match self.providers_file {
            Some(ref path) => Provider::load_descriptor(path)?,
            None => Vec::new(),
        };

        for provider in &self.providers {
            match providers.iter_mut().find(|p| p.id == provider.id) {
                Some(existing) => *existing = provider.clone(),
                None => providers.push(provider.clone()),
            }
        }
        Ok(providers)
    }

    /// Credential file to open.
    pub fn credentials_path(&self) -> Result<PathBuf> {
        match self.engine.credentials_path {
            Some(ref path) => Ok(path.clone()),
            None => FileStore::default_path(),
        }
    }

    /// Engine options for the configured flags. Collaborators (store,
    /// HTTP client, gate) are attached by the caller.
    pub fn to_options(&self) -> Options {
        Options::default()
            .with_auto_refresh(self.engine.auto_refresh)
            .with_application_tag(self.engine.application_tag.clone())
            .with_ephemeral_browsing(self.engine.ephemeral_browsing)
            .with_biometric_requirement(self.engine.require_biometric_gate)
    }
}
