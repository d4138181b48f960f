//! Player settings and their persistence

use crate::broker::{CacheControl, LOCAL_DRIVER};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Player settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Settings {
    /// Backend selector; only the local server is supported
    #[serde(default)]
    pub driver: Option<String>,
    /// Server-side sink for new playbacks
    #[serde(default)]
    pub device: Option<String>,
    /// ALSA device the local server renders to
    #[serde(default = "default_alsa_device")]
    pub alsa_device: String,
    /// Sound theme searched for event sounds
    #[serde(default = "default_theme")]
    pub theme: String,
    /// Output profile subdirectory inside the theme
    #[serde(default = "default_output_profile")]
    pub output_profile: String,
    /// Default cache-control directive: never, permanent or volatile
    #[serde(default)]
    pub cache_control: Option<String>,
    #[serde(default = "default_application_name")]
    pub application_name: String,
    /// Discard audio instead of opening ALSA
    #[serde(default)]
    pub null_output: bool,
}

fn default_alsa_device() -> String {
    "default".to_string()
}

fn default_theme() -> String {
    crate::sound::DEFAULT_THEME.to_string()
}

fn default_output_profile() -> String {
    crate::sound::DEFAULT_OUTPUT_PROFILE.to_string()
}

fn default_application_name() -> String {
    "r-chime".to_string()
}

/// Error types for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            driver: None,
            device: None,
            alsa_device: default_alsa_device(),
            theme: default_theme(),
            output_profile: default_output_profile(),
            cache_control: None,
            application_name: default_application_name(),
            null_output: false,
        }
    }
}

impl Settings {
    /// Load settings from a file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    /// Save settings to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(&self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("r-chime")
            .join("config.json")
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(driver) = &self.driver {
            if driver != LOCAL_DRIVER {
                return Err(ConfigError::ValidationError(format!(
                    "Unsupported driver '{}'",
                    driver
                )));
            }
        }

        if self.theme.is_empty() {
            return Err(ConfigError::ValidationError("Theme cannot be empty".to_string()));
        }
        if self.output_profile.is_empty() {
            return Err(ConfigError::ValidationError(
                "Output profile cannot be empty".to_string(),
            ));
        }
        if self.alsa_device.is_empty() {
            return Err(ConfigError::ValidationError(
                "ALSA device cannot be empty".to_string(),
            ));
        }

        if let Some(directive) = &self.cache_control {
            directive.parse::<CacheControl>().map_err(|_| {
                ConfigError::ValidationError(format!("Unknown cache control '{}'", directive))
            })?;
        }

        Ok(())
    }
}
