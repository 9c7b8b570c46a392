//! Configuration management for clipshare
//!
//! Loads, validates, and saves the TOML configuration describing which
//! storage backend to use and where it lives.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// Validation error
    #[error("Config validation failed: {0}")]
    Validation(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage backend: "local", "s3", or "dropbox"
    #[serde(default = "default_backend_type")]
    pub backend_type: String,

    /// Shared folder path for the local backend
    #[serde(default)]
    pub location: String,

    /// S3 bucket name
    #[serde(default)]
    pub s3_bucket: String,

    /// Optional S3 key prefix
    #[serde(default)]
    pub s3_prefix: String,

    /// AWS region; the credential chain default applies when empty
    #[serde(default)]
    pub s3_region: String,

    /// Dropbox app key
    #[serde(default)]
    pub dropbox_app_key: String,

    /// Dropbox app secret
    #[serde(default)]
    pub dropbox_app_secret: String,

    /// Largest clipboard payload to publish, in bytes. Bounded above by
    /// the artifact format's 100 MiB payload ceiling.
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: u64,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_backend_type() -> String {
    "local".to_string()
}

fn default_max_payload_size() -> u64 {
    crate::artifact::MAX_PAYLOAD_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_type: default_backend_type(),
            location: String::new(),
            s3_bucket: String::new(),
            s3_prefix: String::new(),
            s3_region: String::new(),
            dropbox_app_key: String::new(),
            dropbox_app_secret: String::new(),
            max_payload_size: default_max_payload_size(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Checks in order:
    /// 1. Path from CLIPSHARE_CONFIG environment variable
    /// 2. ~/.config/clipshare/config.toml
    /// 3. Defaults if no file exists
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_path() {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(toml_str)?;
        config.expand_paths();
        config.validate_config()?;
        Ok(config)
    }

    /// Find configuration file path
    fn find_config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("CLIPSHARE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        dirs::config_dir()
            .map(|p| p.join("clipshare").join("config.toml"))
            .filter(|p| p.exists())
    }

    /// Expand tilde in the shared location
    fn expand_paths(&mut self) {
        if !self.location.is_empty() {
            self.location = shellexpand::tilde(&self.location).into_owned();
        }
    }

    /// Validate configuration values
    fn validate_config(&self) -> Result<(), ConfigError> {
        match self.backend_type.as_str() {
            "local" | "s3" | "dropbox" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "backend_type must be one of local, s3, dropbox (got \"{other}\")"
                )));
            }
        }

        if self.backend_type == "s3" && self.s3_bucket.is_empty() {
            return Err(ConfigError::Validation(
                "s3 backend requires s3_bucket".to_string(),
            ));
        }

        if self.backend_type == "dropbox" && self.dropbox_app_key.is_empty() {
            return Err(ConfigError::Validation(
                "dropbox backend requires dropbox_app_key".to_string(),
            ));
        }

        if self.max_payload_size < 1024 {
            return Err(ConfigError::Validation(
                "max_payload_size must be at least 1024 bytes (1KB)".to_string(),
            ));
        }
        if self.max_payload_size > crate::artifact::MAX_PAYLOAD_SIZE {
            return Err(ConfigError::Validation(format!(
                "max_payload_size must not exceed {} bytes (100MB)",
                crate::artifact::MAX_PAYLOAD_SIZE
            )));
        }

        Ok(())
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| {
                ConfigError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not find config directory",
                ))
            })?
            .join("clipshare");

        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let toml_string = toml::to_string_pretty(self).map_err(|e| {
            ConfigError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        std::fs::write(config_path, toml_string)?;
        Ok(())
    }

    /// Generate a commented example configuration file
    pub fn generate_example() -> String {
        let config = Config::default();
        format!(
            r#"# Clipshare Configuration File
# Location: ~/.config/clipshare/config.toml

# Storage backend: "local" (shared folder), "s3", or "dropbox"
backend_type = "{}"

# Shared folder for the local backend (absolute path)
location = ""

# S3 backend settings
s3_bucket = ""
s3_prefix = ""
s3_region = ""

# Dropbox backend settings (run `clipshare login` after filling these in)
dropbox_app_key = ""
dropbox_app_secret = ""

# Largest clipboard payload to publish, in bytes (at most 104857600)
max_payload_size = {}

# Logging level (trace, debug, info, warn, error)
log_level = "{}"
"#,
            config.backend_type, config.max_payload_size, config.log_level
        )
    }
}
