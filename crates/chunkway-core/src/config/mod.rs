//! Configuration management for Chunkway.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/chunkway/config.toml` |
//! | macOS | `~/Library/Application Support/com.chunkway.Chunkway/config.toml` |
//! | Windows | `%APPDATA%\Chunkway\Chunkway\config\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use chunkway_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Chunk size: {}", config.upload.chunk_size);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::preflight::UploadSettings;

/// Main configuration struct for Chunkway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upload settings
    pub upload: UploadConfig,
    /// Endpoint settings
    pub endpoint: EndpointConfig,
    /// Image transform settings
    pub image: ImageConfig,
}

/// Upload configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Chunk size in bytes
    pub chunk_size: u64,
    /// Maximum entries transferring at once
    pub max_concurrency: usize,
    /// Artificial delay between chunks
    #[serde(with = "humantime_serde")]
    pub latency_sim: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            max_concurrency: crate::DEFAULT_MAX_CONCURRENCY,
            latency_sim: Duration::ZERO,
        }
    }
}

/// Directory endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Directory receiving uploaded files
    pub output_dir: PathBuf,
    /// Total bytes the endpoint accepts (None = unlimited)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<u64>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("uploads"),
            quota: None,
        }
    }
}

/// Image resize configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Resize images before upload
    pub resize: bool,
    /// Bounding box width
    pub max_width: u32,
    /// Bounding box height
    pub max_height: u32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            resize: false,
            max_width: 1920,
            max_height: 1080,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults when absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))
    }

    /// Save configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to `path`, creating its directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "chunkway", "Chunkway")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Check values that would make a transfer impossible.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        if self.upload.chunk_size == 0 {
            return Err(Error::InvalidConfig {
                key: "upload.chunk_size".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.upload.max_concurrency == 0 {
            return Err(Error::InvalidConfig {
                key: "upload.max_concurrency".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.image.resize && (self.image.max_width == 0 || self.image.max_height == 0) {
            return Err(Error::InvalidConfig {
                key: "image".into(),
                reason: "resize bounds must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Transfer settings for a local preflight.
    #[must_use]
    pub fn settings(&self) -> UploadSettings {
        UploadSettings {
            chunk_size: self.upload.chunk_size,
            max_concurrency: self.upload.max_concurrency,
        }
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();
        s.strip_suffix("ms")
            .map(|ms| {
                ms.parse()
                    .map(Duration::from_millis)
                    .map_err(serde::de::Error::custom)
            })
            .or_else(|| {
                s.strip_suffix('s').map(|secs| {
                    secs.parse()
                        .map(Duration::from_secs)
                        .map_err(serde::de::Error::custom)
                })
            })
            .unwrap_or_else(|| Err(serde::de::Error::custom("invalid duration format")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.upload.chunk_size, crate::DEFAULT_CHUNK_SIZE);
        assert_eq!(config.upload.max_concurrency, crate::DEFAULT_MAX_CONCURRENCY);
        assert_eq!(config.upload.latency_sim, Duration::ZERO);
        assert!(config.endpoint.quota.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.upload.chunk_size = 100_000;
        original.upload.latency_sim = Duration::from_millis(250);
        original.endpoint.quota = Some(1_000_000);
        original.image.resize = true;

        original.save_to(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();

        assert_eq!(loaded, original);
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let loaded = Config::load_from(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn test_config_deserialization_partial() {
        let partial_toml = r#"
[upload]
max_concurrency = 5
latency_sim = "2s"

[endpoint]
output_dir = "/srv/incoming"
"#;

        let config: Config = toml::from_str(partial_toml).expect("parse partial config");

        assert_eq!(config.upload.max_concurrency, 5);
        assert_eq!(config.upload.latency_sim, Duration::from_secs(2));
        assert_eq!(config.upload.chunk_size, crate::DEFAULT_CHUNK_SIZE);
        assert_eq!(config.endpoint.output_dir, PathBuf::from("/srv/incoming"));
        assert!(!config.image.resize);
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let result: std::result::Result<Config, _> = toml::from_str("[upload]\nlatency_sim = \"soon\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_unparseable_file_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "upload = [").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = Config::default();
        config.upload.chunk_size = 0;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { ref key, .. }) if key == "upload.chunk_size"
        ));

        let mut config = Config::default();
        config.upload.max_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.upload.chunk_size = 1234;
        config.upload.max_concurrency = 7;

        let settings = config.settings();
        assert_eq!(settings.chunk_size, 1234);
        assert_eq!(settings.max_concurrency, 7);
    }

    #[test]
    fn test_config_path() {
        assert!(Config::config_path().ends_with("config.toml"));
    }
}
