//! Configuration system

use std::path::PathBuf;

pub use serde::{Deserialize, Serialize};

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

        if path.ends_with(".toml") {
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else if path.ends_with(".ron") {
            ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = if path.ends_with(".toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else if path.ends_with(".ron") {
            ron::ser::to_string_pretty(self, Default::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        };

        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Display and GPU session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Window title
    pub title: String,
    /// Initial window width in pixels
    pub width: u32,
    /// Initial window height in pixels
    pub height: u32,
    /// Prefer a vsynced present mode
    pub vsync: bool,
    /// Default sample count for offscreen render targets
    pub msaa_samples: u32,
    /// Enable validation layers in debug builds
    pub enable_validation: bool,
    /// Directory for the compiled-shader byte-code cache
    pub shader_cache_dir: PathBuf,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            title: "render_engine".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
            msaa_samples: 1,
            enable_validation: cfg!(debug_assertions),
            shader_cache_dir: PathBuf::from("cache/shaders"),
        }
    }
}

impl Config for DisplayConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DisplayConfig::default();
        assert_eq!(config.width, 1280);
        assert_eq!(config.height, 720);
        assert_eq!(config.msaa_samples, 1);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = DisplayConfig {
            title: "test".to_string(),
            width: 640,
            height: 480,
            vsync: false,
            msaa_samples: 4,
            enable_validation: false,
            shader_cache_dir: PathBuf::from("tmp/shaders"),
        };

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: DisplayConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.width, 640);
        assert_eq!(parsed.msaa_samples, 4);
        assert!(!parsed.vsync);
    }
}
