//! Engine configuration
//!
//! Settings the host hands to the engine at creation time, plus a small
//! [`Config`] trait for loading/saving them from TOML or RON files.

pub use serde::{Deserialize, Serialize};

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

        // Dispatch on extension
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
            ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
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

/// # Engine Settings
///
/// Host-tunable knobs for engine creation. Everything here has a sensible
/// default; hosts typically load this from a TOML file next to the binary
/// and fall back to `Default` when the file is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Application name reported to the graphics driver
    pub app_name: String,
    /// Initial vertical-sync state; can be flipped per frame afterwards
    pub vsync: bool,
    /// Force validation layers on or off; `None` follows the build profile
    pub enable_validation: Option<bool>,
    /// Preferred swapchain image count, clamped to what the surface supports
    pub preferred_image_count: u32,
    /// Whether the host should open a second window with the debug overlay
    pub debug_overlay: bool,
}

impl EngineSettings {
    /// Check settings for values the engine cannot work with
    pub fn validate(&self) -> Result<(), String> {
        if self.app_name.is_empty() {
            return Err("app_name must not be empty".to_string());
        }
        if self.preferred_image_count == 0 {
            return Err("preferred_image_count must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            app_name: "rt_engine host".to_string(),
            vsync: true,
            enable_validation: None,
            preferred_image_count: 3,
            debug_overlay: false,
        }
    }
}

impl Config for EngineSettings {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = EngineSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.preferred_image_count, 3);
        assert!(settings.vsync);
    }

    #[test]
    fn test_settings_reject_zero_image_count() {
        let settings = EngineSettings {
            preferred_image_count: 0,
            ..EngineSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_parse_partial_toml() {
        let parsed: EngineSettings = toml::from_str(
            r#"
            app_name = "cornell"
            vsync = false
            "#,
        )
        .unwrap();
        assert_eq!(parsed.app_name, "cornell");
        assert!(!parsed.vsync);
        // Unspecified fields fall back to defaults
        assert_eq!(parsed.preferred_image_count, 3);
        assert!(!parsed.debug_overlay);
    }

    #[test]
    fn test_settings_round_trip_through_ron() {
        let dir = std::env::temp_dir().join("rt_engine_config_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.ron");
        let path = path.to_str().unwrap();

        let settings = EngineSettings {
            vsync: false,
            debug_overlay: true,
            ..EngineSettings::default()
        };
        settings.save_to_file(path).unwrap();
        let loaded = EngineSettings::load_from_file(path).unwrap();
        assert_eq!(loaded.app_name, settings.app_name);
        assert!(!loaded.vsync);
        assert!(loaded.debug_overlay);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let result = EngineSettings::default().save_to_file("settings.yaml");
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }
}
