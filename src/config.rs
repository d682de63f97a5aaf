//! Configuration for tracksense.

use crate::core::severity::SeverityThresholds;
use crate::detectors::{Category, DetectionPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interval between periodic detector passes
    #[serde(with = "duration_serde")]
    pub poll_interval: Duration,

    /// Severity thresholds
    pub severity: SeverityThresholds,

    /// Which detector categories run
    pub categories: CategoryConfig,

    /// How `detected` is derived from the evidence
    pub policy: DetectionPolicy,

    /// Evidence entries kept per signal
    pub max_evidence_per_signal: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5000),
            severity: SeverityThresholds::default(),
            categories: CategoryConfig::default(),
            policy: DetectionPolicy::default(),
            max_evidence_per_signal: 200,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tracksense")
            .join("config.json")
    }
}

/// Which detector categories run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CategoryConfig {
    pub behavior: bool,
    pub system_browser: bool,
    pub audio_font: bool,
    pub canvas_webgl: bool,
}

impl Default for CategoryConfig {
    fn default() -> Self {
        Self {
            behavior: true,
            system_browser: true,
            audio_font: true,
            canvas_webgl: true,
        }
    }
}

impl CategoryConfig {
    /// Parse category configuration from a comma-separated string.
    /// Unknown names are ignored.
    pub fn from_csv(s: &str) -> Self {
        let mut config = Self {
            behavior: false,
            system_browser: false,
            audio_font: false,
            canvas_webgl: false,
        };
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if name.eq_ignore_ascii_case("all") {
                return Self::default();
            }
            match name.parse::<Category>() {
                Ok(category) => config.set(category, true),
                Err(e) => tracing::warn!(error = %e, "ignoring category"),
            }
        }
        config
    }

    pub fn enabled(&self, category: Category) -> bool {
        match category {
            Category::Behavior => self.behavior,
            Category::SystemBrowser => self.system_browser,
            Category::AudioFont => self.audio_font,
            Category::CanvasWebgl => self.canvas_webgl,
        }
    }

    pub fn set(&mut self, category: Category, enabled: bool) {
        match category {
            Category::Behavior => self.behavior = enabled,
            Category::SystemBrowser => self.system_browser = enabled,
            Category::AudioFont => self.audio_font = enabled,
            Category::CanvasWebgl => self.canvas_webgl = enabled,
        }
    }

    /// Check if at least one category is enabled.
    pub fn any_enabled(&self) -> bool {
        Category::ALL.iter().any(|c| self.enabled(*c))
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialize error: {0}")]
    Serialize(String),
}

/// Serde support for Duration, in milliseconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_config_parsing() {
        let config = CategoryConfig::from_csv("behavior,canvas");
        assert!(config.behavior);
        assert!(config.canvas_webgl);
        assert!(!config.system_browser);
        assert!(!config.audio_font);

        let config = CategoryConfig::from_csv("all");
        assert!(config.any_enabled());
        assert!(config.audio_font);

        let config = CategoryConfig::from_csv("network");
        assert!(!config.any_enabled());
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.poll_interval, Duration::from_millis(5000));
        assert_eq!(config.severity.moderate_max, 5);
        assert_eq!(config.policy, DetectionPolicy::SuspiciousOnly);
        assert_eq!(config.max_evidence_per_signal, 200);
        assert!(config.categories.any_enabled());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"poll_interval": 250, "categories": {"audioFont": false}, "policy": "any-evidence"}"#,
        )
        .unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert!(!config.categories.audio_font);
        assert!(config.categories.behavior);
        assert_eq!(config.policy, DetectionPolicy::AnyEvidence);
        assert_eq!(config.severity, SeverityThresholds::default());
    }

    #[test]
    fn test_save_and_load_from_path() {
        let dir = std::env::temp_dir().join(format!("tracksense-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        let config = Config {
            severity: SeverityThresholds::behavioral(),
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), Config::default());
    }
}
