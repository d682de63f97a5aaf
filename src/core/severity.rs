//! Severity classification of a consolidated state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall tracking severity for a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    #[default]
    None,
    Moderate,
    High,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::None => "NONE",
            Severity::Moderate => "MODERATE",
            Severity::High => "HIGH",
        }
    }

    /// Badge background color, `None` when no badge is shown.
    pub fn badge_color(&self) -> Option<&'static str> {
        match self {
            Severity::None => None,
            Severity::Moderate => Some("#FFA500"),
            Severity::High => Some("#FF0000"),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Detected-signal counts at which severity steps up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityThresholds {
    /// Highest total that is still MODERATE.
    pub moderate_max: usize,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self::full()
    }
}

impl SeverityThresholds {
    /// Thresholds for the full four-category view.
    pub fn full() -> Self {
        Self { moderate_max: 5 }
    }

    /// Thresholds for a behavior-only view.
    pub fn behavioral() -> Self {
        Self { moderate_max: 2 }
    }

    /// Classify `total_detected`. HIGH requires at least one suspicious
    /// finding; without one the result stops at MODERATE.
    pub fn classify(&self, total_detected: usize, any_suspicious: bool) -> Severity {
        match total_detected {
            0 => Severity::None,
            n if n <= self.moderate_max || !any_suspicious => Severity::Moderate,
            _ => Severity::High,
        }
    }
}
