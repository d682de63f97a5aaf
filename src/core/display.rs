//! Messages published to display collaborators.

use crate::core::aggregator::{ConsolidatedState, TargetKey};
use crate::core::severity::Severity;
use crate::detectors::Category;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Pushed to every subscriber of a target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisplayEvent {
    /// The consolidated state after a merge.
    StateUpdated {
        target: TargetKey,
        state: Box<ConsolidatedState>,
    },
    /// The host renamed the target.
    LabelChanged { target: TargetKey, label: String },
}

impl DisplayEvent {
    pub fn target(&self) -> &TargetKey {
        match self {
            DisplayEvent::StateUpdated { target, .. } => target,
            DisplayEvent::LabelChanged { target, .. } => target,
        }
    }
}

/// Badge content for the toolbar surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Badge {
    /// Remove any badge.
    Clear,
    Show { text: String, color: String },
}

impl Badge {
    pub fn for_totals(total_detected: usize, severity: Severity) -> Self {
        match severity.badge_color() {
            Some(color) if total_detected > 0 => Badge::Show {
                text: total_detected.to_string(),
                color: color.to_string(),
            },
            _ => Badge::Clear,
        }
    }
}

/// Badge change for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BadgeUpdate {
    pub target: TargetKey,
    pub total_detected: usize,
    pub severity: Severity,
    pub badge: Badge,
}

impl BadgeUpdate {
    pub fn from_state(state: &ConsolidatedState) -> Self {
        Self {
            target: state.target.clone(),
            total_detected: state.total_detected,
            severity: state.severity,
            badge: Badge::for_totals(state.total_detected, state.severity),
        }
    }
}

/// A detector failure, published once per distinct message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub target: TargetKey,
    pub category: Category,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Plain-text rendering of a state: one row per category with its
/// detected signals.
pub fn render_text(state: &ConsolidatedState) -> String {
    let mut out = String::new();
    let label = state.label.as_deref().unwrap_or(state.target.as_str());
    out.push_str(&format!(
        "{label}: {} ({} detected)\n",
        state.severity, state.total_detected
    ));
    for (category, set) in &state.categories {
        let detected: Vec<&str> = set
            .findings()
            .filter(|f| f.detected())
            .map(|f| f.signal())
            .collect();
        let summary = if detected.is_empty() {
            "none".to_string()
        } else {
            detected.join(", ")
        };
        out.push_str(&format!("  {:<34} {summary}\n", category.title()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_badge_clear_when_nothing_detected() {
        assert_eq!(Badge::for_totals(0, Severity::None), Badge::Clear);
        assert_eq!(
            Badge::for_totals(3, Severity::Moderate),
            Badge::Show { text: "3".into(), color: "#FFA500".into() }
        );
        assert_eq!(
            Badge::for_totals(9, Severity::High),
            Badge::Show { text: "9".into(), color: "#FF0000".into() }
        );
    }

    #[test]
    fn test_display_event_wire_shape() {
        let event = DisplayEvent::LabelChanged {
            target: TargetKey::new("tab-1"),
            label: "example.com".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "label_changed");
        assert_eq!(json["target"], "tab-1");
        assert_eq!(event.target().as_str(), "tab-1");
    }
}
