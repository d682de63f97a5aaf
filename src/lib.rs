//! tracksense - runtime tracking and fingerprinting detection for web pages.
//!
//! This library observes a page through an explicit host model, detects
//! behavior commonly used for user tracking and fingerprinting, and
//! consolidates findings per browsing target into a single severity for
//! display.
//!
//! # What is inspected
//!
//! - **Capability calls**: selected page APIs are wrapped so each call is
//!   observed, then forwarded untouched
//! - **Static page state**: global handlers, inline attributes, script text
//! - **Cookie names only**: cookie values never enter evidence
//! - **Nothing is blocked**: the page behaves exactly as before
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          tracksense                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │  Platform   │──▶│ Interceptor │──▶│  Detectors  │         │
//! │  │   (page)    │   │ (registry)  │   │ (4 kinds)   │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! │                                             │                │
//! │                                             ▼                │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │   Display   │◀──│ Aggregator  │◀──│  Scheduler  │         │
//! │  │  (events)   │   │ (per target)│   │ (load/tick) │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tracksense::{core, diagnostics, platform, Config};
//!
//! let config = Config::default();
//! let page = platform::Page::builder("https://example.com").build();
//! let log = diagnostics::create_shared_log();
//!
//! let aggregator = core::Aggregator::from_config(&config).with_diagnostics(log.clone());
//! let target = core::TargetKey::new("tab-1");
//! let mut session = core::Session::from_config(target.clone(), page, &config, log)
//!     .expect("detectors build");
//!
//! for message in session.run_pass(core::Trigger::Load) {
//!     aggregator.apply(message);
//! }
//! let state = aggregator.state(&target);
//! ```

pub mod config;
pub mod core;
pub mod detectors;
pub mod diagnostics;
pub mod instrument;
pub mod platform;

// Re-export key types at crate root for convenience
pub use config::{CategoryConfig, Config, ConfigError};
pub use core::{
    Aggregator, AggregatorMessage, Badge, BadgeUpdate, ConsolidatedState, DisplayEvent,
    MergeWorker, Scheduler, Session, SessionHandle, Severity, SeverityThresholds, TargetKey,
    Trigger,
};
pub use detectors::{Category, DetectionPolicy, Detector, DetectorError, Finding, FindingSet};
pub use diagnostics::{DiagnosticsLog, DiagnosticsStats, SharedDiagnosticsLog};
pub use instrument::{InstrumentError, InstrumentationRegistry};
pub use platform::{Page, PageFixture, SharedPage};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Notice describing what detection looks at, for display to users.
pub const DETECTION_NOTICE: &str = r#"
╔══════════════════════════════════════════════════════════════════╗
║                  TRACKSENSE - DETECTION NOTICE                   ║
╠══════════════════════════════════════════════════════════════════╣
║                                                                  ║
║  tracksense watches how a page uses browser APIs that are        ║
║  commonly used for tracking and fingerprinting.                  ║
║                                                                  ║
║  ✓ WHAT WE INSPECT:                                              ║
║    • Pointer, scroll and click handler registration              ║
║    • Reads of user agent, plugins and screen geometry            ║
║    • Requests to known tracker domains                           ║
║    • Cookie names (never their values)                           ║
║    • Audio, font, canvas and WebGL probing calls                 ║
║                                                                  ║
║  ✗ WHAT WE NEVER DO:                                             ║
║    • Block or alter what the page does                           ║
║    • Record cookie values or form contents                       ║
║    • Send anything off this machine                              ║
║                                                                  ║
║  Findings are heuristics. Obfuscated or novel techniques may     ║
║  go unnoticed.                                                   ║
║                                                                  ║
╚══════════════════════════════════════════════════════════════════╝
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_notice_contents() {
        assert!(DETECTION_NOTICE.contains("DETECTION NOTICE"));
        assert!(DETECTION_NOTICE.contains("NEVER DO"));
        assert!(DETECTION_NOTICE.contains("never their values"));
    }
}
