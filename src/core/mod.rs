//! Core pipeline for tracksense.
//!
//! This module contains:
//! - The emission scheduler that drives detector passes
//! - The aggregator consolidating finding sets per target
//! - Severity classification and the display wire types

pub mod aggregator;
pub mod display;
pub mod scheduler;
pub mod severity;
pub mod worker;

// Re-export commonly used types
pub use aggregator::{
    AggregateError, Aggregator, AggregatorMessage, ConsolidatedState, SharedAggregator, TargetKey,
};
pub use display::{render_text, Badge, BadgeUpdate, Diagnostic, DisplayEvent};
pub use scheduler::{Scheduler, Session, SessionHandle, Trigger};
pub use severity::{Severity, SeverityThresholds};
pub use worker::MergeWorker;
