//! Diagnostics for the detection pipeline.
//!
//! This module counts what the pipeline does so that hosts can audit how
//! much page inspection took place.

pub mod log;

// Re-export commonly used types
pub use log::{create_shared_log, DiagnosticsLog, DiagnosticsStats, SharedDiagnosticsLog};
