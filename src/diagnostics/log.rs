//! Detection diagnostics log.
//!
//! Counts what the pipeline did during a session (passes run, sets merged,
//! interceptors installed, failures) so hosts can show how much inspection
//! took place. No page content is kept here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Diagnostics counters for the current process.
#[derive(Debug)]
pub struct DiagnosticsLog {
    /// Number of detector passes completed
    passes_completed: AtomicU64,
    /// Number of finding sets merged by the aggregator
    sets_merged: AtomicU64,
    /// Number of failed detector passes
    detector_failures: AtomicU64,
    /// Number of interceptors installed
    interceptors_installed: AtomicU64,
    /// Number of install attempts refused because of a foreign wrapper
    instrumentation_conflicts: AtomicU64,
    /// Number of install attempts on capabilities the page lacks
    capabilities_unavailable: AtomicU64,
    /// Session start time
    session_start: DateTime<Utc>,
}

impl DiagnosticsLog {
    pub fn new() -> Self {
        Self {
            passes_completed: AtomicU64::new(0),
            sets_merged: AtomicU64::new(0),
            detector_failures: AtomicU64::new(0),
            interceptors_installed: AtomicU64::new(0),
            instrumentation_conflicts: AtomicU64::new(0),
            capabilities_unavailable: AtomicU64::new(0),
            session_start: Utc::now(),
        }
    }

    pub fn record_pass_completed(&self) {
        self.passes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set_merged(&self) {
        self.sets_merged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_detector_failure(&self) {
        self.detector_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_interceptor_installed(&self) {
        self.interceptors_installed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_instrumentation_conflict(&self) {
        self.instrumentation_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capability_unavailable(&self) {
        self.capabilities_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn stats(&self) -> DiagnosticsStats {
        DiagnosticsStats {
            passes_completed: self.passes_completed.load(Ordering::Relaxed),
            sets_merged: self.sets_merged.load(Ordering::Relaxed),
            detector_failures: self.detector_failures.load(Ordering::Relaxed),
            interceptors_installed: self.interceptors_installed.load(Ordering::Relaxed),
            instrumentation_conflicts: self.instrumentation_conflicts.load(Ordering::Relaxed),
            capabilities_unavailable: self.capabilities_unavailable.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Session Statistics:\n\
             - Detector passes completed: {}\n\
             - Finding sets merged: {}\n\
             - Detector failures: {}\n\
             - Interceptors installed: {}\n\
             - Instrumentation conflicts: {}\n\
             - Unavailable capabilities: {}\n\
             - Session duration: {} seconds",
            stats.passes_completed,
            stats.sets_merged,
            stats.detector_failures,
            stats.interceptors_installed,
            stats.instrumentation_conflicts,
            stats.capabilities_unavailable,
            stats.session_duration_secs
        )
    }

    /// Reset all counters.
    pub fn reset(&self) {
        self.passes_completed.store(0, Ordering::Relaxed);
        self.sets_merged.store(0, Ordering::Relaxed);
        self.detector_failures.store(0, Ordering::Relaxed);
        self.interceptors_installed.store(0, Ordering::Relaxed);
        self.instrumentation_conflicts.store(0, Ordering::Relaxed);
        self.capabilities_unavailable.store(0, Ordering::Relaxed);
    }
}

impl Default for DiagnosticsLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of diagnostics counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsStats {
    pub passes_completed: u64,
    pub sets_merged: u64,
    pub detector_failures: u64,
    pub interceptors_installed: u64,
    pub instrumentation_conflicts: u64,
    pub capabilities_unavailable: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

/// Thread-safe shared diagnostics log.
pub type SharedDiagnosticsLog = Arc<DiagnosticsLog>;

/// Create a new shared diagnostics log.
pub fn create_shared_log() -> SharedDiagnosticsLog {
    Arc::new(DiagnosticsLog::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_log_counting() {
        let log = DiagnosticsLog::new();

        log.record_pass_completed();
        log.record_pass_completed();
        log.record_interceptor_installed();
        log.record_capability_unavailable();

        let stats = log.stats();
        assert_eq!(stats.passes_completed, 2);
        assert_eq!(stats.interceptors_installed, 1);
        assert_eq!(stats.capabilities_unavailable, 1);
        assert_eq!(stats.detector_failures, 0);
    }

    #[test]
    fn test_diagnostics_log_reset() {
        let log = DiagnosticsLog::new();

        log.record_set_merged();
        log.record_detector_failure();
        log.reset();

        let stats = log.stats();
        assert_eq!(stats.sets_merged, 0);
        assert_eq!(stats.detector_failures, 0);
    }

    #[test]
    fn test_summary_format() {
        let log = DiagnosticsLog::new();
        let summary = log.summary();

        assert!(summary.contains("Detector passes"));
        assert!(summary.contains("Interceptors installed"));
        assert!(summary.contains("Session duration"));
    }
}
