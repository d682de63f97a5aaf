//! Per-target consolidation of finding sets.
//!
//! The aggregator keeps one [`ConsolidatedState`] per target. Each entry
//! has its own lock; the map lock is held only for lookups, so merges for
//! different targets never contend and merges for one target are
//! serialized.

use crate::config::{CategoryConfig, Config};
use crate::core::display::{BadgeUpdate, Diagnostic, DisplayEvent};
use crate::core::severity::{Severity, SeverityThresholds};
use crate::detectors::{Category, DetectorError, FindingSet};
use crate::diagnostics::{create_shared_log, SharedDiagnosticsLog};
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;

/// Host-supplied target identifier. Opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TargetKey(String);

impl TargetKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Merged view of everything detected for one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedState {
    pub target: TargetKey,
    pub label: Option<String>,
    pub categories: BTreeMap<Category, FindingSet>,
    pub total_detected: usize,
    pub any_suspicious: bool,
    pub severity: Severity,
    /// Incremented on every change to the merged data.
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl ConsolidatedState {
    pub fn new(target: TargetKey, label: Option<String>) -> Self {
        Self {
            target,
            label,
            categories: BTreeMap::new(),
            total_detected: 0,
            any_suspicious: false,
            severity: Severity::None,
            revision: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn category(&self, category: Category) -> Option<&FindingSet> {
        self.categories.get(&category)
    }

    /// Whether `signal` of `category` is currently detected.
    pub fn is_detected(&self, category: Category, signal: &str) -> bool {
        self.category(category)
            .and_then(|set| set.get(signal))
            .map(|f| f.detected())
            .unwrap_or(false)
    }

    fn recompute(&mut self, thresholds: &SeverityThresholds) {
        self.total_detected = self.categories.values().map(FindingSet::detected_count).sum();
        self.any_suspicious = self.categories.values().any(FindingSet::any_suspicious);
        self.severity = thresholds.classify(self.total_detected, self.any_suspicious);
    }
}

/// Aggregation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    #[error("finding set for {found} submitted as {expected}")]
    CategoryMismatch { expected: Category, found: Category },
}

/// A message from a detector session to the aggregator.
#[derive(Debug, Clone)]
pub enum AggregatorMessage {
    Findings {
        target: TargetKey,
        category: Category,
        set: FindingSet,
    },
    Failure {
        target: TargetKey,
        category: Category,
        error: DetectorError,
    },
    Identify { target: TargetKey, label: String },
}

#[derive(Default)]
struct TargetEntry {
    label: Option<String>,
    state: Option<ConsolidatedState>,
    subscribers: Vec<Sender<DisplayEvent>>,
    reported: HashSet<(Category, String)>,
    evicted: bool,
}

impl TargetEntry {
    fn publish(&mut self, event: DisplayEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Shared per-target store.
pub struct Aggregator {
    thresholds: SeverityThresholds,
    categories: CategoryConfig,
    entries: RwLock<HashMap<TargetKey, Arc<Mutex<TargetEntry>>>>,
    badge_subscribers: Mutex<Vec<Sender<BadgeUpdate>>>,
    diagnostic_subscribers: Mutex<Vec<Sender<Diagnostic>>>,
    log: SharedDiagnosticsLog,
}

/// Aggregator shared between the merge worker and display hosts.
pub type SharedAggregator = Arc<Aggregator>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("thresholds", &self.thresholds)
            .field("categories", &self.categories)
            .field("targets", &self.targets().len())
            .finish()
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(SeverityThresholds::default(), CategoryConfig::default())
    }
}

impl Aggregator {
    pub fn new(thresholds: SeverityThresholds, categories: CategoryConfig) -> Self {
        Self {
            thresholds,
            categories,
            entries: RwLock::new(HashMap::new()),
            badge_subscribers: Mutex::new(Vec::new()),
            diagnostic_subscribers: Mutex::new(Vec::new()),
            log: create_shared_log(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.severity, config.categories)
    }

    /// Count merges and failures in `log`.
    pub fn with_diagnostics(mut self, log: SharedDiagnosticsLog) -> Self {
        self.log = log;
        self
    }

    pub fn diagnostics(&self) -> &SharedDiagnosticsLog {
        &self.log
    }

    /// Record the human-readable label of `target`.
    pub fn identify(&self, target: &TargetKey, label: &str) {
        self.with_entry(target, |entry| {
            if entry.label.as_deref() == Some(label) {
                return;
            }
            entry.label = Some(label.to_string());
            if let Some(state) = entry.state.as_mut() {
                state.label = Some(label.to_string());
                state.revision += 1;
                state.updated_at = Utc::now();
            }
            tracing::debug!(target_key = %target, label, "target label changed");
            entry.publish(DisplayEvent::LabelChanged {
                target: target.clone(),
                label: label.to_string(),
            });
        });
    }

    /// Merge `set` into the state of `target`.
    ///
    /// Signals in `set` overwrite their stored counterparts; signals it
    /// does not carry are left as they are. Subscribers of the target get
    /// the resulting state; badge subscribers hear about it when anything
    /// changed.
    pub fn merge(
        &self,
        target: &TargetKey,
        category: Category,
        set: FindingSet,
    ) -> Result<ConsolidatedState, AggregateError> {
        if set.category() != category {
            return Err(AggregateError::CategoryMismatch {
                expected: category,
                found: set.category(),
            });
        }

        if !self.categories.enabled(category) {
            tracing::debug!(target_key = %target, %category, "ignoring disabled category");
            return Ok(self
                .state(target)
                .unwrap_or_else(|| ConsolidatedState::new(target.clone(), None)));
        }

        let (snapshot, changed) = self.with_entry(target, |entry| {
            let label = entry.label.clone();
            let state = entry
                .state
                .get_or_insert_with(|| ConsolidatedState::new(target.clone(), label));
            let changed = match state.categories.get_mut(&category) {
                Some(stored) => stored.merge(set),
                None => {
                    state.categories.insert(category, set);
                    true
                }
            };
            state.recompute(&self.thresholds);
            if changed {
                state.revision += 1;
                state.updated_at = Utc::now();
            }
            let snapshot = state.clone();
            entry.publish(DisplayEvent::StateUpdated {
                target: target.clone(),
                state: Box::new(snapshot.clone()),
            });
            (snapshot, changed)
        });
        self.log.record_set_merged();

        if changed {
            tracing::debug!(
                target_key = %target,
                %category,
                total = snapshot.total_detected,
                severity = %snapshot.severity,
                "consolidated state changed"
            );
            let update = BadgeUpdate::from_state(&snapshot);
            lock(&self.badge_subscribers).retain(|tx| tx.send(update.clone()).is_ok());
        }
        Ok(snapshot)
    }

    /// Apply one message from a detector session.
    pub fn apply(&self, message: AggregatorMessage) {
        match message {
            AggregatorMessage::Findings {
                target,
                category,
                set,
            } => {
                self.log.record_pass_completed();
                if let Err(e) = self.merge(&target, category, set) {
                    tracing::warn!(target_key = %target, error = %e, "finding set rejected");
                }
            }
            AggregatorMessage::Failure {
                target,
                category,
                error,
            } => self.report_failure(&target, category, &error),
            AggregatorMessage::Identify { target, label } => self.identify(&target, &label),
        }
    }

    /// Events for `target`. The current state, when there is one, is
    /// delivered immediately.
    pub fn subscribe(&self, target: &TargetKey) -> Receiver<DisplayEvent> {
        let (tx, rx) = unbounded();
        self.with_entry(target, |entry| {
            if let Some(state) = entry.state.clone() {
                // Receiver is alive, send cannot fail.
                let _ = tx.send(DisplayEvent::StateUpdated {
                    target: target.clone(),
                    state: Box::new(state),
                });
            }
            entry.subscribers.push(tx);
        });
        rx
    }

    pub fn subscribe_badges(&self) -> Receiver<BadgeUpdate> {
        let (tx, rx) = unbounded();
        lock(&self.badge_subscribers).push(tx);
        rx
    }

    pub fn subscribe_diagnostics(&self) -> Receiver<Diagnostic> {
        let (tx, rx) = unbounded();
        lock(&self.diagnostic_subscribers).push(tx);
        rx
    }

    pub fn state(&self, target: &TargetKey) -> Option<ConsolidatedState> {
        let entry = self.lookup(target)?;
        let entry = lock(&entry);
        entry.state.clone()
    }

    /// Known targets, sorted.
    pub fn targets(&self) -> Vec<TargetKey> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut targets: Vec<TargetKey> = entries.keys().cloned().collect();
        targets.sort();
        targets
    }

    /// Forget `target`: its state, its subscribers and its reported
    /// failures. Returns the last state.
    pub fn evict(&self, target: &TargetKey) -> Option<ConsolidatedState> {
        let removed = match self.entries.write() {
            Ok(mut guard) => guard.remove(target),
            Err(poisoned) => poisoned.into_inner().remove(target),
        }?;
        tracing::debug!(target_key = %target, "target evicted");
        let mut entry = lock(&removed);
        entry.evicted = true;
        entry.subscribers.clear();
        entry.state.take()
    }

    /// Record a failed detector pass. Counted every time; published to
    /// diagnostics subscribers once per distinct message. Stored findings
    /// are untouched.
    pub fn report_failure(&self, target: &TargetKey, category: Category, error: &DetectorError) {
        self.log.record_detector_failure();
        let message = error.to_string();
        tracing::warn!(target_key = %target, %category, error = %message, "detector pass failed");

        let first = self.with_entry(target, |entry| {
            entry.reported.insert((category, message.clone()))
        });
        if !first {
            return;
        }
        let diagnostic = Diagnostic {
            target: target.clone(),
            category,
            message,
            at: Utc::now(),
        };
        lock(&self.diagnostic_subscribers).retain(|tx| tx.send(diagnostic.clone()).is_ok());
    }

    fn lookup(&self, target: &TargetKey) -> Option<Arc<Mutex<TargetEntry>>> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.get(target).cloned()
    }

    fn entry(&self, target: &TargetKey) -> Arc<Mutex<TargetEntry>> {
        if let Some(entry) = self.lookup(target) {
            return entry;
        }
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.entry(target.clone()).or_default().clone()
    }

    /// Run `f` on the live entry of `target` under its lock. An entry
    /// already marked evicted is skipped and the lookup retried; a write
    /// that wins the lock before the mark is part of the state `evict`
    /// returns.
    fn with_entry<R>(&self, target: &TargetKey, f: impl FnOnce(&mut TargetEntry) -> R) -> R {
        loop {
            let entry = self.entry(target);
            let mut guard = lock(&entry);
            if guard.evicted {
                continue;
            }
            return f(&mut guard);
        }
    }
}
