//! Finding types shared by every detector.
//!
//! A [`Finding`] is immutable once built and always satisfies
//! `suspicious => detected`.

use crate::platform::dom::ElementRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

/// Detector category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    Behavior,
    SystemBrowser,
    AudioFont,
    CanvasWebgl,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Behavior,
        Category::SystemBrowser,
        Category::AudioFont,
        Category::CanvasWebgl,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Category::Behavior => "behavior",
            Category::SystemBrowser => "systemBrowser",
            Category::AudioFont => "audioFont",
            Category::CanvasWebgl => "canvasWebgl",
        }
    }

    /// Row title for display surfaces.
    pub fn title(&self) -> &'static str {
        match self {
            Category::Behavior => "Behavioral Tracking",
            Category::SystemBrowser => "System and Browser Details",
            Category::AudioFont => "Audio and Font Fingerprinting",
            Category::CanvasWebgl => "Canvas and WebGL Fingerprinting",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "behavior" | "behavioral" => Ok(Category::Behavior),
            "systembrowser" | "system" => Ok(Category::SystemBrowser),
            "audiofont" | "audio" | "font" => Ok(Category::AudioFont),
            "canvaswebgl" | "canvas" | "webgl" => Ok(Category::CanvasWebgl),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

/// How `detected` is derived from an assessment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionPolicy {
    /// A signal counts as detected only when the heuristic calls it suspicious.
    #[default]
    SuspiciousOnly,
    /// Any evidence makes a signal detected.
    AnyEvidence,
}

impl FromStr for DetectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "suspicious-only" | "suspicious" => Ok(DetectionPolicy::SuspiciousOnly),
            "any-evidence" | "any" => Ok(DetectionPolicy::AnyEvidence),
            other => Err(format!("unknown detection policy: {other}")),
        }
    }
}

/// Detector verdict for one signal before the policy is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Assessment {
    /// Some evidence for the signal exists.
    pub observed: bool,
    /// The category heuristic considers the evidence tracking-like.
    pub suspicious: bool,
}

/// One piece of evidence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Evidence {
    Text(String),
    Element(ElementRef),
}

impl Evidence {
    pub fn text(s: impl Into<String>) -> Self {
        Evidence::Text(s.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Evidence::Text(s) => Some(s),
            Evidence::Element(_) => None,
        }
    }
}

impl fmt::Display for Evidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Evidence::Text(s) => f.write_str(s),
            Evidence::Element(el) => write!(f, "<{el}>"),
        }
    }
}

/// Where the responsible code lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceLocator {
    Inline,
    Script(String),
}

impl SourceLocator {
    pub fn from_src(src: Option<&str>) -> Self {
        match src {
            Some(url) => SourceLocator::Script(url.to_string()),
            None => SourceLocator::Inline,
        }
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::Inline => f.write_str("inline"),
            SourceLocator::Script(url) => f.write_str(url),
        }
    }
}

/// Atomic evidence unit for one signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    category: Category,
    signal: String,
    detected: bool,
    suspicious: bool,
    observed: bool,
    evidence: Vec<Evidence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<SourceLocator>,
}

impl Finding {
    pub fn new(
        category: Category,
        signal: &str,
        assessment: Assessment,
        evidence: Vec<Evidence>,
        source: Option<SourceLocator>,
        policy: DetectionPolicy,
    ) -> Self {
        let suspicious = assessment.observed && assessment.suspicious;
        let detected = match policy {
            DetectionPolicy::SuspiciousOnly => suspicious,
            DetectionPolicy::AnyEvidence => assessment.observed,
        };
        Self {
            category,
            signal: signal.to_string(),
            detected,
            suspicious,
            observed: assessment.observed,
            evidence,
            source,
        }
    }

    /// A signal with no evidence.
    pub fn absent(category: Category, signal: &str) -> Self {
        Self::new(
            category,
            signal,
            Assessment::default(),
            Vec::new(),
            None,
            DetectionPolicy::default(),
        )
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn signal(&self) -> &str {
        &self.signal
    }

    pub fn detected(&self) -> bool {
        self.detected
    }

    pub fn suspicious(&self) -> bool {
        self.suspicious
    }

    pub fn observed(&self) -> bool {
        self.observed
    }

    pub fn evidence(&self) -> &[Evidence] {
        &self.evidence
    }

    pub fn source(&self) -> Option<&SourceLocator> {
        self.source.as_ref()
    }
}

/// Output of one detector pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FindingSet {
    category: Category,
    /// Logical pass number of the producing detector.
    pass: u64,
    observed_at: DateTime<Utc>,
    findings: BTreeMap<String, Finding>,
}

impl FindingSet {
    pub fn new(category: Category, pass: u64) -> Self {
        Self {
            category,
            pass,
            observed_at: Utc::now(),
            findings: BTreeMap::new(),
        }
    }

    /// Add a finding. Findings of another category are rejected.
    pub fn insert(&mut self, finding: Finding) -> bool {
        if finding.category != self.category {
            return false;
        }
        self.findings.insert(finding.signal.clone(), finding);
        true
    }

    pub fn with(mut self, finding: Finding) -> Self {
        self.insert(finding);
        self
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn pass(&self) -> u64 {
        self.pass
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    pub fn get(&self, signal: &str) -> Option<&Finding> {
        self.findings.get(signal)
    }

    pub fn findings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.values()
    }

    pub fn signals(&self) -> Vec<&str> {
        self.findings.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn detected_count(&self) -> usize {
        self.findings.values().filter(|f| f.detected).count()
    }

    pub fn any_suspicious(&self) -> bool {
        self.findings.values().any(|f| f.suspicious)
    }

    /// Latest-write-wins per signal: `incoming` overwrites same-named
    /// signals and leaves the others untouched. Returns whether anything
    /// changed.
    pub fn merge(&mut self, incoming: FindingSet) -> bool {
        let mut changed = false;
        for (signal, finding) in incoming.findings {
            if self.findings.get(&signal) != Some(&finding) {
                changed = true;
            }
            self.findings.insert(signal, finding);
        }
        self.pass = self.pass.max(incoming.pass);
        self.observed_at = incoming.observed_at;
        changed
    }
}

/// Evidence accumulated for one signal. Entries are never removed; exact
/// repeats are not appended again and appending stops at the cap.
#[derive(Debug, Clone, Default)]
pub struct EvidenceLog {
    entries: Vec<Evidence>,
    seen: HashSet<Evidence>,
    cap: usize,
}

impl EvidenceLog {
    pub fn with_cap(cap: usize) -> Self {
        Self {
            entries: Vec::new(),
            seen: HashSet::new(),
            cap,
        }
    }

    pub fn push(&mut self, evidence: Evidence) -> bool {
        if self.entries.len() >= self.cap || self.seen.contains(&evidence) {
            return false;
        }
        self.seen.insert(evidence.clone());
        self.entries.push(evidence);
        true
    }

    pub fn entries(&self) -> &[Evidence] {
        &self.entries
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(Evidence::as_text)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Accumulated state for one signal.
#[derive(Debug, Clone, Default)]
pub struct SignalState {
    pub evidence: EvidenceLog,
    pub source: Option<SourceLocator>,
    /// Named facts established so far (for example "global_handler").
    pub marks: BTreeSet<&'static str>,
}

/// Per-detector accumulation store, shared between a detector and the
/// observers it installs.
#[derive(Debug, Clone)]
pub struct Ledger {
    signals: Arc<Mutex<BTreeMap<String, SignalState>>>,
    cap: usize,
}

impl Ledger {
    pub fn new(cap: usize) -> Self {
        Self {
            signals: Arc::new(Mutex::new(BTreeMap::new())),
            cap,
        }
    }

    pub fn record(&self, signal: &str, evidence: Evidence) -> bool {
        let cap = self.cap;
        let mut signals = self.lock();
        signals
            .entry(signal.to_string())
            .or_insert_with(|| SignalState {
                evidence: EvidenceLog::with_cap(cap),
                ..SignalState::default()
            })
            .evidence
            .push(evidence)
    }

    /// Set the source locator if none is recorded yet.
    pub fn locate(&self, signal: &str, source: SourceLocator) {
        let cap = self.cap;
        let mut signals = self.lock();
        let state = signals.entry(signal.to_string()).or_insert_with(|| SignalState {
            evidence: EvidenceLog::with_cap(cap),
            ..SignalState::default()
        });
        if state.source.is_none() {
            state.source = Some(source);
        }
    }

    pub fn mark(&self, signal: &str, mark: &'static str) {
        let cap = self.cap;
        self.lock()
            .entry(signal.to_string())
            .or_insert_with(|| SignalState {
                evidence: EvidenceLog::with_cap(cap),
                ..SignalState::default()
            })
            .marks
            .insert(mark);
    }

    pub fn has_mark(&self, signal: &str, mark: &str) -> bool {
        self.lock()
            .get(signal)
            .map(|s| s.marks.contains(mark))
            .unwrap_or(false)
    }

    /// Copy of the state for `signal`.
    pub fn snapshot(&self, signal: &str) -> SignalState {
        self.lock().get(signal).cloned().unwrap_or_else(|| SignalState {
            evidence: EvidenceLog::with_cap(self.cap),
            ..SignalState::default()
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, SignalState>> {
        match self.signals.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
