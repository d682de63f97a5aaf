//! Category detectors.
//!
//! Each detector composes capability interceptors with static inspection of
//! the page (global handlers, inline attributes, script text) and turns the
//! accumulated observations into one [`FindingSet`] per pass.

pub mod audio_font;
pub mod behavior;
pub mod canvas_webgl;
pub mod patterns;
pub mod system_browser;
pub mod types;

use crate::config::CategoryConfig;
use crate::instrument::{InstrumentError, Observer, SharedRegistry};
use crate::platform::dom::MutationCallback;
use crate::platform::{CapabilityId, ObserverId, SharedPage};
use std::sync::{Arc, Mutex};
use thiserror::Error;

// Re-export commonly used types
pub use audio_font::AudioFontDetector;
pub use behavior::BehaviorDetector;
pub use canvas_webgl::CanvasWebglDetector;
pub use system_browser::SystemBrowserDetector;
pub use types::{
    Assessment, Category, DetectionPolicy, Evidence, EvidenceLog, Finding, FindingSet, Ledger,
    SourceLocator,
};

/// A detector pass that could not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectorError {
    #[error("pattern compilation failed: {0}")]
    Pattern(String),
    #[error("detector panicked: {0}")]
    Panicked(String),
}

impl From<regex::Error> for DetectorError {
    fn from(e: regex::Error) -> Self {
        DetectorError::Pattern(e.to_string())
    }
}

impl From<aho_corasick::BuildError> for DetectorError {
    fn from(e: aho_corasick::BuildError) -> Self {
        DetectorError::Pattern(e.to_string())
    }
}

/// What a detector works against: the page, the session's interceptor
/// registry and the reporting policy.
///
/// Clones share the record of what the session attached to the page, so
/// [`release`](Self::release) on any clone undoes it for all of them.
#[derive(Debug, Clone)]
pub struct DetectionContext {
    pub page: SharedPage,
    pub registry: SharedRegistry,
    pub policy: DetectionPolicy,
    observers: Arc<Mutex<Vec<ObserverId>>>,
}

impl DetectionContext {
    pub fn new(page: SharedPage, registry: SharedRegistry, policy: DetectionPolicy) -> Self {
        Self {
            page,
            registry,
            policy,
            observers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a document mutation observer owned by this session.
    pub fn observe_mutations(&self, callback: MutationCallback) -> ObserverId {
        let id = self.page.observe_mutations(callback);
        self.lock_observers().push(id);
        id
    }

    /// Mutation observers this session still has on the page.
    pub fn mutation_observers(&self) -> Vec<ObserverId> {
        self.lock_observers().clone()
    }

    /// Disconnect this session's mutation observers and detach its
    /// capability observers. Interceptors stay installed for later
    /// sessions on the same page.
    pub fn release(&self) {
        let observers: Vec<ObserverId> = self.lock_observers().drain(..).collect();
        for id in &observers {
            self.page.disconnect_observer(*id);
        }
        let detached = self.registry.detach();
        tracing::debug!(
            session = %self.registry.session(),
            mutation_observers = observers.len(),
            interceptors = detached,
            "detection context released"
        );
    }

    fn lock_observers(&self) -> std::sync::MutexGuard<'_, Vec<ObserverId>> {
        match self.observers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Install `observer` on capability `id` for `category`. Returns
    /// whether the capability is being observed.
    pub fn intercept(&self, category: Category, id: CapabilityId, observer: Observer) -> bool {
        match self
            .registry
            .install(self.page.capabilities(), id, category.name(), observer)
        {
            Ok(_) => true,
            Err(InstrumentError::CapabilityUnavailable(_)) => false,
            Err(e @ InstrumentError::InstrumentationConflict { .. }) => {
                tracing::debug!(category = %category, error = %e, "interception skipped");
                false
            }
        }
    }
}

/// One category of tracking detection.
pub trait Detector: Send {
    fn category(&self) -> Category;

    /// Install interceptors. Called by `run` on first use; safe to call
    /// again.
    fn install(&mut self, ctx: &DetectionContext);

    /// Inspect accumulated observations and produce this pass's findings.
    fn run(&mut self, ctx: &DetectionContext) -> Result<FindingSet, DetectorError>;
}

/// Build the detectors enabled in `categories`.
pub fn build_detectors(
    categories: &CategoryConfig,
    max_evidence_per_signal: usize,
) -> Result<Vec<Box<dyn Detector>>, DetectorError> {
    let mut detectors: Vec<Box<dyn Detector>> = Vec::new();
    if categories.behavior {
        detectors.push(Box::new(BehaviorDetector::new(max_evidence_per_signal)?));
    }
    if categories.system_browser {
        detectors.push(Box::new(SystemBrowserDetector::new(max_evidence_per_signal)?));
    }
    if categories.audio_font {
        detectors.push(Box::new(AudioFontDetector::new(max_evidence_per_signal)?));
    }
    if categories.canvas_webgl {
        detectors.push(Box::new(CanvasWebglDetector::new(max_evidence_per_signal)?));
    }
    Ok(detectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_detectors_respects_flags() {
        let categories = CategoryConfig {
            behavior: true,
            system_browser: false,
            audio_font: true,
            canvas_webgl: false,
        };
        let detectors = build_detectors(&categories, 50).unwrap();
        let found: Vec<Category> = detectors.iter().map(|d| d.category()).collect();
        assert_eq!(found, vec![Category::Behavior, Category::AudioFont]);
    }
}
