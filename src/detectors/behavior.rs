//! Behavioral input tracking: pointer movement, scroll and click handlers.
//!
//! A signal is observed when any of these hold for its event type:
//! a global `on<event>` handler on window/document, a listener registered
//! through the intercepted `addEventListener`, an inline `on<event>`
//! attribute, or page script text naming the event. It is suspicious when
//! a global handler is present, or for `mousemove` when a script naming the
//! event also reads pointer coordinates or ships data out.

use super::patterns::Vocabulary;
use super::types::{Assessment, Category, Evidence, Finding, FindingSet, Ledger, SourceLocator};
use super::{DetectionContext, Detector, DetectorError};
use crate::platform::{CapabilityId, HandlerTarget, Receiver};
use std::sync::Arc;

pub const MOUSEMOVE: &str = "mousemove";
pub const SCROLL: &str = "scroll";
pub const CLICK: &str = "click";

const EVENT_TYPES: [&str; 3] = [MOUSEMOVE, SCROLL, CLICK];

const POINTER_TRACKING_KEYWORDS: &[&str] = &[
    "clientX",
    "clientY",
    "pageX",
    "pageY",
    "screenX",
    "screenY",
    "movementX",
    "movementY",
    "sendBeacon",
    "XMLHttpRequest",
    "WebSocket",
];

/// Distinct keywords a script must contain besides the event name.
const POINTER_KEYWORD_THRESHOLD: usize = 2;

const GLOBAL_HANDLER: &str = "global_handler";
const LISTENER: &str = "listener";
const POINTER_TRACKING: &str = "pointer_tracking";

pub struct BehaviorDetector {
    ledger: Ledger,
    pointer_keywords: Vocabulary,
    installed: bool,
    pass: u64,
}

impl BehaviorDetector {
    pub fn new(max_evidence_per_signal: usize) -> Result<Self, DetectorError> {
        Ok(Self {
            ledger: Ledger::new(max_evidence_per_signal),
            pointer_keywords: Vocabulary::new(POINTER_TRACKING_KEYWORDS)?,
            installed: false,
            pass: 0,
        })
    }

    fn inspect_document(&self, ctx: &DetectionContext) {
        let doc = ctx.page.document();
        let scripts = doc.scripts();

        for event_type in EVENT_TYPES {
            for target in doc.global_handlers_for(event_type) {
                self.ledger.mark(event_type, GLOBAL_HANDLER);
                self.ledger.record(
                    event_type,
                    Evidence::text(format!("global on{event_type} handler on {target}")),
                );
                self.ledger.locate(event_type, SourceLocator::Inline);
            }

            let attribute = format!("on{event_type}");
            for element in doc.elements() {
                if element.attribute(&attribute).is_some() {
                    self.ledger.record(event_type, Evidence::Element(element.to_ref()));
                    self.ledger.locate(event_type, SourceLocator::Inline);
                }
            }

            for script in &scripts {
                if !script.text.contains(event_type) {
                    continue;
                }
                let locator = SourceLocator::from_src(script.src.as_deref());
                self.ledger.record(
                    event_type,
                    Evidence::text(format!("script references {event_type} ({locator})")),
                );
                self.ledger.locate(event_type, locator.clone());

                if event_type == MOUSEMOVE {
                    let keywords = self.pointer_keywords.matches(&script.text);
                    if keywords.len() >= POINTER_KEYWORD_THRESHOLD {
                        self.ledger.mark(event_type, POINTER_TRACKING);
                        let list: Vec<&str> = keywords.into_iter().collect();
                        self.ledger.record(
                            event_type,
                            Evidence::text(format!(
                                "script ({locator}) combines mousemove with {}",
                                list.join(", ")
                            )),
                        );
                    }
                }
            }
        }
    }

    fn finding(&self, ctx: &DetectionContext, event_type: &str) -> Finding {
        let state = self.ledger.snapshot(event_type);
        let observed = !state.evidence.is_empty() || !state.marks.is_empty();
        let suspicious = state.marks.contains(GLOBAL_HANDLER)
            || (event_type == MOUSEMOVE && state.marks.contains(POINTER_TRACKING));
        Finding::new(
            Category::Behavior,
            event_type,
            Assessment {
                observed,
                suspicious,
            },
            state.evidence.entries().to_vec(),
            state.source,
            ctx.policy,
        )
    }
}

impl Detector for BehaviorDetector {
    fn category(&self) -> Category {
        Category::Behavior
    }

    fn install(&mut self, ctx: &DetectionContext) {
        if self.installed {
            return;
        }
        let ledger = self.ledger.clone();
        ctx.intercept(
            Category::Behavior,
            CapabilityId::AddEventListener,
            Arc::new(move |inv| {
                let Some(event_type) = inv.arg(0).as_str() else {
                    return;
                };
                let Some(event_type) = EVENT_TYPES.iter().copied().find(|t| *t == event_type) else {
                    return;
                };
                ledger.mark(event_type, LISTENER);
                let evidence = match inv.this {
                    Receiver::Element(ref el) => Evidence::Element(el.clone()),
                    ref other => Evidence::text(format!(
                        "{event_type} listener registered on {}",
                        other.label()
                    )),
                };
                ledger.record(event_type, evidence);
            }),
        );
        self.installed = true;
    }

    fn run(&mut self, ctx: &DetectionContext) -> Result<FindingSet, DetectorError> {
        self.install(ctx);
        self.pass += 1;
        self.inspect_document(ctx);

        let mut set = FindingSet::new(Category::Behavior, self.pass);
        for event_type in EVENT_TYPES {
            set.insert(self.finding(ctx, event_type));
        }
        tracing::debug!(
            pass = self.pass,
            detected = set.detected_count(),
            "behavior pass complete"
        );
        Ok(set)
    }
}
