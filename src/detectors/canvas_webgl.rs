//! Canvas and WebGL fingerprinting.
//!
//! Interceptors cover `toDataURL`, and the two `getParameter` constants and
//! the one extension that reveal the unmasked GPU. A mutation observer
//! records canvases added to the document. Script text is scanned for
//! fingerprinting library and API names, each tagged with the signal it
//! feeds.

use super::patterns::Vocabulary;
use super::types::{Assessment, Category, Evidence, Finding, FindingSet, Ledger, SourceLocator};
use super::{DetectionContext, Detector, DetectorError};
use crate::platform::{
    CapabilityId, ObserverId, DEBUG_RENDERER_INFO, UNMASKED_RENDERER_WEBGL, UNMASKED_VENDOR_WEBGL,
};
use std::sync::Arc;

pub const CANVAS: &str = "canvas";
pub const WEBGL: &str = "webgl";

const CANVAS_SCRIPT_TERMS: &[&str] = &[
    "toDataURL",
    "getImageData",
    "isPointInPath",
    "FingerprintJS",
    "ClientJS",
];

const WEBGL_SCRIPT_TERMS: &[&str] = &[
    "UNMASKED_RENDERER_WEBGL",
    "UNMASKED_VENDOR_WEBGL",
    "WEBGL_debug_renderer_info",
    "getSupportedExtensions",
    "getShaderPrecisionFormat",
];

const FINGERPRINT_VOCABULARY: &[&str] = &[
    "toDataURL",
    "getImageData",
    "UNMASKED_RENDERER_WEBGL",
    "UNMASKED_VENDOR_WEBGL",
    "WEBGL_debug_renderer_info",
    "fingerprint",
];

fn parameter_name(parameter: u32) -> Option<&'static str> {
    match parameter {
        UNMASKED_VENDOR_WEBGL => Some("UNMASKED_VENDOR_WEBGL"),
        UNMASKED_RENDERER_WEBGL => Some("UNMASKED_RENDERER_WEBGL"),
        _ => None,
    }
}

pub struct CanvasWebglDetector {
    ledger: Ledger,
    canvas_terms: Vocabulary,
    webgl_terms: Vocabulary,
    vocabulary: Vocabulary,
    observer: Option<ObserverId>,
    installed: bool,
    pass: u64,
}

impl CanvasWebglDetector {
    pub fn new(max_evidence_per_signal: usize) -> Result<Self, DetectorError> {
        Ok(Self {
            ledger: Ledger::new(max_evidence_per_signal),
            canvas_terms: Vocabulary::new(CANVAS_SCRIPT_TERMS)?,
            webgl_terms: Vocabulary::new(WEBGL_SCRIPT_TERMS)?,
            vocabulary: Vocabulary::new(FINGERPRINT_VOCABULARY)?,
            observer: None,
            installed: false,
            pass: 0,
        })
    }

    /// Mutation observer registered by this detector, if any.
    pub fn observer(&self) -> Option<ObserverId> {
        self.observer
    }

    fn scan_scripts(&self, ctx: &DetectionContext) {
        let scripts = ctx.page.document().scripts();
        for script in scripts {
            let locator = SourceLocator::from_src(script.src.as_deref());
            for (signal, terms) in [(CANVAS, &self.canvas_terms), (WEBGL, &self.webgl_terms)] {
                let found = terms.matches(&script.text);
                if found.is_empty() {
                    continue;
                }
                for term in found {
                    self.ledger.record(
                        signal,
                        Evidence::text(format!("script references {term}")),
                    );
                }
                self.ledger.locate(signal, locator.clone());
            }
        }
    }
}

impl Detector for CanvasWebglDetector {
    fn category(&self) -> Category {
        Category::CanvasWebgl
    }

    fn install(&mut self, ctx: &DetectionContext) {
        if self.installed {
            return;
        }

        let ledger = self.ledger.clone();
        ctx.intercept(
            Category::CanvasWebgl,
            CapabilityId::CanvasToDataUrl,
            Arc::new(move |inv| {
                ledger.record(
                    CANVAS,
                    Evidence::text(format!("toDataURL called on {}", inv.this.label())),
                );
            }),
        );

        let ledger = self.ledger.clone();
        ctx.intercept(
            Category::CanvasWebgl,
            CapabilityId::WebGlGetParameter,
            Arc::new(move |inv| {
                let name = inv
                    .arg(0)
                    .as_number()
                    .and_then(|n| parameter_name(n as u32));
                if let Some(name) = name {
                    ledger.record(WEBGL, Evidence::text(format!("getParameter({name})")));
                }
            }),
        );

        let ledger = self.ledger.clone();
        ctx.intercept(
            Category::CanvasWebgl,
            CapabilityId::WebGlGetExtension,
            Arc::new(move |inv| {
                if inv.arg(0).as_str() == Some(DEBUG_RENDERER_INFO) {
                    ledger.record(
                        WEBGL,
                        Evidence::text(format!("getExtension({DEBUG_RENDERER_INFO})")),
                    );
                }
            }),
        );

        let ledger = self.ledger.clone();
        let id = ctx.observe_mutations(Arc::new(move |record| {
            for added in record.added.iter().filter(|el| el.tag_name == "CANVAS") {
                ledger.record(CANVAS, Evidence::Element(added.clone()));
            }
        }));
        self.observer = Some(id);

        self.installed = true;
    }

    fn run(&mut self, ctx: &DetectionContext) -> Result<FindingSet, DetectorError> {
        self.install(ctx);
        self.pass += 1;
        self.scan_scripts(ctx);

        let mut set = FindingSet::new(Category::CanvasWebgl, self.pass);
        for signal in [CANVAS, WEBGL] {
            let state = self.ledger.snapshot(signal);
            let assessment = Assessment {
                observed: !state.evidence.is_empty(),
                suspicious: self.vocabulary.any_in(state.evidence.texts()),
            };
            set.insert(Finding::new(
                Category::CanvasWebgl,
                signal,
                assessment,
                state.evidence.entries().to_vec(),
                state.source,
                ctx.policy,
            ));
        }
        tracing::debug!(
            pass = self.pass,
            detected = set.detected_count(),
            "canvas/webgl pass complete"
        );
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::DetectionPolicy;
    use crate::instrument::InstrumentationRegistry;
    use crate::platform::{Element, Page, PageFeatures, SharedPage};

    fn context(page: SharedPage) -> DetectionContext {
        let registry = Arc::new(InstrumentationRegistry::for_page(&page));
        DetectionContext::new(page, registry, DetectionPolicy::SuspiciousOnly)
    }

    #[test]
    fn test_unmasked_renderer_is_detected() {
        let page = Page::builder("https://example.com").build();
        let ctx = context(page.clone());
        let mut detector = CanvasWebglDetector::new(50).unwrap();
        detector.install(&ctx);

        page.webgl_get_extension(DEBUG_RENDERER_INFO).unwrap();
        let renderer = page.webgl_get_parameter(UNMASKED_RENDERER_WEBGL).unwrap();
        // The page still sees the real value.
        assert!(renderer.as_str().unwrap().contains("ANGLE"));

        let set = detector.run(&ctx).unwrap();
        let webgl = set.get(WEBGL).unwrap();
        assert!(webgl.detected());
        assert!(webgl
            .evidence()
            .contains(&Evidence::text("getParameter(UNMASKED_RENDERER_WEBGL)")));
    }

    #[test]
    fn test_ordinary_parameters_are_ignored() {
        let page = Page::builder("https://example.com").build();
        let ctx = context(page.clone());
        let mut detector = CanvasWebglDetector::new(50).unwrap();
        detector.install(&ctx);

        page.webgl_get_parameter(0x0D33).unwrap();
        page.webgl_get_extension("OES_texture_float").unwrap();
        let set = detector.run(&ctx).unwrap();
        assert!(!set.get(WEBGL).unwrap().observed());
    }

    #[test]
    fn test_added_canvas_is_evidence_but_not_suspicious() {
        let page = Page::builder("https://example.com").build();
        let ctx = context(page.clone());
        let mut detector = CanvasWebglDetector::new(50).unwrap();
        detector.install(&ctx);

        let canvas = Element::new("canvas").with_id("fp");
        page.append_element(canvas.clone());
        page.append_element(Element::new("div"));

        let set = detector.run(&ctx).unwrap();
        let finding = set.get(CANVAS).unwrap();
        assert_eq!(finding.evidence(), &[Evidence::Element(canvas.to_ref())]);
        assert!(!finding.detected());

        page.canvas_to_data_url(&canvas.to_ref()).unwrap();
        let set = detector.run(&ctx).unwrap();
        assert!(set.get(CANVAS).unwrap().detected());
    }

    #[test]
    fn test_observer_registered_once() {
        let page = Page::builder("https://example.com").build();
        let ctx = context(page.clone());
        let mut detector = CanvasWebglDetector::new(50).unwrap();
        for _ in 0..3 {
            detector.run(&ctx).unwrap();
        }
        assert_eq!(page.document().observer_count(), 1);
        assert!(detector.observer().is_some());
    }

    #[test]
    fn test_release_disconnects_canvas_observer() {
        let page = Page::builder("https://example.com").build();
        let ctx = context(page.clone());
        let mut detector = CanvasWebglDetector::new(50).unwrap();
        detector.install(&ctx);
        assert_eq!(ctx.mutation_observers(), vec![detector.observer().unwrap()]);

        ctx.release();
        assert_eq!(page.document().observer_count(), 0);
        page.append_element(Element::new("canvas"));
        let set = detector.run(&ctx).unwrap();
        assert!(!set.get(CANVAS).unwrap().observed());
    }

    #[test]
    fn test_script_terms_are_tagged_per_signal() {
        let page = Page::builder("https://example.com")
            .element(Element::external_script(
                "https://cdn.example/fp.min.js",
                "FingerprintJS.load(); gl.getExtension('WEBGL_debug_renderer_info')",
            ))
            .build();
        let mut detector = CanvasWebglDetector::new(50).unwrap();
        let set = detector.run(&context(page)).unwrap();

        let canvas = set.get(CANVAS).unwrap();
        let webgl = set.get(WEBGL).unwrap();
        assert!(canvas.suspicious());
        assert!(webgl.suspicious());
        assert_eq!(canvas.evidence().len(), 1);
        assert_eq!(
            webgl.source(),
            Some(&SourceLocator::Script("https://cdn.example/fp.min.js".into()))
        );
    }

    #[test]
    fn test_script_url_does_not_make_signal_suspicious() {
        let page = Page::builder("https://example.com")
            .element(Element::external_script(
                "https://cdn.example/fingerprint.js",
                "if (ctx.isPointInPath(10, 10)) { select(); }",
            ))
            .build();
        let mut detector = CanvasWebglDetector::new(50).unwrap();
        let set = detector.run(&context(page)).unwrap();

        let canvas = set.get(CANVAS).unwrap();
        assert!(canvas.observed());
        assert!(!canvas.suspicious());
        assert_eq!(canvas.evidence(), &[Evidence::text("script references isPointInPath")]);
    }

    #[test]
    fn test_missing_webgl_degrades() {
        let page = Page::builder("https://example.com")
            .features(PageFeatures {
                webgl: false,
                canvas: false,
                ..PageFeatures::default()
            })
            .build();
        let mut detector = CanvasWebglDetector::new(50).unwrap();
        let set = detector.run(&context(page)).unwrap();
        assert_eq!(set.detected_count(), 0);
    }
}
