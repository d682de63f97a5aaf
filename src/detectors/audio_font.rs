//! Audio and font fingerprinting.

use super::patterns::Vocabulary;
use super::types::{Assessment, Category, Evidence, Finding, FindingSet, Ledger, SourceLocator};
use super::{DetectionContext, Detector, DetectorError};
use crate::platform::{CapabilityId, Document};
use std::sync::{Arc, Mutex};

pub const AUDIO: &str = "audio";
pub const FONTS: &str = "fonts";

const AUDIO_APIS: &[&str] = &[
    "AudioContext",
    "OfflineAudioContext",
    "createAnalyser",
    "createOscillator",
    "createDynamicsCompressor",
    "getFloatFrequencyData",
    "AudioWorkletNode",
    "startRendering",
];

const TEXT_MEASUREMENT_APIS: &[&str] = &[
    "measureText",
    "getComputedStyle",
    "offsetWidth",
    "offsetHeight",
    "fontFamily",
    "font-family",
];

/// Distinct API names a script needs before it counts as evidence.
const SCRIPT_API_THRESHOLD: usize = 2;

const FINGERPRINT_VOCABULARY: &[&str] = &[
    "createAnalyser",
    "OfflineAudioContext",
    "createOscillator",
    "createDynamicsCompressor",
    "getFloatFrequencyData",
    "AudioWorkletNode",
    "measureText",
    "inline font-family",
    "fingerprint",
];

pub struct AudioFontDetector {
    ledger: Ledger,
    audio_apis: Vocabulary,
    text_apis: Vocabulary,
    vocabulary: Vocabulary,
    installed: bool,
    pass: u64,
}

impl AudioFontDetector {
    pub fn new(max_evidence_per_signal: usize) -> Result<Self, DetectorError> {
        Ok(Self {
            ledger: Ledger::new(max_evidence_per_signal),
            audio_apis: Vocabulary::new(AUDIO_APIS)?,
            text_apis: Vocabulary::new(TEXT_MEASUREMENT_APIS)?,
            vocabulary: Vocabulary::new(FINGERPRINT_VOCABULARY)?,
            installed: false,
            pass: 0,
        })
    }

    fn scan_scripts(&self, ctx: &DetectionContext) {
        let scripts = ctx.page.document().scripts();
        for script in scripts {
            let locator = SourceLocator::from_src(script.src.as_deref());
            for (signal, apis, what) in [
                (AUDIO, &self.audio_apis, "audio APIs"),
                (FONTS, &self.text_apis, "text measurement"),
            ] {
                let found = apis.matches(&script.text);
                if found.len() < SCRIPT_API_THRESHOLD {
                    continue;
                }
                let names: Vec<&str> = found.into_iter().collect();
                self.ledger.record(
                    signal,
                    Evidence::text(format!("script uses {what}: {}", names.join(", "))),
                );
                self.ledger.locate(signal, locator.clone());
            }
        }
    }
}

fn has_inline_font(document: &Mutex<Document>, target: &crate::platform::ElementRef) -> bool {
    let doc = match document.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    doc.elements()
        .iter()
        .any(|el| {
            el.to_ref() == *target && el.font_family.as_deref().is_some_and(|f| !f.is_empty())
        })
}

impl Detector for AudioFontDetector {
    fn category(&self) -> Category {
        Category::AudioFont
    }

    fn install(&mut self, ctx: &DetectionContext) {
        if self.installed {
            return;
        }

        let ledger = self.ledger.clone();
        ctx.intercept(
            Category::AudioFont,
            CapabilityId::AudioContextConstructor,
            Arc::new(move |_| {
                ledger.record(AUDIO, Evidence::text("AudioContext constructed"));
            }),
        );

        let ledger = self.ledger.clone();
        ctx.intercept(
            Category::AudioFont,
            CapabilityId::CreateAnalyser,
            Arc::new(move |_| {
                ledger.record(AUDIO, Evidence::text("AudioContext.createAnalyser called"));
            }),
        );

        let ledger = self.ledger.clone();
        ctx.intercept(
            Category::AudioFont,
            CapabilityId::MeasureText,
            Arc::new(move |_| {
                ledger.record(FONTS, Evidence::text("canvas measureText called"));
            }),
        );

        let ledger = self.ledger.clone();
        let document = ctx.page.document_handle();
        ctx.intercept(
            Category::AudioFont,
            CapabilityId::GetComputedStyle,
            Arc::new(move |inv| {
                let Some(target) = inv.arg(0).as_element() else {
                    return;
                };
                if has_inline_font(&document, target) {
                    ledger.record(
                        FONTS,
                        Evidence::text(format!(
                            "getComputedStyle on {target} with inline font-family"
                        )),
                    );
                }
            }),
        );

        self.installed = true;
    }

    fn run(&mut self, ctx: &DetectionContext) -> Result<FindingSet, DetectorError> {
        self.install(ctx);
        self.pass += 1;
        self.scan_scripts(ctx);

        let mut set = FindingSet::new(Category::AudioFont, self.pass);
        for signal in [AUDIO, FONTS] {
            let state = self.ledger.snapshot(signal);
            let assessment = Assessment {
                observed: !state.evidence.is_empty(),
                suspicious: self.vocabulary.any_in(state.evidence.texts()),
            };
            set.insert(Finding::new(
                Category::AudioFont,
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
            "audio/font pass complete"
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
    fn test_context_alone_is_not_suspicious() {
        let page = Page::builder("https://example.com").build();
        let ctx = context(page.clone());
        let mut detector = AudioFontDetector::new(50).unwrap();
        detector.install(&ctx);

        page.new_audio_context().unwrap();
        let set = detector.run(&ctx).unwrap();
        let audio = set.get(AUDIO).unwrap();
        assert!(audio.observed());
        assert!(!audio.detected());
    }

    #[test]
    fn test_analyser_is_suspicious() {
        let page = Page::builder("https://example.com").build();
        let ctx = context(page.clone());
        let mut detector = AudioFontDetector::new(50).unwrap();
        detector.install(&ctx);

        page.new_audio_context().unwrap();
        let analyser = page.create_analyser().unwrap();
        assert_eq!(analyser.as_str(), None);

        let set = detector.run(&ctx).unwrap();
        let audio = set.get(AUDIO).unwrap();
        assert!(audio.suspicious());
        assert_eq!(audio.evidence().len(), 2);
    }

    #[test]
    fn test_computed_style_requires_inline_font() {
        let plain = Element::new("span").with_id("plain");
        let styled = Element::new("span").with_id("sample").with_font_family("Arial");
        let page = Page::builder("https://example.com")
            .element(plain.clone())
            .element(styled.clone())
            .build();
        let ctx = context(page.clone());
        let mut detector = AudioFontDetector::new(50).unwrap();
        detector.install(&ctx);

        page.get_computed_style(&plain.to_ref()).unwrap();
        assert!(!detector.run(&ctx).unwrap().get(FONTS).unwrap().observed());

        page.get_computed_style(&styled.to_ref()).unwrap();
        let set = detector.run(&ctx).unwrap();
        let fonts = set.get(FONTS).unwrap();
        assert!(fonts.detected());
        assert!(fonts.evidence()[0].to_string().contains("span#sample"));
    }

    #[test]
    fn test_script_needs_two_distinct_names() {
        let page = Page::builder("https://example.com")
            .element(Element::script("const ctx = new AudioContext();"))
            .element(Element::external_script(
                "https://fp.example/audio.js",
                "const c = new OfflineAudioContext(1, 44100, 44100); c.createOscillator();",
            ))
            .build();
        let mut detector = AudioFontDetector::new(50).unwrap();
        let set = detector.run(&context(page)).unwrap();

        let audio = set.get(AUDIO).unwrap();
        assert_eq!(audio.evidence().len(), 1);
        assert!(audio.suspicious());
        assert_eq!(
            audio.source(),
            Some(&SourceLocator::Script("https://fp.example/audio.js".into()))
        );
    }

    #[test]
    fn test_script_url_does_not_make_signal_suspicious() {
        let page = Page::builder("https://example.com")
            .element(Element::external_script(
                "https://cdn.example/fingerprint/player.js",
                "const a = new AudioContext(); a.startRendering();",
            ))
            .build();
        let mut detector = AudioFontDetector::new(50).unwrap();
        let set = detector.run(&context(page)).unwrap();

        let audio = set.get(AUDIO).unwrap();
        assert!(audio.observed());
        assert!(!audio.suspicious());
        assert_eq!(
            audio.source(),
            Some(&SourceLocator::Script("https://cdn.example/fingerprint/player.js".into()))
        );
    }

    #[test]
    fn test_missing_audio_feature_degrades() {
        let page = Page::builder("https://example.com")
            .features(PageFeatures {
                audio: false,
                ..PageFeatures::default()
            })
            .build();
        let ctx = context(page.clone());
        let mut detector = AudioFontDetector::new(50).unwrap();
        let set = detector.run(&ctx).unwrap();
        assert!(!set.get(AUDIO).unwrap().observed());
        assert!(page.new_audio_context().is_err());
        assert!(!ctx.registry.is_installed(CapabilityId::AudioContextConstructor));
        assert!(ctx.registry.is_installed(CapabilityId::MeasureText));
    }
}
