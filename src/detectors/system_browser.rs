//! System and browser details: user agent, plugins, screen geometry,
//! outgoing requests and cookies.

use super::patterns::PatternList;
use super::types::{Assessment, Category, Evidence, Finding, FindingSet, Ledger, SourceLocator};
use super::{DetectionContext, Detector, DetectorError};
use crate::platform::CapabilityId;
use std::sync::Arc;

pub const USER_AGENT: &str = "userAgent";
pub const PLUGINS: &str = "plugins";
pub const SCREEN: &str = "screen";
pub const NETWORK_REQUESTS: &str = "networkRequests";
pub const COOKIES: &str = "cookies";

const SIGNALS: [&str; 5] = [USER_AGENT, PLUGINS, SCREEN, NETWORK_REQUESTS, COOKIES];

const AUTOMATION_AGENTS: &[&str] = &["bot", "curl", "wget", "headless", "phantom"];

const LEGACY_PLUGINS: &[&str] = &["flash", "java", "silverlight", "shockwave"];

const TRACKER_DOMAINS: &[&str] = &[
    r"google-analytics\.com",
    r"googletagmanager\.com",
    r"doubleclick\.net",
    r"connect\.facebook\.net",
    r"facebook\.com/tr",
    r"hotjar\.com",
    r"mixpanel\.com",
    r"segment\.(?:io|com)",
    r"amplitude\.com",
    r"scorecardresearch\.com",
    r"adnxs\.com",
    r"criteo\.(?:com|net)",
    r"taboola\.com",
    r"outbrain\.com",
    r"quantserve\.com",
    r"bat\.bing\.com",
    r"clarity\.ms",
];

const TRACKING_COOKIES: &[&str] = &[
    "_ga(?:_.*)?",
    "_gid",
    "_gat(?:_.*)?",
    "_fbp",
    "_fbc",
    "fr",
    "IDE",
    "_hj.*",
    "mp_.*",
    "ajs_.*",
    "__utm.*",
    "_uetsid",
    "_uetvid",
    "_gcl_.*",
    "NID",
    "__qca",
    "_pin_unauth",
    "_clck",
    "_clsk",
];

const MIN_SCREEN_WIDTH: u32 = 800;
const MIN_SCREEN_HEIGHT: u32 = 600;
const COMMON_COLOR_DEPTH: u32 = 24;

const COOKIE_READ: &str = "document.cookie read";

/// Detector for the system/browser category.
pub struct SystemBrowserDetector {
    ledger: Ledger,
    agents: PatternList,
    plugins: PatternList,
    trackers: PatternList,
    cookies: PatternList,
    installed: bool,
    pass: u64,
}

impl SystemBrowserDetector {
    pub fn new(max_evidence_per_signal: usize) -> Result<Self, DetectorError> {
        Ok(Self {
            ledger: Ledger::new(max_evidence_per_signal),
            agents: PatternList::substring(AUTOMATION_AGENTS)?,
            plugins: PatternList::substring(LEGACY_PLUGINS)?,
            trackers: PatternList::substring(TRACKER_DOMAINS)?,
            cookies: PatternList::build("^", TRACKING_COOKIES, "$")?,
            installed: false,
            pass: 0,
        })
    }

    fn inspect_page(&self, ctx: &DetectionContext) {
        let page = &ctx.page;

        let user_agent = &page.navigator().user_agent;
        if !user_agent.is_empty() {
            self.ledger.record(USER_AGENT, Evidence::text(user_agent.as_str()));
        }

        for name in page.navigator().plugin_names() {
            self.ledger.record(PLUGINS, Evidence::text(name));
        }

        if let Some(screen) = page.screen() {
            self.ledger.record(
                SCREEN,
                Evidence::text(format!(
                    "{}x{}, {}-bit color",
                    screen.width, screen.height, screen.color_depth
                )),
            );
        }

        for name in page.cookie_names() {
            if !name.is_empty() {
                self.ledger.record(COOKIES, Evidence::text(name));
            }
        }

        // Tracker scripts loaded by the page count as requests too.
        let scripts = page.document().scripts();
        for script in scripts {
            if let Some(src) = script.src {
                if self.trackers.is_match(&src) {
                    self.ledger.record(NETWORK_REQUESTS, Evidence::text(src.as_str()));
                    self.ledger.locate(NETWORK_REQUESTS, SourceLocator::Script(src));
                }
            }
        }
    }

    fn assess(&self, ctx: &DetectionContext, signal: &str) -> Assessment {
        let state = self.ledger.snapshot(signal);
        let observed = !state.evidence.is_empty();
        let suspicious = match signal {
            USER_AGENT => state.evidence.texts().any(|t| self.agents.is_match(t)),
            PLUGINS => state.evidence.texts().any(|t| self.plugins.is_match(t)),
            SCREEN => ctx.page.screen().is_some_and(|s| {
                s.width < MIN_SCREEN_WIDTH
                    || s.height < MIN_SCREEN_HEIGHT
                    || s.color_depth != COMMON_COLOR_DEPTH
            }),
            NETWORK_REQUESTS => state.evidence.texts().any(|t| self.trackers.is_match(t)),
            COOKIES => state.evidence.texts().any(|t| self.cookies.is_match(t)),
            _ => false,
        };
        Assessment {
            observed,
            suspicious,
        }
    }
}

/// Cookie name from a `name=value; attrs` assignment.
fn cookie_name(raw: &str) -> Option<&str> {
    let pair = raw.split(';').next()?.trim();
    let name = pair.split_once('=').map(|(n, _)| n.trim())?;
    (!name.is_empty()).then_some(name)
}

impl Detector for SystemBrowserDetector {
    fn category(&self) -> Category {
        Category::SystemBrowser
    }

    fn install(&mut self, ctx: &DetectionContext) {
        if self.installed {
            return;
        }

        let ledger = self.ledger.clone();
        ctx.intercept(
            Category::SystemBrowser,
            CapabilityId::Fetch,
            Arc::new(move |inv| {
                if let Some(url) = inv.arg(0).as_str() {
                    ledger.record(NETWORK_REQUESTS, Evidence::text(url));
                }
            }),
        );

        let ledger = self.ledger.clone();
        ctx.intercept(
            Category::SystemBrowser,
            CapabilityId::CookieGet,
            Arc::new(move |_| {
                ledger.record(COOKIES, Evidence::text(COOKIE_READ));
            }),
        );

        let ledger = self.ledger.clone();
        ctx.intercept(
            Category::SystemBrowser,
            CapabilityId::CookieSet,
            Arc::new(move |inv| {
                if let Some(name) = inv.arg(0).as_str().and_then(cookie_name) {
                    ledger.record(COOKIES, Evidence::text(name));
                }
            }),
        );

        self.installed = true;
    }

    fn run(&mut self, ctx: &DetectionContext) -> Result<FindingSet, DetectorError> {
        self.install(ctx);
        self.pass += 1;
        self.inspect_page(ctx);

        let mut set = FindingSet::new(Category::SystemBrowser, self.pass);
        for signal in SIGNALS {
            let state = self.ledger.snapshot(signal);
            set.insert(Finding::new(
                Category::SystemBrowser,
                signal,
                self.assess(ctx, signal),
                state.evidence.entries().to_vec(),
                state.source,
                ctx.policy,
            ));
        }
        tracing::debug!(
            pass = self.pass,
            detected = set.detected_count(),
            "system/browser pass complete"
        );
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::DetectionPolicy;
    use crate::instrument::InstrumentationRegistry;
    use crate::platform::{MimeType, Navigator, Page, PageFeatures, Screen, SharedPage};

    fn context(page: SharedPage) -> DetectionContext {
        let registry = Arc::new(InstrumentationRegistry::for_page(&page));
        DetectionContext::new(page, registry, DetectionPolicy::SuspiciousOnly)
    }

    #[test]
    fn test_ordinary_browser_is_not_reported() {
        let page = Page::builder("https://example.com").cookie("theme=dark").build();
        let mut detector = SystemBrowserDetector::new(50).unwrap();
        let set = detector.run(&context(page)).unwrap();

        assert_eq!(set.len(), 5);
        assert_eq!(set.detected_count(), 0);
        assert!(set.get(USER_AGENT).unwrap().observed());
        assert!(set.get(COOKIES).unwrap().observed());
    }

    #[test]
    fn test_headless_agent_is_suspicious() {
        let page = Page::builder("https://example.com")
            .user_agent("Mozilla/5.0 HeadlessChrome/120.0")
            .build();
        let mut detector = SystemBrowserDetector::new(50).unwrap();
        let set = detector.run(&context(page)).unwrap();
        assert!(set.get(USER_AGENT).unwrap().suspicious());
    }

    #[test]
    fn test_legacy_plugin_is_suspicious() {
        let page = Page::builder("https://example.com")
            .navigator(Navigator {
                mime_types: vec![MimeType {
                    mime_type: "application/x-shockwave-flash".into(),
                    enabled_plugin: Some("Shockwave Flash".into()),
                }],
                ..Navigator::default()
            })
            .build();
        let mut detector = SystemBrowserDetector::new(50).unwrap();
        let set = detector.run(&context(page)).unwrap();
        let plugins = set.get(PLUGINS).unwrap();
        assert!(plugins.detected());
        assert_eq!(plugins.evidence(), &[Evidence::text("Shockwave Flash")]);
    }

    #[test]
    fn test_screen_thresholds() {
        let small = Page::builder("https://example.com")
            .screen(Some(Screen {
                width: 640,
                height: 480,
                color_depth: 24,
            }))
            .build();
        let mut detector = SystemBrowserDetector::new(50).unwrap();
        assert!(detector.run(&context(small)).unwrap().get(SCREEN).unwrap().suspicious());

        let none = Page::builder("https://example.com").screen(None).build();
        let mut detector = SystemBrowserDetector::new(50).unwrap();
        let set = detector.run(&context(none)).unwrap();
        assert!(!set.get(SCREEN).unwrap().observed());
    }

    #[test]
    fn test_fetch_to_tracker_domain() {
        let page = Page::builder("https://example.com").build();
        let ctx = context(page.clone());
        let mut detector = SystemBrowserDetector::new(50).unwrap();
        detector.install(&ctx);

        page.fetch("https://example.com/api/cart").unwrap();
        let set = detector.run(&ctx).unwrap();
        assert!(set.get(NETWORK_REQUESTS).unwrap().observed());
        assert!(!set.get(NETWORK_REQUESTS).unwrap().detected());

        page.fetch("https://www.google-analytics.com/collect?v=2").unwrap();
        let set = detector.run(&ctx).unwrap();
        let requests = set.get(NETWORK_REQUESTS).unwrap();
        assert!(requests.detected());
        assert_eq!(requests.evidence().len(), 2);
        // The page still got its request through.
        assert_eq!(page.network_log().len(), 2);
    }

    #[test]
    fn test_missing_fetch_degrades() {
        let page = Page::builder("https://example.com")
            .features(PageFeatures {
                fetch: false,
                ..PageFeatures::default()
            })
            .build();
        let mut detector = SystemBrowserDetector::new(50).unwrap();
        let set = detector.run(&context(page)).unwrap();
        assert!(!set.get(NETWORK_REQUESTS).unwrap().observed());
    }

    #[test]
    fn test_cookie_setter_records_names_only() {
        let page = Page::builder("https://example.com").build();
        let ctx = context(page.clone());
        let mut detector = SystemBrowserDetector::new(50).unwrap();
        detector.install(&ctx);

        page.write_cookie("_ga=GA1.2.1234567890.1700000000; path=/").unwrap();
        let set = detector.run(&ctx).unwrap();
        let cookies = set.get(COOKIES).unwrap();
        assert!(cookies.suspicious());
        assert!(cookies.evidence().iter().all(|e| !e.to_string().contains("GA1.2")));
    }

    #[test]
    fn test_cookie_read_alone_is_not_suspicious() {
        let page = Page::builder("https://example.com").build();
        let ctx = context(page.clone());
        let mut detector = SystemBrowserDetector::new(50).unwrap();
        detector.install(&ctx);

        page.read_cookie().unwrap();
        let set = detector.run(&ctx).unwrap();
        assert_eq!(set.get(COOKIES).unwrap().evidence(), &[Evidence::text(COOKIE_READ)]);
        assert!(!set.get(COOKIES).unwrap().suspicious());
    }

    #[test]
    fn test_cookie_name_parsing() {
        assert_eq!(cookie_name("_fbp=fb.1.2; Secure"), Some("_fbp"));
        assert_eq!(cookie_name("novalue"), None);
        assert_eq!(cookie_name("=x"), None);
    }

    #[test]
    fn test_tracker_script_source() {
        let page = Page::builder("https://example.com")
            .element(crate::platform::Element::external_script(
                "https://www.googletagmanager.com/gtag/js?id=G-1",
                "",
            ))
            .build();
        let mut detector = SystemBrowserDetector::new(50).unwrap();
        let set = detector.run(&context(page)).unwrap();
        let requests = set.get(NETWORK_REQUESTS).unwrap();
        assert!(requests.detected());
        assert_eq!(
            requests.source(),
            Some(&SourceLocator::Script("https://www.googletagmanager.com/gtag/js?id=G-1".into()))
        );
    }
}
