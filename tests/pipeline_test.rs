//! End-to-end tests for the detection pipeline

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracksense::core::{
    Aggregator, AggregatorMessage, Badge, DisplayEvent, MergeWorker, Scheduler, Session, Severity,
    TargetKey, Trigger,
};
use tracksense::detectors::{Category, DetectionPolicy, Evidence};
use tracksense::diagnostics::create_shared_log;
use tracksense::platform::{
    CapabilityId, CapabilitySlot, HandlerTarget, Page, PageFixture, Receiver, SharedPage,
    WrapperMarker, UNMASKED_RENDERER_WEBGL,
};
use tracksense::Config;

fn fixture(name: &str) -> PageFixture {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures").join(name);
    PageFixture::load(&path).unwrap()
}

fn session_for(page: SharedPage, target: &str, config: &Config) -> Session {
    Session::from_config(TargetKey::new(target), page, config, create_shared_log()).unwrap()
}

fn run(session: &mut Session, aggregator: &Aggregator, trigger: Trigger) {
    for message in session.run_pass(trigger) {
        aggregator.apply(message);
    }
}

#[test]
fn test_clean_page_has_no_detections() {
    let fixture = fixture("clean.json");
    let page = fixture.build_page();
    let config = Config::default();
    let aggregator = Aggregator::from_config(&config);
    let mut session = session_for(page.clone(), "clean", &config);

    run(&mut session, &aggregator, Trigger::Load);
    for action in &fixture.actions {
        action.apply(&page).unwrap();
    }
    run(&mut session, &aggregator, Trigger::Tick);

    let state = aggregator.state(&TargetKey::new("clean")).unwrap();
    assert_eq!(state.total_detected, 0);
    assert_eq!(state.severity, Severity::None);
    assert_eq!(state.categories.len(), 4);
}

#[test]
fn test_listener_and_global_handler_in_one_pass() {
    let page = Page::builder("https://example.com").build();
    let config = Config::default();
    let aggregator = Aggregator::from_config(&config);
    let mut session = session_for(page.clone(), "tab", &config);

    page.add_event_listener(Receiver::Document, "mousemove").unwrap();
    page.set_global_handler(HandlerTarget::Window, "mousemove");
    run(&mut session, &aggregator, Trigger::Load);

    let state = aggregator.state(&TargetKey::new("tab")).unwrap();
    let finding = state.category(Category::Behavior).unwrap().get("mousemove").unwrap();
    assert!(finding.detected());
    assert!(finding.suspicious());
}

#[test]
fn test_webgl_evidence_survives_later_passes() {
    let page = Page::builder("https://example.com").build();
    let config = Config::default();
    let aggregator = Aggregator::from_config(&config);
    let mut session = session_for(page.clone(), "tab", &config);
    let target = TargetKey::new("tab");

    page.webgl_get_parameter(UNMASKED_RENDERER_WEBGL).unwrap();
    run(&mut session, &aggregator, Trigger::Load);
    run(&mut session, &aggregator, Trigger::Tick);
    run(&mut session, &aggregator, Trigger::Tick);

    let state = aggregator.state(&target).unwrap();
    let webgl = state.category(Category::CanvasWebgl).unwrap().get("webgl").unwrap();
    assert!(webgl.detected());
    assert!(webgl
        .evidence()
        .contains(&Evidence::text("getParameter(UNMASKED_RENDERER_WEBGL)")));
    assert_eq!(state.category(Category::CanvasWebgl).unwrap().pass(), 3);
}

#[test]
fn test_user_agent_suspicion() {
    let config = Config::default();
    let aggregator = Aggregator::from_config(&config);

    let headless = Page::builder("https://example.com")
        .user_agent("Mozilla/5.0 (X11; Linux x86_64) HeadlessChrome/120.0.0.0")
        .build();
    let mut session = session_for(headless, "headless", &config);
    run(&mut session, &aggregator, Trigger::Load);

    let desktop = Page::builder("https://example.com").build();
    let mut session = session_for(desktop, "desktop", &config);
    run(&mut session, &aggregator, Trigger::Load);

    let headless = aggregator.state(&TargetKey::new("headless")).unwrap();
    let ua = headless.category(Category::SystemBrowser).unwrap().get("userAgent").unwrap();
    assert!(ua.suspicious());
    assert!(ua.detected());

    let desktop = aggregator.state(&TargetKey::new("desktop")).unwrap();
    let ua = desktop.category(Category::SystemBrowser).unwrap().get("userAgent").unwrap();
    assert!(!ua.suspicious());
    assert!(!ua.detected());
    assert!(ua.observed());
}

#[test]
fn test_targets_do_not_cross_contaminate() {
    let config = Config::default();
    let aggregator = Aggregator::from_config(&config);

    let heavy = fixture("tracker_heavy.json");
    let heavy_page = heavy.build_page();
    let mut heavy_session = session_for(heavy_page.clone(), "heavy", &config);

    let clean = fixture("clean.json");
    let clean_page = clean.build_page();
    let mut clean_session = session_for(clean_page.clone(), "clean", &config);

    run(&mut heavy_session, &aggregator, Trigger::Load);
    run(&mut clean_session, &aggregator, Trigger::Load);
    for action in &heavy.actions {
        let _ = action.apply(&heavy_page);
    }
    for action in &clean.actions {
        let _ = action.apply(&clean_page);
    }
    run(&mut clean_session, &aggregator, Trigger::Tick);
    run(&mut heavy_session, &aggregator, Trigger::Tick);

    let clean_state = aggregator.state(&TargetKey::new("clean")).unwrap();
    let heavy_state = aggregator.state(&TargetKey::new("heavy")).unwrap();
    assert_eq!(clean_state.total_detected, 0);
    assert!(heavy_state.total_detected > 0);
}

#[test]
fn test_tracker_heavy_fixture_is_high() {
    let fixture = fixture("tracker_heavy.json");
    let page = fixture.build_page();
    let config = Config::default();
    let aggregator = Aggregator::from_config(&config);
    let target = TargetKey::new("heavy");
    aggregator.identify(&target, &fixture.display_label());
    let mut session = session_for(page.clone(), "heavy", &config);

    run(&mut session, &aggregator, Trigger::Load);
    for action in &fixture.actions {
        action.apply(&page).unwrap();
    }
    run(&mut session, &aggregator, Trigger::Tick);

    let state = aggregator.state(&target).unwrap();
    assert_eq!(state.label.as_deref(), Some("shop.example.com"));
    for (category, signal) in [
        (Category::Behavior, "mousemove"),
        (Category::SystemBrowser, "userAgent"),
        (Category::SystemBrowser, "plugins"),
        (Category::SystemBrowser, "screen"),
        (Category::SystemBrowser, "networkRequests"),
        (Category::SystemBrowser, "cookies"),
        (Category::AudioFont, "audio"),
        (Category::AudioFont, "fonts"),
        (Category::CanvasWebgl, "canvas"),
        (Category::CanvasWebgl, "webgl"),
    ] {
        assert!(state.is_detected(category, signal), "{category}/{signal} not detected");
    }
    assert!(!state.is_detected(Category::Behavior, "click"));
    assert_eq!(state.total_detected, 10);
    assert_eq!(state.severity, Severity::High);

    // Cookie values never reach evidence.
    let cookies = state.category(Category::SystemBrowser).unwrap().get("cookies").unwrap();
    assert!(cookies.evidence().iter().all(|e| !e.to_string().contains("GA1.2")));
}

#[test]
fn test_any_evidence_policy_reports_observed_signals() {
    let fixture = fixture("tracker_heavy.json");
    let page = fixture.build_page();
    let config = Config {
        policy: DetectionPolicy::AnyEvidence,
        ..Config::default()
    };
    let aggregator = Aggregator::from_config(&config);
    let mut session = session_for(page.clone(), "heavy", &config);
    run(&mut session, &aggregator, Trigger::Load);
    for action in &fixture.actions {
        action.apply(&page).unwrap();
    }
    run(&mut session, &aggregator, Trigger::Tick);

    let state = aggregator.state(&TargetKey::new("heavy")).unwrap();
    assert!(state.is_detected(Category::Behavior, "click"));
    assert_eq!(state.total_detected, 11);
}

#[test]
fn test_interception_is_transparent_and_single_layered() {
    let page = Page::builder("https://example.com").build();
    let config = Config::default();
    let session = session_for(page.clone(), "tab", &config);
    // A second session on the same page must not stack another wrapper.
    let _second = session_for(page.clone(), "tab-2", &config);

    let result = page.fetch("https://example.com/a").unwrap();
    assert_eq!(result.as_str(), None);
    assert_eq!(page.network_log(), vec!["https://example.com/a"]);

    let handle = session.context().registry.handle(CapabilityId::Fetch).unwrap();
    assert_eq!(handle.invocations(), 1);
    assert_eq!(
        handle.observer_owners(),
        vec!["systemBrowser".to_string(), "systemBrowser".to_string()]
    );
}

#[test]
fn test_new_session_after_evict_sees_page_activity() {
    let page = Page::builder("https://example.com").build();
    let config = Config::default();
    let log = create_shared_log();
    let aggregator = Aggregator::from_config(&config);
    let target = TargetKey::new("tab");

    let mut first =
        Session::from_config(target.clone(), page.clone(), &config, log.clone()).unwrap();
    run(&mut first, &aggregator, Trigger::Load);
    drop(first);
    assert!(aggregator.evict(&target).is_some());
    assert_eq!(page.interceptors().observer_count(), 0);

    let mut second =
        Session::from_config(target.clone(), page.clone(), &config, log.clone()).unwrap();
    page.fetch("https://www.google-analytics.com/collect").unwrap();
    run(&mut second, &aggregator, Trigger::Load);

    let state = aggregator.state(&target).unwrap();
    assert!(state.is_detected(Category::SystemBrowser, "networkRequests"));
    assert_eq!(log.stats().instrumentation_conflicts, 0);
    // Still one layer: the native fetch ran once.
    assert_eq!(page.network_log().len(), 1);
}

#[test]
fn test_foreign_wrapper_degrades_without_breaking_page() {
    let page = Page::builder("https://example.com").build();
    let original = page.capabilities().slot(CapabilityId::Fetch).unwrap();
    page.capabilities().replace(
        CapabilityId::Fetch,
        CapabilitySlot {
            implementation: original.implementation,
            marker: Some(WrapperMarker { owner: "other-extension".into() }),
        },
    );

    let config = Config::default();
    let log = create_shared_log();
    let aggregator = Aggregator::from_config(&config);
    let mut session =
        Session::from_config(TargetKey::new("tab"), page.clone(), &config, log.clone()).unwrap();
    assert_eq!(log.stats().instrumentation_conflicts, 1);

    page.fetch("https://www.google-analytics.com/collect").unwrap();
    run(&mut session, &aggregator, Trigger::Load);
    let state = aggregator.state(&TargetKey::new("tab")).unwrap();
    assert!(!state.is_detected(Category::SystemBrowser, "networkRequests"));
    assert_eq!(page.network_log().len(), 1);
}

#[tokio::test]
async fn test_scheduler_and_worker_end_to_end() {
    let fixture = fixture("tracker_heavy.json");
    let page = fixture.build_page();
    let config = Config {
        poll_interval: Duration::from_millis(20),
        ..Config::default()
    };
    let aggregator = Arc::new(Aggregator::from_config(&config));
    let target = TargetKey::new("heavy");
    let events = aggregator.subscribe(&target);
    let badges = aggregator.subscribe_badges();

    let (sink, worker) = MergeWorker::spawn(aggregator.clone());
    sink.send(AggregatorMessage::Identify { target: target.clone(), label: "shop".into() })
        .unwrap();
    let session = session_for(page.clone(), "heavy", &config);
    let mut handle = Scheduler::from_config(&config).start(session, sink.clone());

    for action in &fixture.actions {
        action.apply(&page).unwrap();
    }
    let mut high = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if aggregator.state(&target).map(|s| s.severity) == Some(Severity::High) {
            high = true;
            break;
        }
    }
    assert!(high, "severity never reached HIGH");

    handle.stop();
    drop(handle);
    drop(sink);
    tokio::time::timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();

    assert!(events
        .try_iter()
        .any(|e| matches!(e, DisplayEvent::LabelChanged { ref label, .. } if label == "shop")));
    let last = badges.try_iter().last().unwrap();
    assert_eq!(last.severity, Severity::High);
    assert!(matches!(last.badge, Badge::Show { ref color, .. } if color == "#FF0000"));

    assert!(aggregator.evict(&target).is_some());
    assert!(aggregator.targets().is_empty());
}
