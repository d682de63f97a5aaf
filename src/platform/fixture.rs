//! JSON page fixtures.
//!
//! A fixture describes a page at load time and the script activity that
//! follows. Hosts without a real browser (the CLI, integration tests) build
//! a [`Page`] from it and replay the actions through the capability table.

use crate::platform::capability::{PlatformError, Receiver, Value};
use crate::platform::dom::{Element, ElementRef, HandlerTarget};
use crate::platform::page::{Navigator, Page, PageFeatures, Screen, SharedPage};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors loading a fixture file.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A global handler set at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalHandler {
    pub target: HandlerTarget,
    pub event: String,
}

/// Page description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageFixture {
    pub url: String,
    /// Display label; defaults to the URL host.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub navigator: Navigator,
    #[serde(default = "default_screen")]
    pub screen: Option<Screen>,
    #[serde(default)]
    pub features: PageFeatures,
    #[serde(default)]
    pub cookies: Vec<String>,
    #[serde(default)]
    pub global_handlers: Vec<GlobalHandler>,
    #[serde(default)]
    pub elements: Vec<Element>,
    /// Activity replayed after the load pass.
    #[serde(default)]
    pub actions: Vec<PageAction>,
}

fn default_screen() -> Option<Screen> {
    Some(Screen::default())
}

/// Where an action's call is made from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTarget {
    #[default]
    Window,
    Document,
    /// Element by id.
    Element(String),
}

/// Script activity on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PageAction {
    AddEventListener {
        #[serde(default)]
        target: ActionTarget,
        event: String,
    },
    SetGlobalHandler {
        target: HandlerTarget,
        event: String,
    },
    Fetch {
        url: String,
    },
    SetCookie {
        value: String,
    },
    ReadCookie,
    CreateAudioContext,
    CreateAnalyser,
    MeasureText {
        text: String,
    },
    GetComputedStyle {
        element: String,
    },
    CanvasToDataUrl {
        #[serde(default)]
        canvas: Option<String>,
    },
    WebglGetParameter {
        parameter: u32,
    },
    WebglGetExtension {
        name: String,
    },
    AppendElement {
        element: Element,
    },
    RemoveElement {
        id: String,
    },
}

impl PageFixture {
    pub fn load(path: &Path) -> Result<Self, FixtureError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Label for display: the explicit label, else the URL host.
    pub fn display_label(&self) -> String {
        if let Some(ref label) = self.label {
            return label.clone();
        }
        let without_scheme = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        without_scheme
            .split(['/', '?', '#'])
            .next()
            .unwrap_or(without_scheme)
            .to_string()
    }

    /// Build the page as it stands at load time.
    pub fn build_page(&self) -> SharedPage {
        let mut builder = Page::builder(&self.url)
            .navigator(self.navigator.clone())
            .screen(self.screen)
            .features(self.features);
        for raw in &self.cookies {
            builder = builder.cookie(raw);
        }
        for handler in &self.global_handlers {
            builder = builder.global_handler(handler.target, &handler.event);
        }
        for element in &self.elements {
            builder = builder.element(element.clone());
        }
        builder.build()
    }
}

impl PageAction {
    /// Perform the action on `page`. The result is whatever the page's
    /// capability returned or threw.
    pub fn apply(&self, page: &Page) -> Result<Value, PlatformError> {
        match self {
            PageAction::AddEventListener { target, event } => {
                page.add_event_listener(resolve(page, target), event)
            }
            PageAction::SetGlobalHandler { target, event } => {
                page.set_global_handler(*target, event);
                Ok(Value::Undefined)
            }
            PageAction::Fetch { url } => page.fetch(url),
            PageAction::SetCookie { value } => page.write_cookie(value),
            PageAction::ReadCookie => page.read_cookie(),
            PageAction::CreateAudioContext => page.new_audio_context(),
            PageAction::CreateAnalyser => page.create_analyser(),
            PageAction::MeasureText { text } => page.measure_text(text),
            PageAction::GetComputedStyle { element } => {
                page.get_computed_style(&element_ref(page, element))
            }
            PageAction::CanvasToDataUrl { canvas } => {
                let canvas = match canvas {
                    Some(id) => element_ref(page, id),
                    None => ElementRef::new("canvas"),
                };
                page.canvas_to_data_url(&canvas)
            }
            PageAction::WebglGetParameter { parameter } => page.webgl_get_parameter(*parameter),
            PageAction::WebglGetExtension { name } => page.webgl_get_extension(name),
            PageAction::AppendElement { element } => {
                page.append_element(element.clone());
                Ok(Value::Undefined)
            }
            PageAction::RemoveElement { id } => {
                page.remove_element(id);
                Ok(Value::Undefined)
            }
        }
    }
}

fn element_ref(page: &Page, id: &str) -> ElementRef {
    page.document()
        .element_by_id(id)
        .map(Element::to_ref)
        .unwrap_or_else(|| ElementRef::new("div").with_id(id))
}

fn resolve(page: &Page, target: &ActionTarget) -> Receiver {
    match target {
        ActionTarget::Window => Receiver::Window,
        ActionTarget::Document => Receiver::Document,
        ActionTarget::Element(id) => Receiver::Element(element_ref(page, id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{
        "url": "https://shop.example.com/cart?x=1",
        "navigator": {"user_agent": "HeadlessChrome/120"},
        "cookies": ["_ga=GA1.1"],
        "global_handlers": [{"target": "document", "event": "mousemove"}],
        "elements": [
            {"tag": "canvas", "id": "fp"},
            {"tag": "script", "text": "document.addEventListener('click', f)"}
        ],
        "actions": [
            {"action": "add_event_listener", "target": {"element": "fp"}, "event": "click"},
            {"action": "webgl_get_parameter", "parameter": 37446},
            {"action": "fetch", "url": "https://www.google-analytics.com/collect"}
        ]
    }"#;

    #[test]
    fn test_fixture_parsing() {
        let fixture: PageFixture = serde_json::from_str(FIXTURE).unwrap();
        assert_eq!(fixture.display_label(), "shop.example.com");
        assert_eq!(fixture.actions.len(), 3);
        assert!(fixture.features.webgl);
        assert_eq!(fixture.screen, Some(Screen::default()));
    }

    #[test]
    fn test_fixture_builds_page_and_replays_actions() {
        let fixture: PageFixture = serde_json::from_str(FIXTURE).unwrap();
        let page = fixture.build_page();
        assert_eq!(page.cookie_names(), vec!["_ga"]);
        assert_eq!(page.document().scripts().len(), 1);

        for action in &fixture.actions {
            action.apply(&page).unwrap();
        }
        assert_eq!(page.network_log().len(), 1);
        assert_eq!(page.document().listeners()[0].target, "canvas#fp");
    }
}
