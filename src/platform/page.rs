//! A live page session: document, navigator, screen, cookie jar and the
//! native capability implementations page scripts call.

use crate::instrument::{InterceptorStore, SharedInterceptors};
use crate::platform::capability::{
    CapabilityId, CapabilityTable, Invocation, PlatformError, Receiver, Value,
};
use crate::platform::dom::{
    Document, Element, ElementRef, HandlerTarget, ListenerRecord, MutationCallback,
    MutationRecord, ObserverId,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// `WEBGL_debug_renderer_info.UNMASKED_VENDOR_WEBGL`
pub const UNMASKED_VENDOR_WEBGL: u32 = 0x9245;
/// `WEBGL_debug_renderer_info.UNMASKED_RENDERER_WEBGL`
pub const UNMASKED_RENDERER_WEBGL: u32 = 0x9246;
/// Name of the extension exposing the unmasked parameters.
pub const DEBUG_RENDERER_INFO: &str = "WEBGL_debug_renderer_info";

const GL_VENDOR: u32 = 0x1F00;
const GL_RENDERER: u32 = 0x1F01;

const SUPPORTED_EXTENSIONS: &[&str] = &[
    DEBUG_RENDERER_INFO,
    "OES_texture_float",
    "OES_standard_derivatives",
    "WEBGL_lose_context",
    "EXT_texture_filter_anisotropic",
];

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// A MIME type entry and the plugin that handles it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MimeType {
    #[serde(rename = "type")]
    pub mime_type: String,
    #[serde(default)]
    pub enabled_plugin: Option<String>,
}

/// `navigator` properties the detectors read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Navigator {
    pub user_agent: String,
    #[serde(default)]
    pub mime_types: Vec<MimeType>,
}

impl Default for Navigator {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            mime_types: Vec::new(),
        }
    }
}

impl Navigator {
    /// Names of enabled plugins, deduplicated, in MIME type order.
    pub fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for mime in &self.mime_types {
            if let Some(ref plugin) = mime.enabled_plugin {
                if !names.contains(plugin) {
                    names.push(plugin.clone());
                }
            }
        }
        names
    }
}

/// `window.screen` geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screen {
    pub width: u32,
    pub height: u32,
    pub color_depth: u32,
}

impl Default for Screen {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            color_depth: 24,
        }
    }
}

/// Optional platform features. A missing feature leaves its capabilities
/// out of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageFeatures {
    pub webgl: bool,
    pub audio: bool,
    pub canvas: bool,
    pub fetch: bool,
}

impl Default for PageFeatures {
    fn default() -> Self {
        Self {
            webgl: true,
            audio: true,
            canvas: true,
            fetch: true,
        }
    }
}

/// `document.cookie` storage, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: Vec<(String, String)>,
}

impl CookieJar {
    /// Apply a `document.cookie = "name=value; attrs"` assignment.
    pub fn set(&mut self, raw: &str) -> Option<String> {
        let pair = raw.split(';').next()?.trim();
        let (name, value) = match pair.split_once('=') {
            Some((n, v)) => (n.trim(), v.trim()),
            None => ("", pair),
        };
        if name.is_empty() && value.is_empty() {
            return None;
        }
        let expired = raw
            .split(';')
            .skip(1)
            .any(|attr| attr.trim().eq_ignore_ascii_case("max-age=0"));

        self.cookies.retain(|(n, _)| n != name);
        if !expired {
            self.cookies.push((name.to_string(), value.to_string()));
        }
        Some(name.to_string())
    }

    /// The `name=value; name=value` string scripts read.
    pub fn header(&self) -> String {
        self.cookies
            .iter()
            .map(|(n, v)| if n.is_empty() { v.clone() } else { format!("{n}={v}") })
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn names(&self) -> Vec<String> {
        self.cookies.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

/// Builder for a [`Page`].
#[derive(Debug, Clone, Default)]
pub struct PageBuilder {
    url: String,
    navigator: Navigator,
    screen: Option<Screen>,
    features: PageFeatures,
    elements: Vec<Element>,
    global_handlers: Vec<(HandlerTarget, String)>,
    cookies: Vec<String>,
}

impl PageBuilder {
    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.navigator.user_agent = user_agent.to_string();
        self
    }

    pub fn navigator(mut self, navigator: Navigator) -> Self {
        self.navigator = navigator;
        self
    }

    pub fn screen(mut self, screen: Option<Screen>) -> Self {
        self.screen = screen;
        self
    }

    pub fn features(mut self, features: PageFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn element(mut self, element: Element) -> Self {
        self.elements.push(element);
        self
    }

    pub fn global_handler(mut self, target: HandlerTarget, event_type: &str) -> Self {
        self.global_handlers.push((target, event_type.to_string()));
        self
    }

    pub fn cookie(mut self, raw: &str) -> Self {
        self.cookies.push(raw.to_string());
        self
    }

    /// Build the page and define its native capabilities.
    pub fn build(self) -> SharedPage {
        let mut document = Document::new();
        for element in self.elements {
            document.append(element);
        }
        for (target, event_type) in &self.global_handlers {
            document.set_global_handler(*target, event_type);
        }
        let mut jar = CookieJar::default();
        for raw in &self.cookies {
            jar.set(raw);
        }

        let page = Page {
            session_id: Uuid::new_v4(),
            url: self.url,
            capabilities: CapabilityTable::new(),
            interceptors: Arc::new(InterceptorStore::new()),
            document: Arc::new(Mutex::new(document)),
            navigator: self.navigator,
            screen: self.screen,
            features: self.features,
            cookies: Arc::new(Mutex::new(jar)),
            network_log: Arc::new(Mutex::new(Vec::new())),
        };
        page.define_natives();
        Arc::new(page)
    }
}

/// A page session.
#[derive(Debug)]
pub struct Page {
    session_id: Uuid,
    url: String,
    capabilities: CapabilityTable,
    interceptors: SharedInterceptors,
    document: Arc<Mutex<Document>>,
    navigator: Navigator,
    screen: Option<Screen>,
    features: PageFeatures,
    cookies: Arc<Mutex<CookieJar>>,
    network_log: Arc<Mutex<Vec<String>>>,
}

/// Pages are shared between the host, the detectors and their interceptors.
pub type SharedPage = Arc<Page>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Page {
    pub fn builder(url: &str) -> PageBuilder {
        PageBuilder {
            url: url.to_string(),
            screen: Some(Screen::default()),
            ..PageBuilder::default()
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    /// Interceptors installed on this page's capabilities by any session.
    pub fn interceptors(&self) -> &SharedInterceptors {
        &self.interceptors
    }

    pub fn navigator(&self) -> &Navigator {
        &self.navigator
    }

    /// `None` when the environment exposes no screen.
    pub fn screen(&self) -> Option<Screen> {
        self.screen
    }

    pub fn features(&self) -> PageFeatures {
        self.features
    }

    /// Lock the document for inspection.
    pub fn document(&self) -> MutexGuard<'_, Document> {
        lock(&self.document)
    }

    /// Shared handle for interceptors that inspect the document when called.
    pub fn document_handle(&self) -> Arc<Mutex<Document>> {
        self.document.clone()
    }

    /// Cookie names currently in the jar, read without going through the
    /// cookie accessor.
    pub fn cookie_names(&self) -> Vec<String> {
        lock(&self.cookies).names()
    }

    /// Destinations passed to the native `fetch`.
    pub fn network_log(&self) -> Vec<String> {
        lock(&self.network_log).clone()
    }

    /// Register a mutation observer on the document root.
    pub fn observe_mutations(&self, callback: MutationCallback) -> ObserverId {
        self.document().observe(callback)
    }

    pub fn disconnect_observer(&self, id: ObserverId) {
        self.document().disconnect(id);
    }

    // ------------------------------------------------------------------
    // Page-script operations. Capability calls go through the table so
    // whatever is installed there observes them.
    // ------------------------------------------------------------------

    pub fn call(
        &self,
        id: CapabilityId,
        this: Receiver,
        args: Vec<Value>,
    ) -> Result<Value, PlatformError> {
        self.capabilities.invoke(id, &Invocation::new(this, args))
    }

    pub fn add_event_listener(
        &self,
        this: Receiver,
        event_type: &str,
    ) -> Result<Value, PlatformError> {
        self.call(
            CapabilityId::AddEventListener,
            this,
            vec![Value::Str(event_type.to_string()), Value::Object("listener".into())],
        )
    }

    pub fn fetch(&self, url: &str) -> Result<Value, PlatformError> {
        self.call(CapabilityId::Fetch, Receiver::Window, vec![Value::Str(url.to_string())])
    }

    pub fn read_cookie(&self) -> Result<Value, PlatformError> {
        self.call(CapabilityId::CookieGet, Receiver::Document, Vec::new())
    }

    pub fn write_cookie(&self, raw: &str) -> Result<Value, PlatformError> {
        self.call(CapabilityId::CookieSet, Receiver::Document, vec![Value::Str(raw.to_string())])
    }

    pub fn new_audio_context(&self) -> Result<Value, PlatformError> {
        self.call(CapabilityId::AudioContextConstructor, Receiver::Window, Vec::new())
    }

    pub fn create_analyser(&self) -> Result<Value, PlatformError> {
        self.call(CapabilityId::CreateAnalyser, Receiver::Host("AudioContext".into()), Vec::new())
    }

    pub fn measure_text(&self, text: &str) -> Result<Value, PlatformError> {
        self.call(
            CapabilityId::MeasureText,
            Receiver::Host("CanvasRenderingContext2D".into()),
            vec![Value::Str(text.to_string())],
        )
    }

    pub fn get_computed_style(&self, element: &ElementRef) -> Result<Value, PlatformError> {
        self.call(
            CapabilityId::GetComputedStyle,
            Receiver::Window,
            vec![Value::Element(element.clone())],
        )
    }

    pub fn canvas_to_data_url(&self, canvas: &ElementRef) -> Result<Value, PlatformError> {
        self.call(CapabilityId::CanvasToDataUrl, Receiver::Element(canvas.clone()), Vec::new())
    }

    pub fn webgl_get_parameter(&self, parameter: u32) -> Result<Value, PlatformError> {
        self.call(
            CapabilityId::WebGlGetParameter,
            Receiver::Host("WebGLRenderingContext".into()),
            vec![Value::Number(f64::from(parameter))],
        )
    }

    pub fn webgl_get_extension(&self, name: &str) -> Result<Value, PlatformError> {
        self.call(
            CapabilityId::WebGlGetExtension,
            Receiver::Host("WebGLRenderingContext".into()),
            vec![Value::Str(name.to_string())],
        )
    }

    /// Append an element and notify mutation observers.
    pub fn append_element(&self, element: Element) {
        let (record, callbacks) = self.document().append(element);
        dispatch(&record, &callbacks);
    }

    /// Remove an element by id and notify mutation observers.
    pub fn remove_element(&self, id: &str) -> bool {
        let removed = self.document().remove(id);
        match removed {
            Some((record, callbacks)) => {
                dispatch(&record, &callbacks);
                true
            }
            None => false,
        }
    }

    pub fn set_global_handler(&self, target: HandlerTarget, event_type: &str) {
        self.document().set_global_handler(target, event_type);
    }

    fn define_natives(&self) {
        let table = &self.capabilities;

        let document = self.document.clone();
        table.define(CapabilityId::AddEventListener, move |inv| {
            if inv.args.len() < 2 {
                return Err(PlatformError::TypeError(
                    "Failed to execute 'addEventListener': 2 arguments required".into(),
                ));
            }
            let event_type = match inv.arg(0) {
                Value::Str(s) => s.clone(),
                other => format!("{other:?}"),
            };
            lock(&document).record_listener(ListenerRecord {
                target: inv.this.label(),
                event_type,
            });
            Ok(Value::Undefined)
        });

        let cookies = self.cookies.clone();
        table.define(CapabilityId::CookieGet, move |_| Ok(Value::Str(lock(&cookies).header())));

        let cookies = self.cookies.clone();
        table.define(CapabilityId::CookieSet, move |inv| {
            if let Some(raw) = inv.arg(0).as_str() {
                lock(&cookies).set(raw);
            }
            Ok(Value::Undefined)
        });

        let document = self.document.clone();
        table.define(CapabilityId::GetComputedStyle, move |inv| {
            let el = inv.arg(0).as_element().ok_or_else(|| {
                PlatformError::TypeError(
                    "Failed to execute 'getComputedStyle': parameter 1 is not of type 'Element'"
                        .into(),
                )
            })?;
            let family = lock(&document)
                .elements()
                .iter()
                .find(|candidate| candidate.to_ref() == *el)
                .and_then(|candidate| candidate.font_family.clone())
                .unwrap_or_else(|| "serif".to_string());
            Ok(Value::Object(format!("CSSStyleDeclaration(font-family: {family})")))
        });

        if self.features.fetch {
            let log = self.network_log.clone();
            table.define(CapabilityId::Fetch, move |inv| {
                let url = inv.arg(0).as_str().ok_or_else(|| {
                    PlatformError::TypeError("Failed to execute 'fetch': invalid URL".into())
                })?;
                lock(&log).push(url.to_string());
                Ok(Value::Object("Promise<Response>".into()))
            });
        }

        if self.features.audio {
            table.define(CapabilityId::AudioContextConstructor, |_| {
                Ok(Value::Object("AudioContext".into()))
            });
            table.define(CapabilityId::CreateAnalyser, |_| {
                Ok(Value::Object("AnalyserNode".into()))
            });
        }

        if self.features.canvas {
            table.define(CapabilityId::MeasureText, |inv| {
                let text = inv.arg(0).as_str().unwrap_or("undefined");
                Ok(Value::Number(text.chars().count() as f64 * 7.5))
            });
            table.define(CapabilityId::CanvasToDataUrl, |_| {
                Ok(Value::Str("data:image/png;base64,iVBORw0KGgoAAAANSUhEUg==".into()))
            });
        }

        if self.features.webgl {
            table.define(CapabilityId::WebGlGetParameter, |inv| {
                let value = match inv.arg(0).as_number().map(|n| n as u32) {
                    Some(UNMASKED_VENDOR_WEBGL) => Value::Str("Google Inc. (Intel)".into()),
                    Some(UNMASKED_RENDERER_WEBGL) => {
                        Value::Str("ANGLE (Intel, Mesa Intel(R) UHD Graphics 620)".into())
                    }
                    Some(GL_VENDOR) => Value::Str("WebKit".into()),
                    Some(GL_RENDERER) => Value::Str("WebKit WebGL".into()),
                    _ => Value::Null,
                };
                Ok(value)
            });
            table.define(CapabilityId::WebGlGetExtension, |inv| {
                let value = match inv.arg(0).as_str() {
                    Some(name) if SUPPORTED_EXTENSIONS.contains(&name) => {
                        Value::Object(name.to_string())
                    }
                    _ => Value::Null,
                };
                Ok(value)
            });
        }
    }
}

fn dispatch(record: &MutationRecord, callbacks: &[MutationCallback]) {
    for callback in callbacks {
        callback(record);
    }
}
