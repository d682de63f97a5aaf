//! Capability table for a page session.
//!
//! A capability is any platform operation a page script can call: an
//! event-registration method, a property accessor, a constructor, a network
//! call. The table maps each [`CapabilityId`] to its current implementation,
//! the way a page's global objects and prototypes map names to functions.

use crate::platform::dom::ElementRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Platform capabilities the detectors know how to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityId {
    AddEventListener,
    Fetch,
    CookieGet,
    CookieSet,
    AudioContextConstructor,
    CreateAnalyser,
    MeasureText,
    GetComputedStyle,
    CanvasToDataUrl,
    WebGlGetParameter,
    WebGlGetExtension,
}

impl CapabilityId {
    /// The script-visible path of the capability.
    pub fn path(&self) -> &'static str {
        match self {
            CapabilityId::AddEventListener => "EventTarget.prototype.addEventListener",
            CapabilityId::Fetch => "window.fetch",
            CapabilityId::CookieGet => "document.cookie (get)",
            CapabilityId::CookieSet => "document.cookie (set)",
            CapabilityId::AudioContextConstructor => "window.AudioContext",
            CapabilityId::CreateAnalyser => "AudioContext.prototype.createAnalyser",
            CapabilityId::MeasureText => "CanvasRenderingContext2D.prototype.measureText",
            CapabilityId::GetComputedStyle => "window.getComputedStyle",
            CapabilityId::CanvasToDataUrl => "HTMLCanvasElement.prototype.toDataURL",
            CapabilityId::WebGlGetParameter => "WebGLRenderingContext.prototype.getParameter",
            CapabilityId::WebGlGetExtension => "WebGLRenderingContext.prototype.getExtension",
        }
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// The `this` of a capability call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Receiver {
    Window,
    Document,
    Element(ElementRef),
    /// A host object such as a rendering or audio context.
    Host(String),
}

impl Receiver {
    /// Short label used in evidence strings.
    pub fn label(&self) -> String {
        match self {
            Receiver::Window => "window".to_string(),
            Receiver::Document => "document".to_string(),
            Receiver::Element(el) => el.to_string(),
            Receiver::Host(name) => name.clone(),
        }
    }
}

/// A value passed to or returned from a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Element(ElementRef),
    Object(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_element(&self) -> Option<&ElementRef> {
        match self {
            Value::Element(el) => Some(el),
            _ => None,
        }
    }
}

/// One call of a capability.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub this: Receiver,
    pub args: Vec<Value>,
}

impl Invocation {
    pub fn new(this: Receiver, args: Vec<Value>) -> Self {
        Self { this, args }
    }

    /// Argument at `index`, `Undefined` when missing.
    pub fn arg(&self, index: usize) -> &Value {
        static UNDEFINED: Value = Value::Undefined;
        self.args.get(index).unwrap_or(&UNDEFINED)
    }
}

/// What a capability throws.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlatformError {
    #[error("TypeError: {0}")]
    TypeError(String),
    #[error("NotSupportedError: {0}")]
    NotSupported(String),
}

/// A capability implementation.
pub type CapabilityFn = Arc<dyn Fn(&Invocation) -> Result<Value, PlatformError> + Send + Sync>;

/// Marker left on a slot by whoever replaced the native implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperMarker {
    pub owner: String,
}

/// One entry of the capability table.
#[derive(Clone)]
pub struct CapabilitySlot {
    pub implementation: CapabilityFn,
    pub marker: Option<WrapperMarker>,
}

impl fmt::Debug for CapabilitySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilitySlot")
            .field("marker", &self.marker)
            .finish_non_exhaustive()
    }
}

/// The page's shared capability table.
///
/// Lookups clone the implementation out before calling it, so a capability
/// may itself call back into the table without deadlocking.
#[derive(Debug, Default)]
pub struct CapabilityTable {
    slots: RwLock<HashMap<CapabilityId, CapabilitySlot>>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define (or redefine) a native capability.
    pub fn define<F>(&self, id: CapabilityId, implementation: F)
    where
        F: Fn(&Invocation) -> Result<Value, PlatformError> + Send + Sync + 'static,
    {
        self.replace(
            id,
            CapabilitySlot {
                implementation: Arc::new(implementation),
                marker: None,
            },
        );
    }

    /// Replace the slot for `id`, returning the previous slot.
    pub fn replace(&self, id: CapabilityId, slot: CapabilitySlot) -> Option<CapabilitySlot> {
        match self.slots.write() {
            Ok(mut slots) => slots.insert(id, slot),
            Err(poisoned) => poisoned.into_inner().insert(id, slot),
        }
    }

    /// Current slot for `id`.
    pub fn slot(&self, id: CapabilityId) -> Option<CapabilitySlot> {
        match self.slots.read() {
            Ok(slots) => slots.get(&id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&id).cloned(),
        }
    }

    pub fn contains(&self, id: CapabilityId) -> bool {
        self.slot(id).is_some()
    }

    /// Call a capability the way a page script would.
    pub fn invoke(
        &self,
        id: CapabilityId,
        invocation: &Invocation,
    ) -> Result<Value, PlatformError> {
        match self.slot(id) {
            Some(slot) => (slot.implementation)(invocation),
            None => Err(PlatformError::TypeError(format!("{id} is not a function"))),
        }
    }
}
