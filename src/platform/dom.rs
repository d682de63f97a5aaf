//! Minimal document model: elements, scripts, global handler properties,
//! listener records and mutation observers.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// The identifying part of an element, as recorded in evidence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementRef {
    pub tag_name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub class_name: String,
}

impl ElementRef {
    pub fn new(tag_name: &str) -> Self {
        Self {
            tag_name: tag_name.to_ascii_uppercase(),
            id: String::new(),
            class_name: String::new(),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }
}

impl fmt::Display for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag_name.to_ascii_lowercase())?;
        if !self.id.is_empty() {
            write!(f, "#{}", self.id)?;
        }
        for class in self.class_name.split_whitespace() {
            write!(f, ".{class}")?;
        }
        Ok(())
    }
}

/// An element in the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub tag: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub class: String,
    /// Attributes including inline `on<event>` handlers and `src`. Names
    /// are stored lowercase, as HTML treats them.
    #[serde(default, deserialize_with = "lowercase_names")]
    pub attributes: BTreeMap<String, String>,
    /// Inline `style.fontFamily`, when set.
    #[serde(default)]
    pub font_family: Option<String>,
    /// Text content (script source for inline scripts).
    #[serde(default)]
    pub text: String,
}

fn lowercase_names<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value))
        .collect())
}

impl Element {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_font_family(mut self, family: &str) -> Self {
        self.font_family = Some(family.to_string());
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    /// Inline script element.
    pub fn script(text: &str) -> Self {
        Self::new("script").with_text(text)
    }

    /// External script element; `text` stands for the fetched source.
    pub fn external_script(src: &str, text: &str) -> Self {
        Self::new("script").with_attribute("src", src).with_text(text)
    }

    pub fn is(&self, tag: &str) -> bool {
        self.tag.eq_ignore_ascii_case(tag)
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn to_ref(&self) -> ElementRef {
        ElementRef {
            tag_name: self.tag.to_ascii_uppercase(),
            id: self.id.clone(),
            class_name: self.class.clone(),
        }
    }
}

/// Script text with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    /// `None` for inline scripts.
    pub src: Option<String>,
    pub text: String,
}

/// Where a global handler property is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerTarget {
    Window,
    Document,
}

impl fmt::Display for HandlerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerTarget::Window => f.write_str("window"),
            HandlerTarget::Document => f.write_str("document"),
        }
    }
}

/// A listener registered through the native `addEventListener`.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerRecord {
    pub target: String,
    pub event_type: String,
}

/// A child-list change under the document root.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRecord {
    pub added: Vec<ElementRef>,
    pub removed: Vec<ElementRef>,
}

/// Mutation observer callback.
pub type MutationCallback = Arc<dyn Fn(&MutationRecord) + Send + Sync>;

/// Handle returned by [`Document::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObserverId(u64);

/// The page document.
#[derive(Default)]
pub struct Document {
    elements: Vec<Element>,
    global_handlers: BTreeSet<(HandlerTarget, String)>,
    listeners: Vec<ListenerRecord>,
    observers: Vec<(ObserverId, MutationCallback)>,
    next_observer: u64,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("elements", &self.elements.len())
            .field("global_handlers", &self.global_handlers)
            .field("listeners", &self.listeners.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn element_by_id(&self, id: &str) -> Option<&Element> {
        self.elements.iter().find(|el| el.id == id)
    }

    /// All scripts in document order.
    pub fn scripts(&self) -> Vec<Script> {
        self.elements
            .iter()
            .filter(|el| el.is("script"))
            .map(|el| Script {
                src: el.attribute("src").map(str::to_string),
                text: el.text.clone(),
            })
            .collect()
    }

    /// Insert an element, returning the mutation record and the observers to
    /// notify. Callers dispatch outside of any lock held on the document.
    pub fn append(&mut self, element: Element) -> (MutationRecord, Vec<MutationCallback>) {
        let record = MutationRecord {
            added: vec![element.to_ref()],
            removed: Vec::new(),
        };
        self.elements.push(element);
        (record, self.observer_callbacks())
    }

    /// Remove the first element with `id`.
    pub fn remove(&mut self, id: &str) -> Option<(MutationRecord, Vec<MutationCallback>)> {
        let index = self.elements.iter().position(|el| el.id == id)?;
        let removed = self.elements.remove(index);
        let record = MutationRecord {
            added: Vec::new(),
            removed: vec![removed.to_ref()],
        };
        Some((record, self.observer_callbacks()))
    }

    pub fn set_global_handler(&mut self, target: HandlerTarget, event_type: &str) {
        self.global_handlers.insert((target, event_type.to_ascii_lowercase()));
    }

    pub fn clear_global_handler(&mut self, target: HandlerTarget, event_type: &str) {
        self.global_handlers.remove(&(target, event_type.to_ascii_lowercase()));
    }

    /// Targets with `on<event_type>` set.
    pub fn global_handlers_for(&self, event_type: &str) -> Vec<HandlerTarget> {
        self.global_handlers
            .iter()
            .filter(|(_, ty)| ty == event_type)
            .map(|(target, _)| *target)
            .collect()
    }

    pub fn record_listener(&mut self, record: ListenerRecord) {
        self.listeners.push(record);
    }

    pub fn listeners(&self) -> &[ListenerRecord] {
        &self.listeners
    }

    pub fn observe(&mut self, callback: MutationCallback) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, callback));
        id
    }

    pub fn disconnect(&mut self, id: ObserverId) {
        self.observers.retain(|(observer, _)| *observer != id);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    fn observer_callbacks(&self) -> Vec<MutationCallback> {
        self.observers.iter().map(|(_, cb)| cb.clone()).collect()
    }
}
