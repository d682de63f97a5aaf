//! Host model of the observed page.
//!
//! Detectors never touch a browser directly. They see the page through this
//! model: a capability table page scripts call into, a document they can
//! inspect, and the navigator/screen/cookie state the host exposes.

pub mod capability;
pub mod dom;
pub mod fixture;
pub mod page;

// Re-export commonly used types
pub use capability::{
    CapabilityFn, CapabilityId, CapabilitySlot, CapabilityTable, Invocation, PlatformError,
    Receiver, Value, WrapperMarker,
};
pub use dom::{Document, Element, ElementRef, HandlerTarget, MutationRecord, ObserverId, Script};
pub use fixture::{FixtureError, PageAction, PageFixture};
pub use page::{
    MimeType, Navigator, Page, PageBuilder, PageFeatures, Screen, SharedPage,
    DEBUG_RENDERER_INFO, UNMASKED_RENDERER_WEBGL, UNMASKED_VENDOR_WEBGL,
};
