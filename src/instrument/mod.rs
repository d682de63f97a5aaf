//! Capability interceptors.
//!
//! Interceptors make page capability calls observable without changing
//! what the page sees. See [`InstrumentationRegistry::install`].

pub mod registry;

// Re-export commonly used types
pub use registry::{
    InstrumentError, InstrumentationHandle, InstrumentationRegistry, InterceptorStore, Observer,
    SharedInterceptors, SharedRegistry, AGENT_NAME,
};
