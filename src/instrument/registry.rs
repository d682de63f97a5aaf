//! Instrumentation handles and the per-session registry that owns them.
//!
//! Installing an observer on a capability replaces the table slot with a
//! wrapper that notifies observers and then forwards the untouched
//! invocation to the original implementation, returning whatever it
//! returns or throws. Handles live in an [`InterceptorStore`] owned by the
//! page, so a capability is wrapped at most once per page no matter how
//! many sessions, detectors or passes ask for it. Each session registry
//! attaches its observers to the shared handles and detaches them when the
//! session ends.

use crate::diagnostics::SharedDiagnosticsLog;
use crate::platform::capability::{
    CapabilityFn, CapabilityId, CapabilitySlot, CapabilityTable, Invocation, PlatformError, Value,
    WrapperMarker,
};
use crate::platform::Page;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;
use uuid::Uuid;

/// Marker owner written on slots wrapped by this crate.
pub const AGENT_NAME: &str = "tracksense";

/// Observation callback. Observers see every invocation before it is
/// forwarded and cannot alter it.
pub type Observer = Arc<dyn Fn(&Invocation) + Send + Sync>;

/// Why an interceptor was not installed. Neither is fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstrumentError {
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(CapabilityId),
    #[error("{capability} is already wrapped by {owner}; not rewrapping")]
    InstrumentationConflict {
        capability: CapabilityId,
        owner: String,
    },
}

struct Attached {
    session: Uuid,
    owner: String,
    observer: Observer,
}

type ObserverList = Arc<RwLock<Vec<Attached>>>;

/// An installed interceptor.
pub struct InstrumentationHandle {
    capability: CapabilityId,
    original: CapabilityFn,
    wrapper: CapabilityFn,
    observers: ObserverList,
    invocations: Arc<AtomicU64>,
}

impl fmt::Debug for InstrumentationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentationHandle")
            .field("capability", &self.capability)
            .field("observers", &self.observer_owners())
            .field("invocations", &self.invocations())
            .finish()
    }
}

impl InstrumentationHandle {
    fn new(capability: CapabilityId, original: CapabilityFn) -> Self {
        let observers: ObserverList = Arc::new(RwLock::new(Vec::new()));
        let invocations = Arc::new(AtomicU64::new(0));

        let forward = original.clone();
        let notify = observers.clone();
        let counter = invocations.clone();
        let wrapper: CapabilityFn =
            Arc::new(move |inv: &Invocation| -> Result<Value, PlatformError> {
                counter.fetch_add(1, Ordering::Relaxed);
                let snapshot: Vec<Observer> = read_observers(&notify)
                    .iter()
                    .map(|attached| attached.observer.clone())
                    .collect();
                for observer in &snapshot {
                    observer(inv);
                }
                forward(inv)
            });

        Self {
            capability,
            original,
            wrapper,
            observers,
            invocations,
        }
    }

    pub fn capability(&self) -> CapabilityId {
        self.capability
    }

    /// Invocations seen through the wrapper.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn observer_owners(&self) -> Vec<String> {
        read_observers(&self.observers)
            .iter()
            .map(|attached| attached.owner.clone())
            .collect()
    }

    /// Call the original implementation without observing.
    pub fn call_original(&self, invocation: &Invocation) -> Result<Value, PlatformError> {
        (self.original)(invocation)
    }

    /// Add `observer` unless `owner` already has one in `session`. Returns
    /// whether it was added.
    fn add_observer(&self, session: Uuid, owner: &str, observer: Observer) -> bool {
        let mut observers = write_observers(&self.observers);
        if observers
            .iter()
            .any(|attached| attached.session == session && attached.owner == owner)
        {
            return false;
        }
        observers.push(Attached {
            session,
            owner: owner.to_string(),
            observer,
        });
        true
    }

    /// Remove every observer `session` attached. Returns how many.
    fn remove_session(&self, session: Uuid) -> usize {
        let mut observers = write_observers(&self.observers);
        let before = observers.len();
        observers.retain(|attached| attached.session != session);
        before - observers.len()
    }

    fn is_installed_in(&self, slot: &CapabilitySlot) -> bool {
        same_fn(&slot.implementation, &self.wrapper)
    }
}

fn read_observers(
    observers: &RwLock<Vec<Attached>>,
) -> std::sync::RwLockReadGuard<'_, Vec<Attached>> {
    match observers.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_observers(
    observers: &RwLock<Vec<Attached>>,
) -> std::sync::RwLockWriteGuard<'_, Vec<Attached>> {
    match observers.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn same_fn(a: &CapabilityFn, b: &CapabilityFn) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Instrumentation handles of one page, keyed by capability.
#[derive(Default)]
pub struct InterceptorStore {
    handles: Mutex<BTreeMap<CapabilityId, Arc<InstrumentationHandle>>>,
}

impl fmt::Debug for InterceptorStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorStore")
            .field("installed", &self.installed())
            .finish()
    }
}

/// Stores are owned by the page and shared by every session on it.
pub type SharedInterceptors = Arc<InterceptorStore>;

impl InterceptorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, id: CapabilityId) -> Option<Arc<InstrumentationHandle>> {
        self.lock().get(&id).cloned()
    }

    pub fn installed(&self) -> Vec<CapabilityId> {
        self.lock().keys().copied().collect()
    }

    /// Observers attached across every handle.
    pub fn observer_count(&self) -> usize {
        self.lock()
            .values()
            .map(|handle| read_observers(&handle.observers).len())
            .sum()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<CapabilityId, Arc<InstrumentationHandle>>> {
        match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// One session's view of a page's interceptors.
///
/// Observers installed through a registry are tagged with its session id;
/// [`detach`](Self::detach) removes them while the wrappers stay in place
/// for the next session.
pub struct InstrumentationRegistry {
    agent: String,
    session: Uuid,
    store: SharedInterceptors,
    diagnostics: Option<SharedDiagnosticsLog>,
}

impl fmt::Debug for InstrumentationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentationRegistry")
            .field("agent", &self.agent)
            .field("session", &self.session)
            .field("installed", &self.installed())
            .finish()
    }
}

/// Registries are shared by every detector of one page session.
pub type SharedRegistry = Arc<InstrumentationRegistry>;

impl Default for InstrumentationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentationRegistry {
    /// Registry with a store of its own, for a table no page owns.
    pub fn new() -> Self {
        Self::with_store(Arc::new(InterceptorStore::new()))
    }

    /// Registry attaching to the interceptors already on `page`.
    pub fn for_page(page: &Page) -> Self {
        Self::with_store(page.interceptors().clone())
    }

    pub fn with_store(store: SharedInterceptors) -> Self {
        Self {
            agent: AGENT_NAME.to_string(),
            session: Uuid::new_v4(),
            store,
            diagnostics: None,
        }
    }

    /// Count installs, conflicts and missing capabilities in `log`.
    pub fn with_diagnostics(mut self, log: SharedDiagnosticsLog) -> Self {
        self.diagnostics = Some(log);
        self
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Install `observer` for `owner` on capability `id`.
    ///
    /// Wraps the capability the first time any session on the page asks
    /// for it. Later calls reuse the existing wrapper; an owner that already
    /// observes the capability in this session is not added twice.
    pub fn install(
        &self,
        table: &CapabilityTable,
        id: CapabilityId,
        owner: &str,
        observer: Observer,
    ) -> Result<Arc<InstrumentationHandle>, InstrumentError> {
        let mut handles = self.store.lock();

        let Some(slot) = table.slot(id) else {
            tracing::debug!(capability = %id, "capability unavailable, signal degrades");
            self.note(|log| log.record_capability_unavailable());
            return Err(InstrumentError::CapabilityUnavailable(id));
        };

        if let Some(handle) = handles.get(&id) {
            if !handle.is_installed_in(&slot) {
                return Err(self.conflict(id, &slot));
            }
            if handle.add_observer(self.session, owner, observer) {
                tracing::debug!(capability = %id, owner, "observer added to existing interceptor");
            }
            return Ok(handle.clone());
        }

        if slot.marker.is_some() {
            return Err(self.conflict(id, &slot));
        }

        let handle = Arc::new(InstrumentationHandle::new(id, slot.implementation.clone()));
        handle.add_observer(self.session, owner, observer);
        table.replace(
            id,
            CapabilitySlot {
                implementation: handle.wrapper.clone(),
                marker: Some(WrapperMarker {
                    owner: self.agent.clone(),
                }),
            },
        );
        handles.insert(id, handle.clone());

        tracing::debug!(capability = %id, owner, "interceptor installed");
        self.note(|log| log.record_interceptor_installed());
        Ok(handle)
    }

    pub fn handle(&self, id: CapabilityId) -> Option<Arc<InstrumentationHandle>> {
        self.store.handle(id)
    }

    pub fn is_installed(&self, id: CapabilityId) -> bool {
        self.store.lock().contains_key(&id)
    }

    pub fn installed(&self) -> Vec<CapabilityId> {
        self.store.installed()
    }

    /// Remove this session's observers from every handle. Wrappers stay
    /// installed and keep forwarding. Returns how many were removed.
    pub fn detach(&self) -> usize {
        let handles: Vec<Arc<InstrumentationHandle>> =
            self.store.lock().values().cloned().collect();
        let removed: usize = handles
            .iter()
            .map(|handle| handle.remove_session(self.session))
            .sum();
        if removed > 0 {
            tracing::debug!(session = %self.session, removed, "observers detached");
        }
        removed
    }

    fn conflict(&self, id: CapabilityId, slot: &CapabilitySlot) -> InstrumentError {
        let owner = slot
            .marker
            .as_ref()
            .map(|m| m.owner.clone())
            .unwrap_or_else(|| "an unknown agent".to_string());
        tracing::warn!(
            capability = %id,
            owner = %owner,
            "capability wrapped by another agent, skipping"
        );
        self.note(|log| log.record_instrumentation_conflict());
        InstrumentError::InstrumentationConflict {
            capability: id,
            owner,
        }
    }

    fn note(&self, record: impl FnOnce(&crate::diagnostics::DiagnosticsLog)) {
        if let Some(ref log) = self.diagnostics {
            record(log);
        }
    }
}
