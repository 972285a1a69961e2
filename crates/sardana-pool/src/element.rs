//! State shared by every pool element.

use crate::pool_controller::PoolController;
use parking_lot::Mutex;
use sardana_core::{
    filters, Axis, ElementId, ElementType, EventGenerator, EventListener, PoolError, PoolResult,
    Propagate, SardanaAttribute, State, SubscriptionId,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Proof of having marked an element as busy.
///
/// Only the holder of the matching token can clear the mark, so a late
/// cleanup from a finished operation never releases a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationToken(u64);

impl OperationToken {
    fn next() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identity, state, status and operation bookkeeping of an element.
pub struct ElementCore {
    id: ElementId,
    name: String,
    element_type: ElementType,
    events: Arc<EventGenerator>,
    state: SardanaAttribute<State>,
    status: SardanaAttribute<String>,
    operation: Mutex<Option<(String, OperationToken)>>,
    stopped: AtomicBool,
    aborted: AtomicBool,
    simulation: AtomicBool,
}

impl std::fmt::Debug for ElementCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementCore")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type", &self.element_type)
            .field("state", &self.state())
            .field("operation", &self.operation())
            .finish()
    }
}

impl ElementCore {
    pub fn new(id: ElementId, name: impl Into<String>, element_type: ElementType) -> Self {
        let name = name.into();
        let events = Arc::new(EventGenerator::new(name.clone()));
        let state = SardanaAttribute::new("state", Arc::clone(&events))
            .with_filter(filters::not_equal::<State>);
        let status = SardanaAttribute::new("status", Arc::clone(&events))
            .with_filter(filters::not_equal::<String>);
        Self {
            id,
            name,
            element_type,
            events,
            state,
            status,
            operation: Mutex::new(None),
            stopped: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            simulation: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ElementId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn events(&self) -> &Arc<EventGenerator> {
        &self.events
    }

    pub fn add_listener<L>(&self, listener: &Arc<L>) -> SubscriptionId
    where
        L: EventListener + 'static,
    {
        self.events.add_listener(listener)
    }

    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        self.events.remove_listener(id)
    }

    /// Last known state; `Unknown` until the first read.
    pub fn state(&self) -> State {
        self.state.get_value().unwrap_or_default()
    }

    pub fn status(&self) -> String {
        self.status.get_value().unwrap_or_default()
    }

    pub fn state_attribute(&self) -> &SardanaAttribute<State> {
        &self.state
    }

    pub fn status_attribute(&self) -> &SardanaAttribute<String> {
        &self.status
    }

    pub fn set_state(&self, state: State, propagate: Propagate) -> bool {
        self.state.set_value(state, propagate)
    }

    pub fn set_status(&self, status: impl Into<String>, propagate: Propagate) -> bool {
        self.status.set_value(status.into(), propagate)
    }

    /// Marks the element as involved in `operation`.
    ///
    /// Fails with [`PoolError::AlreadyInOperation`] if another operation holds
    /// it. Clears the stopped and aborted flags.
    pub fn set_operation(&self, operation: &str) -> PoolResult<OperationToken> {
        let mut current = self.operation.lock();
        if current.is_some() {
            return Err(PoolError::AlreadyInOperation(self.name.clone()));
        }
        let token = OperationToken::next();
        *current = Some((operation.to_string(), token));
        self.stopped.store(false, Ordering::Release);
        self.aborted.store(false, Ordering::Release);
        Ok(token)
    }

    /// Clears the mark if `token` still owns it. Returns whether it did.
    pub fn release_operation(&self, token: OperationToken) -> bool {
        let mut current = self.operation.lock();
        match current.as_ref() {
            Some((_, owner)) if *owner == token => {
                *current = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_in_operation(&self) -> bool {
        self.operation.lock().is_some()
    }

    /// Name of the operation currently holding the element.
    pub fn operation(&self) -> Option<String> {
        self.operation.lock().as_ref().map(|(name, _)| name.clone())
    }

    pub fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn mark_aborted(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn was_interrupted(&self) -> bool {
        self.was_stopped() || self.was_aborted()
    }

    pub fn clear_interrupted(&self) {
        self.stopped.store(false, Ordering::Release);
        self.aborted.store(false, Ordering::Release);
    }

    /// In simulation mode no hardware call is made on behalf of the element.
    pub fn simulation_mode(&self) -> bool {
        self.simulation.load(Ordering::Acquire)
    }

    pub fn set_simulation_mode(&self, simulation: bool) {
        self.simulation.store(simulation, Ordering::Release);
    }
}

/// An element bound to exactly one axis of one controller.
pub trait PoolElement: Send + Sync + 'static {
    fn core(&self) -> &ElementCore;

    fn controller(&self) -> &Arc<PoolController>;

    fn axis(&self) -> Axis;

    fn id(&self) -> ElementId {
        self.core().id()
    }

    fn name(&self) -> &str {
        self.core().name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sardana_core::RecordingListener;

    fn core() -> ElementCore {
        ElementCore::new(ElementId(1), "mot01", ElementType::Motor)
    }

    #[test]
    fn test_operation_mark_is_exclusive() {
        let core = core();
        let token = core.set_operation("motion").unwrap();
        assert_eq!(core.operation().as_deref(), Some("motion"));
        let err = core.set_operation("other").unwrap_err();
        assert_eq!(err.to_string(), "mot01 is already involved in an operation");
        assert!(core.release_operation(token));
        assert!(!core.is_in_operation());
    }

    #[test]
    fn test_stale_token_does_not_release() {
        let core = core();
        let old = core.set_operation("motion").unwrap();
        core.release_operation(old);
        let _new = core.set_operation("motion").unwrap();
        assert!(!core.release_operation(old));
        assert!(core.is_in_operation());
    }

    #[test]
    fn test_entering_operation_clears_flags() {
        let core = core();
        core.mark_aborted();
        assert!(core.was_interrupted());
        let _token = core.set_operation("motion").unwrap();
        assert!(!core.was_aborted());
        assert!(!core.was_stopped());
    }

    #[test]
    fn test_state_events_only_on_change() {
        let core = core();
        let recorder = Arc::new(RecordingListener::default());
        core.add_listener(&recorder);
        assert_eq!(core.state(), State::Unknown);

        core.set_state(State::On, Propagate::Normal);
        core.set_state(State::On, Propagate::Normal);
        core.set_state(State::Moving, Propagate::Normal);
        assert_eq!(recorder.count("state"), 2);

        core.set_state(State::Moving, Propagate::Force);
        assert_eq!(recorder.count("state"), 3);
    }
}
