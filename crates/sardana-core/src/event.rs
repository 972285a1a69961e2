//! Event propagation.
//!
//! Every stateful pool entity owns an [`EventGenerator`]. Listeners register
//! through an `Arc` but the generator only keeps a `Weak` handle, so a listener
//! never keeps its subject alive and the subject never keeps a listener alive.
//! Dead listeners are pruned lazily the next time an event is fired.
//!
//! Events carry an [`EventType`] (name + priority). Priority follows the
//! propagate convention used throughout the pool:
//!
//! | propagate | meaning |
//! |---|---|
//! | 0 | internal only, no event |
//! | 1 | normal, filtered against the last reported value |
//! | 2 | forced, bypasses the filter |
//!
//! # Example
//!
//! ```rust
//! use sardana_core::event::{EventGenerator, EventValue, Propagate, RecordingListener};
//! use std::sync::Arc;
//!
//! let events = EventGenerator::new("mot01");
//! let recorder = Arc::new(RecordingListener::default());
//! events.add_listener(&recorder);
//!
//! events.fire("position", Propagate::Force, EventValue::Scalar(1.5));
//! assert_eq!(recorder.count("position"), 1);
//! ```

use crate::attribute::ErrorInfo;
use crate::state::State;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Propagation level of a value update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Propagate {
    /// Update the cache only
    Suppress,
    /// Fire if the filter accepts the change
    Normal,
    /// Always fire
    Force,
}

impl Propagate {
    pub fn priority(self) -> u8 {
        match self {
            Propagate::Suppress => 0,
            Propagate::Normal => 1,
            Propagate::Force => 2,
        }
    }

    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Propagate::Suppress,
            1 => Propagate::Normal,
            _ => Propagate::Force,
        }
    }
}

/// Immutable (name, priority) pair identifying an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EventType {
    pub name: Cow<'static, str>,
    pub priority: u8,
}

impl EventType {
    pub fn new(name: impl Into<Cow<'static, str>>, priority: u8) -> Self {
        Self {
            name: name.into(),
            priority,
        }
    }

    pub fn with_propagate(name: impl Into<Cow<'static, str>>, propagate: Propagate) -> Self {
        Self::new(name, propagate.priority())
    }
}

/// Payload of an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EventValue {
    State(State),
    Text(String),
    Scalar(f64),
    Vector(Vec<f64>),
    Switches(u8),
    Error(ErrorInfo),
}

impl EventValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            EventValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_state(&self) -> Option<State> {
        match self {
            EventValue::State(s) => Some(*s),
            _ => None,
        }
    }
}

/// A fired event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Name of the element that fired the event
    pub source: String,
    pub event_type: EventType,
    pub value: EventValue,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn name(&self) -> &str {
        &self.event_type.name
    }
}

/// Receiver of events.
///
/// Called synchronously from the thread that fires the event, with no pool
/// lock held. Implementations must not block.
pub trait EventListener: Send + Sync {
    fn event_received(&self, event: &Event);
}

/// Handle returned by [`EventGenerator::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Publish/subscribe primitive holding weak references to its listeners.
pub struct EventGenerator {
    source: String,
    next_id: AtomicU64,
    listeners: RwLock<Vec<(SubscriptionId, Weak<dyn EventListener>)>>,
}

impl std::fmt::Debug for EventGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventGenerator")
            .field("source", &self.source)
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl EventGenerator {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Registers a listener. Only a weak reference is kept.
    pub fn add_listener<L>(&self, listener: &Arc<L>) -> SubscriptionId
    where
        L: EventListener + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let weak: Weak<dyn EventListener> = Arc::downgrade(listener) as Weak<L>;
        self.listeners.write().push((id, weak));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    /// Number of listeners that are still alive.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    /// Delivers an event to every live listener and returns how many got it.
    pub fn fire_event(&self, event: &Event) -> usize {
        let (alive, dead) = {
            let listeners = self.listeners.read();
            let mut alive = Vec::with_capacity(listeners.len());
            let mut dead = false;
            for (_, weak) in listeners.iter() {
                match weak.upgrade() {
                    Some(listener) => alive.push(listener),
                    None => dead = true,
                }
            }
            (alive, dead)
        };

        if dead {
            self.listeners
                .write()
                .retain(|(_, weak)| weak.strong_count() > 0);
        }

        for listener in &alive {
            listener.event_received(event);
        }
        alive.len()
    }

    /// Builds and fires an event unless `propagate` is `Suppress`.
    pub fn fire(
        &self,
        name: impl Into<Cow<'static, str>>,
        propagate: Propagate,
        value: EventValue,
    ) -> usize {
        if propagate == Propagate::Suppress {
            return 0;
        }
        let event = Event {
            source: self.source.clone(),
            event_type: EventType::with_propagate(name, propagate),
            value,
            timestamp: Utc::now(),
        };
        self.fire_event(&event)
    }
}

/// Listener that stores every event it receives. Useful for tests and tools.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn events_named(&self, name: &str) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name() == name)
            .cloned()
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventListener for RecordingListener {
    fn event_received(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}

/// Listener forwarding events into an unbounded channel.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl EventListener for ChannelListener {
    fn event_received(&self, event: &Event) {
        // receiver gone: nobody is interested anymore
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_reaches_listeners() {
        let events = EventGenerator::new("mot01");
        let a = Arc::new(RecordingListener::default());
        let b = Arc::new(RecordingListener::default());
        events.add_listener(&a);
        events.add_listener(&b);

        let delivered = events.fire("state", Propagate::Normal, EventValue::State(State::On));
        assert_eq!(delivered, 2);
        assert_eq!(a.count("state"), 1);
        assert_eq!(b.events()[0].source, "mot01");
        assert_eq!(b.events()[0].event_type.priority, 1);
    }

    #[test]
    fn test_suppress_fires_nothing() {
        let events = EventGenerator::new("mot01");
        let a = Arc::new(RecordingListener::default());
        events.add_listener(&a);
        assert_eq!(
            events.fire("position", Propagate::Suppress, EventValue::Scalar(0.0)),
            0
        );
        assert!(a.events().is_empty());
    }

    #[test]
    fn test_dead_listener_is_pruned() {
        let events = EventGenerator::new("ct01");
        let keep = Arc::new(RecordingListener::default());
        events.add_listener(&keep);
        {
            let gone = Arc::new(RecordingListener::default());
            events.add_listener(&gone);
        }
        assert_eq!(events.listener_count(), 1);

        let delivered = events.fire("value", Propagate::Force, EventValue::Scalar(3.0));
        assert_eq!(delivered, 1);
        assert_eq!(events.listeners.read().len(), 1);
    }

    #[test]
    fn test_remove_listener() {
        let events = EventGenerator::new("ct01");
        let a = Arc::new(RecordingListener::default());
        let id = events.add_listener(&a);
        assert!(events.remove_listener(id));
        assert!(!events.remove_listener(id));
        events.fire("value", Propagate::Force, EventValue::Scalar(3.0));
        assert!(a.events().is_empty());
    }

    #[test]
    fn test_propagate_levels() {
        assert_eq!(Propagate::from_level(0), Propagate::Suppress);
        assert_eq!(Propagate::from_level(1), Propagate::Normal);
        assert_eq!(Propagate::from_level(7), Propagate::Force);
        assert_eq!(Propagate::Force.priority(), 2);
    }

    #[tokio::test]
    async fn test_channel_listener() {
        let events = EventGenerator::new("zerod01");
        let (listener, mut rx) = ChannelListener::new();
        events.add_listener(&listener);
        events.fire("value", Propagate::Force, EventValue::Scalar(2.0));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.value.as_scalar(), Some(2.0));
    }

    #[test]
    fn test_event_serializes() {
        let value = serde_json::to_value(EventValue::State(State::Moving)).unwrap();
        assert_eq!(value["kind"], "state");
        assert_eq!(value["value"], "Moving");
    }
}
