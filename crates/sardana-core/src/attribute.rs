//! Cached, timestamped, filtered attributes.
//!
//! A [`SardanaAttribute`] keeps the last read value of an element quantity
//! (position, value, state...) together with its timestamp, an optional error,
//! and an independent write value. Setting a value fires an event on the
//! owning element's [`EventGenerator`] according to the propagate level:
//!
//! - `Suppress`: cache only
//! - `Normal`: fire when the filter says the new value differs from the last
//!   *reported* one (which may lag the cached value)
//! - `Force`: always fire
//!
//! A value is either valid or in error. Setting an error keeps the last good
//! value readable for diagnostics, but consumers should treat it as stale.

use crate::event::{Event, EventGenerator, EventType, EventValue, Propagate};
use crate::state::State;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::ops::Deref;
use std::sync::Arc;

/// Error attached to a value, the in-band equivalent of a traceback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub details: String,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            details: message.clone(),
            message,
        }
    }

    /// Captures the full context chain of an `anyhow` error.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self {
            message: format!("{:#}", err),
            details: format!("{:?}", err),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// A timestamped value or error, as read from a controller.
#[derive(Debug, Clone, PartialEq)]
pub struct SardanaValue<T> {
    value: Option<T>,
    error: Option<ErrorInfo>,
    timestamp: DateTime<Utc>,
}

impl<T> SardanaValue<T> {
    pub fn new(value: T) -> Self {
        Self::at(value, Utc::now())
    }

    pub fn at(value: T, timestamp: DateTime<Utc>) -> Self {
        Self {
            value: Some(value),
            error: None,
            timestamp,
        }
    }

    pub fn from_error(error: ErrorInfo) -> Self {
        Self {
            value: None,
            error: Some(error),
            timestamp: Utc::now(),
        }
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    pub fn in_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn into_result(self) -> Result<T, ErrorInfo> {
        match (self.value, self.error) {
            (_, Some(err)) => Err(err),
            (Some(value), None) => Ok(value),
            (None, None) => Err(ErrorInfo::new("no value")),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> SardanaValue<U> {
        SardanaValue {
            value: self.value.map(f),
            error: self.error,
            timestamp: self.timestamp,
        }
    }
}

/// Types that can be held by a [`SardanaAttribute`].
pub trait AttributeValue: Clone + PartialEq + Send + Sync + 'static {
    fn to_event_value(&self) -> EventValue;
}

impl AttributeValue for f64 {
    fn to_event_value(&self) -> EventValue {
        EventValue::Scalar(*self)
    }
}

impl AttributeValue for Vec<f64> {
    fn to_event_value(&self) -> EventValue {
        EventValue::Vector(self.clone())
    }
}

impl AttributeValue for State {
    fn to_event_value(&self) -> EventValue {
        EventValue::State(*self)
    }
}

impl AttributeValue for String {
    fn to_event_value(&self) -> EventValue {
        EventValue::Text(self.clone())
    }
}

impl AttributeValue for u8 {
    fn to_event_value(&self) -> EventValue {
        EventValue::Switches(*self)
    }
}

/// Change filter: returns true when `new` differs enough from `last` to be reported.
pub type Filter<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Stock change filters.
pub mod filters {
    /// Every change is reported.
    pub fn always<T>(_new: &T, _last: &T) -> bool {
        true
    }

    pub fn not_equal<T: PartialEq>(new: &T, last: &T) -> bool {
        new != last
    }

    /// Numeric scalars: reports any change above `1e-16`.
    pub fn scalar_number(new: &f64, last: &f64) -> bool {
        if new.is_nan() || last.is_nan() {
            return new.is_nan() != last.is_nan();
        }
        (new - last).abs() > 1e-16
    }

    pub fn vector_number(new: &Vec<f64>, last: &Vec<f64>) -> bool {
        new.len() != last.len()
            || new
                .iter()
                .zip(last.iter())
                .any(|(a, b)| scalar_number(a, b))
    }
}

#[derive(Debug)]
struct AttributeData<T> {
    r_value: Option<T>,
    r_timestamp: Option<DateTime<Utc>>,
    error: Option<ErrorInfo>,
    w_value: Option<T>,
    w_timestamp: Option<DateTime<Utc>>,
    last_event_value: Option<T>,
    last_event_error: Option<ErrorInfo>,
}

impl<T> Default for AttributeData<T> {
    fn default() -> Self {
        Self {
            r_value: None,
            r_timestamp: None,
            error: None,
            w_value: None,
            w_timestamp: None,
            last_event_value: None,
            last_event_error: None,
        }
    }
}

/// Cached attribute of a pool element.
pub struct SardanaAttribute<T: AttributeValue> {
    name: Cow<'static, str>,
    events: Arc<EventGenerator>,
    filter: Filter<T>,
    data: Mutex<AttributeData<T>>,
}

impl<T: AttributeValue + std::fmt::Debug> std::fmt::Debug for SardanaAttribute<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SardanaAttribute")
            .field("name", &self.name)
            .field("data", &*self.data.lock())
            .finish()
    }
}

impl<T: AttributeValue> SardanaAttribute<T> {
    pub fn new(name: impl Into<Cow<'static, str>>, events: Arc<EventGenerator>) -> Self {
        Self {
            name: name.into(),
            events,
            filter: Arc::new(filters::always::<T>),
            data: Mutex::new(AttributeData::default()),
        }
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.filter = Arc::new(filter);
        self
    }

    /// Seeds the cached value without firing anything.
    pub fn with_initial_value(self, value: T) -> Self {
        {
            let mut data = self.data.lock();
            data.r_value = Some(value);
            data.r_timestamp = Some(Utc::now());
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once a value (or error) has been read at least once.
    pub fn has_value(&self) -> bool {
        let data = self.data.lock();
        data.r_value.is_some() || data.error.is_some()
    }

    /// Last known value. Still returned while the attribute is in error.
    pub fn get_value(&self) -> Option<T> {
        self.data.lock().r_value.clone()
    }

    /// Snapshot as a [`SardanaValue`]: the error if in error, else the value.
    pub fn get_value_obj(&self) -> Option<SardanaValue<T>> {
        let data = self.data.lock();
        let timestamp = data.r_timestamp.unwrap_or_else(Utc::now);
        match (&data.error, &data.r_value) {
            (Some(err), _) => Some(SardanaValue {
                value: None,
                error: Some(err.clone()),
                timestamp,
            }),
            (None, Some(value)) => Some(SardanaValue::at(value.clone(), timestamp)),
            (None, None) => None,
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.data.lock().r_timestamp
    }

    pub fn in_error(&self) -> bool {
        self.data.lock().error.is_some()
    }

    pub fn error(&self) -> Option<ErrorInfo> {
        self.data.lock().error.clone()
    }

    pub fn last_event_value(&self) -> Option<T> {
        self.data.lock().last_event_value.clone()
    }

    /// Records a valid value and fires according to `propagate`.
    /// Returns true if an event was fired.
    pub fn set_value(&self, value: T, propagate: Propagate) -> bool {
        self.set_value_at(value, Utc::now(), propagate)
    }

    pub fn set_value_at(&self, value: T, timestamp: DateTime<Utc>, propagate: Propagate) -> bool {
        {
            let mut data = self.data.lock();
            data.r_value = Some(value);
            data.r_timestamp = Some(timestamp);
            data.error = None;
        }
        self.fire_event(propagate)
    }

    /// Puts the attribute in error. The last good value is kept.
    pub fn set_error(&self, error: ErrorInfo, propagate: Propagate) -> bool {
        {
            let mut data = self.data.lock();
            data.error = Some(error);
            data.r_timestamp = Some(Utc::now());
        }
        self.fire_event(propagate)
    }

    pub fn set_value_obj(&self, value: SardanaValue<T>, propagate: Propagate) -> bool {
        let timestamp = value.timestamp;
        match (value.value, value.error) {
            (_, Some(err)) => self.set_error(err, propagate),
            (Some(v), None) => self.set_value_at(v, timestamp, propagate),
            (None, None) => false,
        }
    }

    pub fn get_write_value(&self) -> Option<T> {
        self.data.lock().w_value.clone()
    }

    pub fn write_timestamp(&self) -> Option<DateTime<Utc>> {
        self.data.lock().w_timestamp
    }

    /// Records the commanded value. Does not touch the read value; fires
    /// `w_<name>` unfiltered when `propagate` is not `Suppress`.
    pub fn set_write_value(&self, value: T, propagate: Propagate) -> bool {
        let event_value = value.to_event_value();
        {
            let mut data = self.data.lock();
            data.w_value = Some(value);
            data.w_timestamp = Some(Utc::now());
        }
        if propagate == Propagate::Suppress {
            return false;
        }
        let name = format!("w_{}", self.name);
        self.events.fire(name, propagate, event_value);
        true
    }

    /// Whether an event would be fired at this propagate level right now.
    pub fn accepts(&self, propagate: Propagate) -> bool {
        let data = self.data.lock();
        self.accepts_locked(&data, propagate)
    }

    fn accepts_locked(&self, data: &AttributeData<T>, propagate: Propagate) -> bool {
        match propagate {
            Propagate::Suppress => false,
            Propagate::Force => true,
            Propagate::Normal => {
                if let Some(err) = &data.error {
                    return data.last_event_error.as_ref() != Some(err);
                }
                match (&data.r_value, &data.last_event_value) {
                    (Some(new), Some(last)) => (self.filter)(new, last),
                    (Some(_), None) => true,
                    (None, _) => false,
                }
            }
        }
    }

    /// Fires the current value (or error) if `propagate` and the filter allow it.
    pub fn fire_event(&self, propagate: Propagate) -> bool {
        let value = {
            let mut data = self.data.lock();
            if !self.accepts_locked(&data, propagate) {
                return false;
            }
            if let Some(err) = data.error.clone() {
                data.last_event_value = None;
                data.last_event_error = Some(err.clone());
                EventValue::Error(err)
            } else {
                match data.r_value.clone() {
                    Some(v) => {
                        let ev = v.to_event_value();
                        data.last_event_value = Some(v);
                        data.last_event_error = None;
                        ev
                    }
                    None => return false,
                }
            }
        };
        let event = Event {
            source: self.events.source().to_string(),
            event_type: EventType::with_propagate(self.name.clone(), propagate),
            value,
            timestamp: Utc::now(),
        };
        self.events.fire_event(&event);
        true
    }
}

/// Attribute whose read value is whatever was last written (no hardware behind it).
pub struct SardanaSoftwareAttribute<T: AttributeValue> {
    inner: SardanaAttribute<T>,
    initial: T,
}

impl<T: AttributeValue> SardanaSoftwareAttribute<T> {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        events: Arc<EventGenerator>,
        initial: T,
    ) -> Self {
        let inner = SardanaAttribute::new(name, events).with_initial_value(initial.clone());
        inner.data.lock().w_value = Some(initial.clone());
        Self { inner, initial }
    }

    pub fn with_filter<F>(self, filter: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self {
            inner: self.inner.with_filter(filter),
            initial: self.initial,
        }
    }

    /// Returns the current value. Always present for software attributes.
    pub fn value(&self) -> T {
        self.inner
            .get_value()
            .unwrap_or_else(|| self.initial.clone())
    }

    /// Sets both the write and the read value; fires the read event.
    pub fn set_write_value(&self, value: T, propagate: Propagate) -> bool {
        self.inner.set_write_value(value.clone(), Propagate::Suppress);
        self.inner.set_value(value, propagate)
    }
}

impl<T: AttributeValue> Deref for SardanaSoftwareAttribute<T> {
    type Target = SardanaAttribute<T>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RecordingListener;

    fn position_attr() -> (SardanaAttribute<f64>, Arc<RecordingListener>, Arc<EventGenerator>) {
        let events = Arc::new(EventGenerator::new("mot01"));
        let recorder = Arc::new(RecordingListener::default());
        events.add_listener(&recorder);
        let attr = SardanaAttribute::new("position", events.clone())
            .with_filter(filters::scalar_number);
        (attr, recorder, events)
    }

    #[test]
    fn test_has_value_distinguishes_never_read() {
        let (attr, _, _) = position_attr();
        assert!(!attr.has_value());
        attr.set_value(0.0, Propagate::Suppress);
        assert!(attr.has_value());
        assert_eq!(attr.get_value(), Some(0.0));
    }

    #[test]
    fn test_propagate_zero_never_fires() {
        let (attr, recorder, _) = position_attr();
        assert!(!attr.set_value(1.0, Propagate::Suppress));
        assert!(!attr.set_value(2.0, Propagate::Suppress));
        assert!(recorder.events().is_empty());
        // the last reported value lags the cache
        assert_eq!(attr.last_event_value(), None);
        assert_eq!(attr.get_value(), Some(2.0));
    }

    #[test]
    fn test_propagate_one_is_filtered() {
        let (attr, recorder, _) = position_attr();
        assert!(attr.set_value(1.0, Propagate::Normal));
        assert!(!attr.set_value(1.0, Propagate::Normal));
        assert!(attr.set_value(1.5, Propagate::Normal));
        assert_eq!(recorder.count("position"), 2);
    }

    #[test]
    fn test_propagate_two_bypasses_filter() {
        let (attr, recorder, _) = position_attr();
        attr.set_value(1.0, Propagate::Normal);
        assert!(attr.set_value(1.0, Propagate::Force));
        assert!(attr.set_value(1.0, Propagate::Force));
        let events = recorder.events_named("position");
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].event_type.priority, 2);
    }

    #[test]
    fn test_filter_compares_against_last_reported_value() {
        let (attr, recorder, _) = position_attr();
        attr.set_value(1.0, Propagate::Normal);
        attr.set_value(5.0, Propagate::Suppress);
        // back to the last reported value: nothing new for listeners
        assert!(!attr.set_value(1.0, Propagate::Normal));
        assert_eq!(recorder.count("position"), 1);
    }

    #[test]
    fn test_error_keeps_last_good_value() {
        let (attr, recorder, _) = position_attr();
        attr.set_value(3.0, Propagate::Normal);
        attr.set_error(ErrorInfo::new("read failed"), Propagate::Normal);
        assert!(attr.in_error());
        assert_eq!(attr.get_value(), Some(3.0));
        let obj = attr.get_value_obj().unwrap();
        assert!(obj.in_error());
        assert!(obj.value().is_none());

        let last = recorder.events().pop().unwrap();
        assert!(matches!(last.value, EventValue::Error(_)));

        // a good value clears the error and is reported again
        assert!(attr.set_value(3.0, Propagate::Normal));
        assert!(!attr.in_error());
    }

    #[test]
    fn test_write_value_is_independent() {
        let (attr, recorder, _) = position_attr();
        attr.set_value(1.0, Propagate::Suppress);
        attr.set_write_value(10.0, Propagate::Normal);
        assert_eq!(attr.get_write_value(), Some(10.0));
        assert_eq!(attr.get_value(), Some(1.0));
        assert_eq!(recorder.count("w_position"), 1);
    }

    #[test]
    fn test_software_attribute_reads_what_was_written() {
        let events = Arc::new(EventGenerator::new("mot01"));
        let recorder = Arc::new(RecordingListener::default());
        events.add_listener(&recorder);
        let offset = SardanaSoftwareAttribute::new("offset", events, 0.0)
            .with_filter(filters::scalar_number);
        assert_eq!(offset.value(), 0.0);
        offset.set_write_value(2.5, Propagate::Normal);
        assert_eq!(offset.value(), 2.5);
        assert_eq!(offset.get_write_value(), Some(2.5));
        assert_eq!(recorder.count("offset"), 1);
    }

    #[test]
    fn test_value_obj_exclusivity() {
        let ok = SardanaValue::new(4.0);
        assert!(!ok.in_error());
        assert_eq!(ok.clone().into_result(), Ok(4.0));

        let err: SardanaValue<f64> = SardanaValue::from_error(ErrorInfo::new("boom"));
        assert!(err.value().is_none());
        assert!(err.into_result().is_err());
    }

    #[test]
    fn test_scalar_filter() {
        assert!(!filters::scalar_number(&1.0, &1.0));
        assert!(filters::scalar_number(&1.0, &1.000001));
        assert!(!filters::scalar_number(&f64::NAN, &f64::NAN));
        assert!(filters::vector_number(&vec![1.0, 2.0], &vec![1.0]));
        assert!(!filters::vector_number(&vec![1.0, 2.0], &vec![1.0, 2.0]));
    }
}
