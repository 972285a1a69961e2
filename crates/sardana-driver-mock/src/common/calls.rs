//! Recorded controller calls.
//!
//! Every dummy controller appends each trait call it receives to a shared
//! [`CallLog`]. Tests keep a clone of the controller (or of its log) and
//! assert on ordering after the controller has been handed to the pool.

use parking_lot::Mutex;
use sardana_core::Axis;
use std::sync::Arc;

/// One call received by a controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerCall {
    AddDevice(Axis),
    DeleteDevice(Axis),
    PreStateAll,
    PreStateOne(Axis),
    StateAll,
    StateOne(Axis),
    PreReadAll,
    PreReadOne(Axis),
    ReadAll,
    ReadOne(Axis),
    PreStartAll,
    PreStartOne(Axis, f64),
    StartOne(Axis, f64),
    StartAll,
    PreLoadAll,
    PreLoadOne(Axis, f64),
    LoadOne(Axis, f64),
    LoadAll,
    StopOne(Axis),
    StopAll,
    AbortOne(Axis),
    AbortAll,
    DefinePosition(Axis, f64),
}

impl ControllerCall {
    pub fn is_start_one(&self) -> bool {
        matches!(self, ControllerCall::StartOne(..))
    }

    pub fn is_start_all(&self) -> bool {
        matches!(self, ControllerCall::StartAll)
    }
}

/// Shared, append-only call log.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<ControllerCall>>>,
}

impl CallLog {
    pub fn record(&self, call: ControllerCall) {
        self.calls.lock().push(call);
    }

    pub fn calls(&self) -> Vec<ControllerCall> {
        self.calls.lock().clone()
    }

    pub fn count<F>(&self, pred: F) -> usize
    where
        F: Fn(&ControllerCall) -> bool,
    {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    /// Index of the first call matching `pred`.
    pub fn position<F>(&self, pred: F) -> Option<usize>
    where
        F: Fn(&ControllerCall) -> bool,
    {
        self.calls.lock().iter().position(|c| pred(c))
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}
