//! Pool-side wrapper around a controller driver.
//!
//! [`PoolController`] owns the boxed driver behind an async mutex, so every
//! hardware call for one controller is serialized, and turns the driver's
//! `*All`/`*One` protocol into batched axis operations.
//!
//! A failure of one `StateOne`/`ReadOne` only affects that axis. A failure in
//! a `Pre*All`/`*All` phase fails the whole batch and is returned to the
//! caller, which is expected to contain it per controller.

use anyhow::Context;
use parking_lot::Mutex;
use sardana_core::{
    Axis, Controller, ControllerFeatures, ControllerId, ErrorInfo, PoolError, PoolResult,
    SardanaValue, StateInfo,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::MutexGuard;
use tracing::{debug, warn};

/// Exclusive access to a driver, obtained through [`PoolController::lock`].
pub type DriverGuard<'a> = MutexGuard<'a, Box<dyn Controller>>;

/// A controller registered in the pool.
pub struct PoolController {
    id: ControllerId,
    name: String,
    controller_type: String,
    features: ControllerFeatures,
    driver: tokio::sync::Mutex<Box<dyn Controller>>,
    ctrl_error: Mutex<Option<String>>,
    online: AtomicBool,
    axes: Mutex<BTreeSet<Axis>>,
}

impl std::fmt::Debug for PoolController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolController")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type", &self.controller_type)
            .field("online", &self.is_online())
            .finish()
    }
}

impl PoolController {
    pub fn new(id: ControllerId, name: impl Into<String>, driver: Box<dyn Controller>) -> Self {
        let controller_type = driver.controller_type().to_string();
        let features = driver.features();
        let online = driver.is_online();
        Self {
            id,
            name: name.into(),
            controller_type,
            features,
            driver: tokio::sync::Mutex::new(driver),
            ctrl_error: Mutex::new(None),
            online: AtomicBool::new(online),
            axes: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn id(&self) -> ControllerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn controller_type(&self) -> &str {
        &self.controller_type
    }

    pub fn features(&self) -> ControllerFeatures {
        self.features
    }

    pub fn has_feature(&self, feature: ControllerFeatures) -> bool {
        self.features.contains(feature)
    }

    /// Axes successfully added to the driver.
    pub fn axes(&self) -> Vec<Axis> {
        self.axes.lock().iter().copied().collect()
    }

    /// Controller-level error, set when the driver refused an axis.
    pub fn ctrl_error(&self) -> Option<String> {
        self.ctrl_error.lock().clone()
    }

    pub fn set_ctrl_error(&self, error: Option<String>) {
        *self.ctrl_error.lock() = error;
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire) && self.ctrl_error.lock().is_none()
    }

    pub fn check_online(&self) -> PoolResult<()> {
        if self.is_online() {
            return Ok(());
        }
        Err(PoolError::ControllerOffline {
            controller: self.name.clone(),
            reason: self
                .ctrl_error()
                .unwrap_or_else(|| "controller reports it is not reachable".to_string()),
        })
    }

    /// Locks the driver for a sequence of calls that must not interleave.
    pub async fn lock(&self) -> DriverGuard<'_> {
        self.driver.lock().await
    }

    /// Re-reads the driver's own liveness flag after a call.
    pub(crate) fn refresh_online(&self, driver: &dyn Controller) {
        self.online.store(driver.is_online(), Ordering::Release);
    }

    /// Status text for an axis whose controller failed to answer.
    pub fn fault_status(&self, err: &anyhow::Error) -> String {
        if self.is_online() {
            return format!("Unexpected controller error:\n{:?}", err);
        }
        match self.ctrl_error() {
            Some(ctrl_error) => format!("{} is in error:\n{}", self.name, ctrl_error),
            None => format!("{} is offline (communication error):\n{:#}", self.name, err),
        }
    }

    pub async fn add_axis(&self, axis: Axis) -> PoolResult<()> {
        let mut driver = self.lock().await;
        let result = driver.add_device(axis).await;
        self.refresh_online(&**driver);
        match result {
            Ok(()) => {
                self.axes.lock().insert(axis);
                debug!(controller = %self.name, axis, "axis added");
                Ok(())
            }
            Err(e) => {
                warn!(controller = %self.name, axis, error = %format!("{:#}", e), "AddDevice failed");
                self.set_ctrl_error(Some(format!("AddDevice({}) failed: {:#}", axis, e)));
                Err(PoolError::driver(&self.name, "AddDevice", e))
            }
        }
    }

    pub async fn delete_axis(&self, axis: Axis) -> PoolResult<()> {
        let mut driver = self.lock().await;
        let result = driver.delete_device(axis).await;
        self.axes.lock().remove(&axis);
        result.map_err(|e| PoolError::driver(&self.name, "DeleteDevice", e))
    }

    /// Batched state read: `PreStateAll`, `PreStateOne`*, `StateAll`, `StateOne`*.
    pub async fn read_axis_states(
        &self,
        axes: &[Axis],
    ) -> anyhow::Result<BTreeMap<Axis, StateInfo>> {
        let raw = {
            let mut driver = self.lock().await;
            let raw = state_sequence(&mut **driver, axes).await;
            self.refresh_online(&**driver);
            raw
        }?;
        Ok(raw
            .into_iter()
            .map(|(axis, result)| {
                let info = result.unwrap_or_else(|e| StateInfo::fault(self.fault_status(&e)));
                (axis, info)
            })
            .collect())
    }

    /// Batched value read: `PreReadAll`, `PreReadOne`*, `ReadAll`, `ReadOne`*.
    pub async fn read_axis_values(
        &self,
        axes: &[Axis],
    ) -> anyhow::Result<BTreeMap<Axis, SardanaValue<f64>>> {
        let raw = {
            let mut driver = self.lock().await;
            let raw = read_sequence(&mut **driver, axes).await;
            self.refresh_online(&**driver);
            raw
        }?;
        Ok(raw
            .into_iter()
            .map(|(axis, result)| {
                let value = match result {
                    Ok(v) => SardanaValue::new(v),
                    Err(e) => SardanaValue::from_error(ErrorInfo::from_anyhow(&e)),
                };
                (axis, value)
            })
            .collect())
    }

    /// `StopOne` for every axis, then `StopAll` when `with_all` is set. Every
    /// call is attempted; the first failure is returned.
    ///
    /// Only a controller-wide stop passes `with_all`: `StopAll` may halt axes
    /// that belong to other operations.
    pub async fn stop_axes(&self, axes: &[Axis], with_all: bool) -> anyhow::Result<()> {
        let mut driver = self.lock().await;
        let mut first = None;
        for &axis in axes {
            if let Err(e) = driver.stop_one(axis).await {
                first.get_or_insert(e.context(format!("StopOne({})", axis)));
            }
        }
        if with_all {
            if let Err(e) = driver.stop_all().await {
                first.get_or_insert(e.context("StopAll"));
            }
        }
        self.refresh_online(&**driver);
        first.map_or(Ok(()), Err)
    }

    /// `AbortOne` for every axis, then `AbortAll` when `with_all` is set. Same
    /// failure policy as [`stop_axes`](Self::stop_axes).
    pub async fn abort_axes(&self, axes: &[Axis], with_all: bool) -> anyhow::Result<()> {
        let mut driver = self.lock().await;
        let mut first = None;
        for &axis in axes {
            if let Err(e) = driver.abort_one(axis).await {
                first.get_or_insert(e.context(format!("AbortOne({})", axis)));
            }
        }
        if with_all {
            if let Err(e) = driver.abort_all().await {
                first.get_or_insert(e.context("AbortAll"));
            }
        }
        self.refresh_online(&**driver);
        first.map_or(Ok(()), Err)
    }

    /// Stops the axes, falling back to abort if the stop fails. Both include
    /// the controller-wide `*All` call.
    pub async fn emergency_break(&self, axes: &[Axis]) -> anyhow::Result<()> {
        match self.stop_axes(axes, true).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(controller = %self.name, error = %format!("{:#}", e), "stop failed, aborting");
                self.abort_axes(axes, true).await
            }
        }
    }

    /// Full ordered start of `(element, axis, dial target)` moves on this
    /// controller alone.
    pub async fn move_axes(&self, moves: &[(&str, Axis, f64)]) -> PoolResult<()> {
        self.check_online()?;
        let mut driver = self.lock().await;
        driver
            .pre_start_all()
            .await
            .map_err(|e| PoolError::driver(&self.name, "PreStartAll", e))?;
        for &(element, axis, target) in moves {
            let accepted = driver
                .pre_start_one(axis, target)
                .await
                .map_err(|e| PoolError::driver(&self.name, "PreStartOne", e))?;
            if !accepted {
                return Err(PoolError::PreStartOneFailed {
                    controller: self.name.clone(),
                    element: element.to_string(),
                    axis,
                    target,
                });
            }
        }
        for &(_, axis, target) in moves {
            driver
                .start_one(axis, target)
                .await
                .map_err(|e| PoolError::driver(&self.name, "StartOne", e))?;
        }
        driver
            .start_all()
            .await
            .map_err(|e| PoolError::driver(&self.name, "StartAll", e))
    }

    /// Loads a counter/timer preset: `PreLoadAll`, `PreLoadOne`, `LoadOne`, `LoadAll`.
    pub async fn load(&self, axis: Axis, value: f64) -> PoolResult<()> {
        self.check_online()?;
        let mut driver = self.lock().await;
        driver
            .pre_load_all()
            .await
            .map_err(|e| PoolError::driver(&self.name, "PreLoadAll", e))?;
        let accepted = driver
            .pre_load_one(axis, value)
            .await
            .map_err(|e| PoolError::driver(&self.name, "PreLoadOne", e))?;
        if !accepted {
            return Err(PoolError::PreLoadOneFailed {
                controller: self.name.clone(),
                axis,
                value,
            });
        }
        driver
            .load_one(axis, value)
            .await
            .map_err(|e| PoolError::driver(&self.name, "LoadOne", e))?;
        driver
            .load_all()
            .await
            .map_err(|e| PoolError::driver(&self.name, "LoadAll", e))
    }

    pub async fn define_position(&self, axis: Axis, dial: f64) -> PoolResult<()> {
        if !self.has_feature(ControllerFeatures::DEFINE_POSITION) {
            return Err(PoolError::MissingCapability {
                controller: self.name.clone(),
                capability: "define_position".to_string(),
            });
        }
        self.check_online()?;
        let mut driver = self.lock().await;
        driver
            .define_position(axis, dial)
            .await
            .map_err(|e| PoolError::driver(&self.name, "DefinePosition", e))
    }
}

type AxisResults<T> = Vec<(Axis, anyhow::Result<T>)>;

async fn state_sequence(
    driver: &mut dyn Controller,
    axes: &[Axis],
) -> anyhow::Result<AxisResults<StateInfo>> {
    driver.pre_state_all().await.context("PreStateAll")?;
    for &axis in axes {
        driver
            .pre_state_one(axis)
            .await
            .with_context(|| format!("PreStateOne({})", axis))?;
    }
    driver.state_all().await.context("StateAll")?;
    let mut states = Vec::with_capacity(axes.len());
    for &axis in axes {
        let state = driver
            .state_one(axis)
            .await
            .with_context(|| format!("StateOne({})", axis));
        states.push((axis, state));
    }
    Ok(states)
}

async fn read_sequence(
    driver: &mut dyn Controller,
    axes: &[Axis],
) -> anyhow::Result<AxisResults<f64>> {
    driver.pre_read_all().await.context("PreReadAll")?;
    for &axis in axes {
        driver
            .pre_read_one(axis)
            .await
            .with_context(|| format!("PreReadOne({})", axis))?;
    }
    driver.read_all().await.context("ReadAll")?;
    let mut values = Vec::with_capacity(axes.len());
    for &axis in axes {
        let value = driver
            .read_one(axis)
            .await
            .with_context(|| format!("ReadOne({})", axis));
        values.push((axis, value));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sardana_core::State;
    use sardana_driver_mock::{ControllerCall, DummyCounterTimerController, DummyMotorController};

    async fn motor_controller(axes: &[Axis]) -> (PoolController, DummyMotorController) {
        let handle = DummyMotorController::builder().settle_polls(2).build();
        let ctrl = PoolController::new(ControllerId(1), "motctrl01", Box::new(handle.clone()));
        for &axis in axes {
            ctrl.add_axis(axis).await.unwrap();
        }
        (ctrl, handle)
    }

    #[tokio::test]
    async fn test_state_read_issues_batched_sequence() {
        let (ctrl, handle) = motor_controller(&[1, 2]).await;
        handle.calls().clear();
        let states = ctrl.read_axis_states(&[1, 2]).await.unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[&1].state, State::On);
        assert_eq!(
            handle.calls().calls(),
            vec![
                ControllerCall::PreStateAll,
                ControllerCall::PreStateOne(1),
                ControllerCall::PreStateOne(2),
                ControllerCall::StateAll,
                ControllerCall::StateOne(1),
                ControllerCall::StateOne(2),
            ]
        );
    }

    #[tokio::test]
    async fn test_single_axis_failure_is_isolated() {
        let (ctrl, handle) = motor_controller(&[1, 2]).await;
        handle.fail_state_reads(2, 1);
        let states = ctrl.read_axis_states(&[1, 2]).await.unwrap();
        assert_eq!(states[&1].state, State::On);
        assert_eq!(states[&2].state, State::Fault);
        assert!(states[&2].error);
        assert!(states[&2]
            .status_str()
            .starts_with("Unexpected controller error:\n"));
        assert!(states[&2].status_str().contains("StateOne(2)"));
    }

    #[tokio::test]
    async fn test_all_phase_failure_fails_batch() {
        let (ctrl, handle) = motor_controller(&[1]).await;
        handle.fail_next("state_all");
        let err = ctrl.read_axis_states(&[1]).await.unwrap_err();
        assert!(format!("{:#}", err).starts_with("StateAll"));
        assert!(ctrl.read_axis_states(&[1]).await.is_ok());
    }

    #[tokio::test]
    async fn test_offline_status_names_communication() {
        let (ctrl, handle) = motor_controller(&[1]).await;
        handle.set_online(false);
        let err = ctrl.read_axis_states(&[1]).await.unwrap_err();
        assert!(!ctrl.is_online());
        let status = ctrl.fault_status(&err);
        assert!(status.starts_with("motctrl01 is offline (communication error)"));
        assert!(matches!(
            ctrl.move_axes(&[("mot01", 1, 1.0)]).await,
            Err(PoolError::ControllerOffline { .. })
        ));

        handle.set_online(true);
        assert!(ctrl.read_axis_states(&[1]).await.is_ok());
        assert!(ctrl.is_online());
    }

    #[tokio::test]
    async fn test_value_errors_are_per_axis() {
        let (ctrl, handle) = motor_controller(&[1, 2]).await;
        handle.set_position(2, 4.5);
        handle.fail_next("read_one");
        let values = ctrl.read_axis_values(&[1, 2]).await.unwrap();
        assert!(values[&1].in_error());
        assert_eq!(values[&2].value(), Some(&4.5));
    }

    #[tokio::test]
    async fn test_stop_attempts_every_axis() {
        let (ctrl, handle) = motor_controller(&[1, 2, 3]).await;
        handle.fail_next("stop_one");
        handle.calls().clear();
        assert!(ctrl.stop_axes(&[1, 2, 3], true).await.is_err());
        assert_eq!(
            handle
                .calls()
                .count(|c| matches!(c, ControllerCall::StopOne(_))),
            3
        );
        assert_eq!(handle.calls().count(|c| *c == ControllerCall::StopAll), 1);
    }

    #[tokio::test]
    async fn test_axis_abort_without_all_spares_other_axes() {
        let (ctrl, handle) = motor_controller(&[1, 2]).await;
        handle.calls().clear();
        ctrl.abort_axes(&[1], false).await.unwrap();
        ctrl.stop_axes(&[1], false).await.unwrap();
        assert_eq!(
            handle.calls().calls(),
            vec![ControllerCall::AbortOne(1), ControllerCall::StopOne(1)]
        );
    }

    #[tokio::test]
    async fn test_emergency_break_falls_back_to_abort() {
        let (ctrl, handle) = motor_controller(&[1]).await;
        handle.fail_next("stop_all");
        ctrl.emergency_break(&[1]).await.unwrap();
        assert_eq!(handle.calls().count(|c| *c == ControllerCall::AbortAll), 1);
    }

    #[tokio::test]
    async fn test_move_refused_by_pre_start() {
        let (ctrl, handle) = motor_controller(&[1]).await;
        handle.refuse_pre_start(1);
        let err = ctrl.move_axes(&[("mot01", 1, 3.0)]).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "motctrl01.PreStartOne(mot01(1), 3) returns False"
        );
        assert_eq!(handle.calls().count(ControllerCall::is_start_one), 0);
    }

    #[tokio::test]
    async fn test_add_axis_failure_records_ctrl_error() {
        let (ctrl, handle) = motor_controller(&[]).await;
        handle.fail_next("add_device");
        assert!(ctrl.add_axis(4).await.is_err());
        assert!(ctrl.ctrl_error().unwrap().contains("AddDevice(4)"));
        assert!(!ctrl.is_online());
        assert!(ctrl.axes().is_empty());
    }

    #[tokio::test]
    async fn test_load_refused() {
        let handle = DummyCounterTimerController::new();
        let ctrl = PoolController::new(ControllerId(2), "ctctrl01", Box::new(handle.clone()));
        ctrl.add_axis(1).await.unwrap();
        handle.refuse_load(1);
        assert!(matches!(
            ctrl.load(1, 0.5).await,
            Err(PoolError::PreLoadOneFailed { axis: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_define_position_needs_capability() {
        let handle = DummyCounterTimerController::new();
        let ctrl = PoolController::new(ControllerId(2), "ctctrl01", Box::new(handle));
        assert!(matches!(
            ctrl.define_position(1, 0.0).await,
            Err(PoolError::MissingCapability { .. })
        ));
    }
}
