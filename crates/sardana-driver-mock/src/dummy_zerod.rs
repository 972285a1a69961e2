//! Simulated 0D controller.
//!
//! A 0D channel has no hardware acquisition of its own: it is always `On` and
//! every `ReadOne` samples the current value. Values are either scripted per
//! axis (consumed in order, the last one repeating) or a noisy constant.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use sardana_core::error::{ControllerError, ControllerErrorKind};
use sardana_core::{Axis, Controller, ControllerFeatures, State, StateInfo};
use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::time::sleep;

use crate::common::{CallLog, ControllerCall, ErrorConfig, MockMode, MockRng, TimingConfig};

const CONTROLLER_TYPE: &str = "DummyZeroDController";

/// Configuration for [`DummyZeroDController`] (`dummy_zerod`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DummyZeroDConfig {
    pub mode: MockMode,
    /// Reading of axis N is `base_value * N` plus noise
    pub base_value: f64,
    /// Peak noise amplitude
    pub noise: f64,
    pub seed: Option<u64>,
}

impl Default for DummyZeroDConfig {
    fn default() -> Self {
        Self {
            mode: MockMode::Instant,
            base_value: 1.0,
            noise: 0.0,
            seed: None,
        }
    }
}

#[derive(Debug, Default)]
struct Sim {
    scripted: BTreeMap<Axis, VecDeque<f64>>,
    last: BTreeMap<Axis, f64>,
    online: bool,
}

/// Simulated 0D controller.
#[derive(Clone)]
pub struct DummyZeroDController {
    sim: Arc<Mutex<Sim>>,
    calls: CallLog,
    base_value: f64,
    noise: f64,
    rng: Arc<MockRng>,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
}

impl DummyZeroDController {
    pub fn new() -> Self {
        Self::with_config(DummyZeroDConfig::default())
    }

    pub fn with_config(config: DummyZeroDConfig) -> Self {
        Self {
            sim: Arc::new(Mutex::new(Sim {
                online: true,
                ..Default::default()
            })),
            calls: CallLog::default(),
            base_value: config.base_value,
            noise: config.noise,
            rng: Arc::new(MockRng::new(config.seed)),
            mode: config.mode,
            timing: TimingConfig::zerod(),
            error_config: ErrorConfig::none(),
        }
    }

    pub fn with_error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }

    /// Queues readings for an axis. Once exhausted, the last one repeats.
    pub fn script_values(&self, axis: Axis, values: impl IntoIterator<Item = f64>) {
        self.sim
            .lock()
            .scripted
            .entry(axis)
            .or_default()
            .extend(values);
    }

    pub fn set_online(&self, online: bool) {
        self.sim.lock().online = online;
    }

    fn enter(&self, call: ControllerCall, operation: &'static str) -> Result<(), ControllerError> {
        self.calls.record(call);
        if !self.sim.lock().online {
            return Err(ControllerError::new(
                CONTROLLER_TYPE,
                ControllerErrorKind::Communication,
                "controller is offline",
            ));
        }
        self.error_config.check_operation(CONTROLLER_TYPE, operation)
    }

    fn sample(&self, axis: Axis) -> Result<f64, ControllerError> {
        let mut sim = self.sim.lock();
        if !sim.last.contains_key(&axis) {
            return Err(ControllerError::invalid_axis(CONTROLLER_TYPE, axis));
        }
        let next = sim.scripted.get_mut(&axis).map(|queue| queue.pop_front());
        let value = match next {
            Some(Some(v)) => v,
            Some(None) => sim.last.get(&axis).copied().unwrap_or_default(),
            None => self.base_value * f64::from(axis) + self.rng.noise(self.noise),
        };
        sim.last.insert(axis, value);
        Ok(value)
    }
}

impl Default for DummyZeroDController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Controller for DummyZeroDController {
    fn controller_type(&self) -> &str {
        CONTROLLER_TYPE
    }

    fn features(&self) -> ControllerFeatures {
        ControllerFeatures::ZERO_D
    }

    fn is_online(&self) -> bool {
        self.sim.lock().online
    }

    async fn add_device(&mut self, axis: Axis) -> Result<()> {
        self.enter(ControllerCall::AddDevice(axis), "add_device")?;
        self.sim.lock().last.insert(axis, 0.0);
        Ok(())
    }

    async fn delete_device(&mut self, axis: Axis) -> Result<()> {
        self.enter(ControllerCall::DeleteDevice(axis), "delete_device")?;
        let mut sim = self.sim.lock();
        sim.last.remove(&axis);
        sim.scripted.remove(&axis);
        Ok(())
    }

    async fn state_one(&mut self, axis: Axis) -> Result<StateInfo> {
        self.enter(ControllerCall::StateOne(axis), "state_one")?;
        if !self.sim.lock().last.contains_key(&axis) {
            return Err(ControllerError::invalid_axis(CONTROLLER_TYPE, axis).into());
        }
        Ok(StateInfo::new(State::On).with_status("0D channel is ready"))
    }

    async fn read_all(&mut self) -> Result<()> {
        self.enter(ControllerCall::ReadAll, "read_all")?;
        if self.mode.is_timed() {
            sleep(self.timing.communication_delay()).await;
        }
        Ok(())
    }

    async fn read_one(&mut self, axis: Axis) -> Result<f64> {
        self.enter(ControllerCall::ReadOne(axis), "read_one")?;
        Ok(self.sample(axis)?)
    }

    async fn abort_one(&mut self, axis: Axis) -> Result<()> {
        self.enter(ControllerCall::AbortOne(axis), "abort_one")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_values_then_repeat() {
        let mut ctrl = DummyZeroDController::new();
        ctrl.add_device(1).await.unwrap();
        ctrl.script_values(1, [1.0, 2.0, 3.0]);
        let mut read = Vec::new();
        for _ in 0..5 {
            read.push(ctrl.read_one(1).await.unwrap());
        }
        assert_eq!(read, vec![1.0, 2.0, 3.0, 3.0, 3.0]);
    }

    #[tokio::test]
    async fn test_base_value_without_noise() {
        let mut ctrl = DummyZeroDController::with_config(DummyZeroDConfig {
            base_value: 2.5,
            ..Default::default()
        });
        ctrl.add_device(2).await.unwrap();
        assert_eq!(ctrl.read_one(2).await.unwrap(), 5.0);
        assert_eq!(ctrl.state_one(2).await.unwrap().state, State::On);
    }

    #[tokio::test]
    async fn test_noise_is_bounded() {
        let mut ctrl = DummyZeroDController::with_config(DummyZeroDConfig {
            noise: 0.1,
            seed: Some(7),
            ..Default::default()
        });
        ctrl.add_device(1).await.unwrap();
        for _ in 0..50 {
            let v = ctrl.read_one(1).await.unwrap();
            assert!((v - 1.0).abs() <= 0.1 + 1e-12);
        }
    }

    #[tokio::test]
    async fn test_unknown_axis() {
        let mut ctrl = DummyZeroDController::new();
        assert!(ctrl.read_one(3).await.is_err());
        assert!(ctrl.state_one(3).await.is_err());
    }
}
