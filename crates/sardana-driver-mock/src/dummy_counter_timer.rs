//! Simulated counter/timer controller.
//!
//! One channel per axis. A load selects the master channel and its preset:
//! a positive value is an integration time in seconds, a negative value a
//! monitor count. Every started channel then counts at its own rate until the
//! preset is reached; the master reads back elapsed time (timer) or its own
//! count (monitor).

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use sardana_core::error::{ControllerError, ControllerErrorKind};
use sardana_core::{Axis, Controller, ControllerFeatures, State, StateInfo};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::time::{Instant, sleep};

use crate::common::{CallLog, ControllerCall, ErrorConfig, MockMode, TimingConfig};

const CONTROLLER_TYPE: &str = "DummyCounterTimerController";

/// Configuration for [`DummyCounterTimerController`] (`dummy_counter_timer`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DummyCounterTimerConfig {
    pub mode: MockMode,
    /// Count rate per second of axis N is `rate_step * N`
    pub rate_step: f64,
    /// State polls an acquisition takes to complete (instant mode)
    pub settle_polls: u32,
}

impl Default for DummyCounterTimerConfig {
    fn default() -> Self {
        Self {
            mode: MockMode::Instant,
            rate_step: 100.0,
            settle_polls: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Preset {
    Time(f64),
    Monitor(f64),
}

#[derive(Debug)]
struct Channel {
    rate: f64,
    value: f64,
    refuse_load: bool,
}

#[derive(Debug)]
struct Acquisition {
    axes: BTreeSet<Axis>,
    duration_s: f64,
    polls_done: u32,
    polls_total: u32,
    started: Instant,
}

#[derive(Debug, Default)]
struct Sim {
    channels: BTreeMap<Axis, Channel>,
    master: Option<(Axis, Preset)>,
    pending: BTreeSet<Axis>,
    acquisition: Option<Acquisition>,
    online: bool,
}

impl Sim {
    fn channel_mut(&mut self, axis: Axis) -> Result<&mut Channel, ControllerError> {
        self.channels
            .get_mut(&axis)
            .ok_or_else(|| ControllerError::invalid_axis(CONTROLLER_TYPE, axis))
    }

    /// Value of `axis` after `elapsed_s` seconds of counting.
    fn value_at(&self, axis: Axis, elapsed_s: f64) -> f64 {
        let rate = self.channels.get(&axis).map_or(0.0, |c| c.rate);
        match self.master {
            Some((master, Preset::Time(_))) if master == axis => elapsed_s,
            _ => rate * elapsed_s,
        }
    }

    /// Updates channel values for the given elapsed time, finishing the
    /// acquisition once the preset is reached.
    fn update(&mut self, elapsed_s: f64, finished: bool) {
        let Some(acq) = &self.acquisition else {
            return;
        };
        let elapsed_s = if finished {
            acq.duration_s
        } else {
            elapsed_s.min(acq.duration_s)
        };
        let axes: Vec<Axis> = acq.axes.iter().copied().collect();
        for axis in axes {
            let value = self.value_at(axis, elapsed_s);
            if let Some(channel) = self.channels.get_mut(&axis) {
                channel.value = value;
            }
        }
        if finished {
            self.acquisition = None;
        }
    }

    fn freeze(&mut self, elapsed_s: f64) {
        self.update(elapsed_s, false);
        self.acquisition = None;
    }
}

/// Simulated counter/timer controller.
///
/// Clones share the simulated card, so tests can keep a handle after handing the
/// controller to the pool.
#[derive(Clone)]
pub struct DummyCounterTimerController {
    sim: Arc<Mutex<Sim>>,
    calls: CallLog,
    rate_step: f64,
    settle_polls: u32,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
}

impl DummyCounterTimerController {
    pub fn new() -> Self {
        Self::with_config(DummyCounterTimerConfig::default())
    }

    pub fn with_config(config: DummyCounterTimerConfig) -> Self {
        Self {
            sim: Arc::new(Mutex::new(Sim {
                online: true,
                ..Default::default()
            })),
            calls: CallLog::default(),
            rate_step: config.rate_step,
            settle_polls: config.settle_polls,
            mode: config.mode,
            timing: TimingConfig::counter_timer(),
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

    /// Overrides the count rate of one channel.
    pub fn set_rate(&self, axis: Axis, rate: f64) {
        if let Some(c) = self.sim.lock().channels.get_mut(&axis) {
            c.rate = rate;
        }
    }

    /// Makes `PreLoadOne` return `false` for this axis.
    pub fn refuse_load(&self, axis: Axis) {
        if let Some(c) = self.sim.lock().channels.get_mut(&axis) {
            c.refuse_load = true;
        }
    }

    pub fn set_online(&self, online: bool) {
        self.sim.lock().online = online;
    }

    pub fn is_acquiring(&self) -> bool {
        self.sim.lock().acquisition.is_some()
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

    async fn latency(&self) {
        if self.mode.is_timed() {
            sleep(self.timing.communication_delay()).await;
        }
    }

    /// Brings timed acquisitions up to date with the clock.
    fn refresh(&self, sim: &mut Sim) {
        if !self.mode.is_timed() {
            return;
        }
        if let Some(acq) = &sim.acquisition {
            let elapsed = acq.started.elapsed().as_secs_f64();
            let finished = elapsed >= acq.duration_s;
            sim.update(elapsed, finished);
        }
    }
}

impl Default for DummyCounterTimerController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Controller for DummyCounterTimerController {
    fn controller_type(&self) -> &str {
        CONTROLLER_TYPE
    }

    fn features(&self) -> ControllerFeatures {
        ControllerFeatures::COUNTER_TIMER
    }

    fn is_online(&self) -> bool {
        self.sim.lock().online
    }

    async fn add_device(&mut self, axis: Axis) -> Result<()> {
        self.enter(ControllerCall::AddDevice(axis), "add_device")?;
        self.sim.lock().channels.insert(
            axis,
            Channel {
                rate: self.rate_step * f64::from(axis),
                value: 0.0,
                refuse_load: false,
            },
        );
        Ok(())
    }

    async fn delete_device(&mut self, axis: Axis) -> Result<()> {
        self.enter(ControllerCall::DeleteDevice(axis), "delete_device")?;
        self.sim.lock().channels.remove(&axis);
        Ok(())
    }

    async fn pre_state_all(&mut self) -> Result<()> {
        self.enter(ControllerCall::PreStateAll, "pre_state_all")?;
        Ok(())
    }

    async fn state_all(&mut self) -> Result<()> {
        self.enter(ControllerCall::StateAll, "state_all")?;
        self.latency().await;
        let mut sim = self.sim.lock();
        if self.mode.is_timed() {
            self.refresh(&mut sim);
        } else {
            let progress = sim.acquisition.as_mut().map(|acq| {
                acq.polls_done += 1;
                let elapsed = acq.duration_s * f64::from(acq.polls_done)
                    / f64::from(acq.polls_total.max(1));
                (elapsed, acq.polls_done >= acq.polls_total)
            });
            if let Some((elapsed, finished)) = progress {
                sim.update(elapsed, finished);
            }
        }
        Ok(())
    }

    async fn state_one(&mut self, axis: Axis) -> Result<StateInfo> {
        self.enter(ControllerCall::StateOne(axis), "state_one")?;
        let mut sim = self.sim.lock();
        self.refresh(&mut sim);
        sim.channel_mut(axis)?;
        let acquiring = sim
            .acquisition
            .as_ref()
            .is_some_and(|acq| acq.axes.contains(&axis));
        Ok(if acquiring {
            StateInfo::new(State::Moving).with_status("Channel is acquiring")
        } else {
            StateInfo::new(State::On).with_status("Channel is ready")
        })
    }

    async fn read_all(&mut self) -> Result<()> {
        self.enter(ControllerCall::ReadAll, "read_all")?;
        self.latency().await;
        Ok(())
    }

    async fn read_one(&mut self, axis: Axis) -> Result<f64> {
        self.enter(ControllerCall::ReadOne(axis), "read_one")?;
        let mut sim = self.sim.lock();
        self.refresh(&mut sim);
        Ok(sim.channel_mut(axis)?.value)
    }

    async fn pre_load_all(&mut self) -> Result<()> {
        self.enter(ControllerCall::PreLoadAll, "pre_load_all")?;
        self.sim.lock().master = None;
        Ok(())
    }

    async fn pre_load_one(&mut self, axis: Axis, value: f64) -> Result<bool> {
        self.enter(ControllerCall::PreLoadOne(axis, value), "pre_load_one")?;
        let mut sim = self.sim.lock();
        let channel = sim.channel_mut(axis)?;
        Ok(!channel.refuse_load && value != 0.0 && value.is_finite())
    }

    async fn load_one(&mut self, axis: Axis, value: f64) -> Result<()> {
        self.enter(ControllerCall::LoadOne(axis, value), "load_one")?;
        let mut sim = self.sim.lock();
        sim.channel_mut(axis)?;
        let preset = if value >= 0.0 {
            Preset::Time(value)
        } else {
            Preset::Monitor(-value)
        };
        sim.master = Some((axis, preset));
        Ok(())
    }

    async fn load_all(&mut self) -> Result<()> {
        self.enter(ControllerCall::LoadAll, "load_all")?;
        Ok(())
    }

    async fn pre_start_all(&mut self) -> Result<()> {
        self.enter(ControllerCall::PreStartAll, "pre_start_all")?;
        self.sim.lock().pending.clear();
        Ok(())
    }

    async fn pre_start_one(&mut self, axis: Axis, value: f64) -> Result<bool> {
        self.enter(ControllerCall::PreStartOne(axis, value), "pre_start_one")?;
        self.sim.lock().channel_mut(axis)?;
        Ok(true)
    }

    async fn start_one(&mut self, axis: Axis, value: f64) -> Result<()> {
        self.enter(ControllerCall::StartOne(axis, value), "start_one")?;
        let mut sim = self.sim.lock();
        let channel = sim.channel_mut(axis)?;
        channel.value = 0.0;
        sim.pending.insert(axis);
        Ok(())
    }

    async fn start_all(&mut self) -> Result<()> {
        self.enter(ControllerCall::StartAll, "start_all")?;
        self.latency().await;
        let mut sim = self.sim.lock();
        let duration_s = match sim.master {
            Some((_, Preset::Time(t))) => t,
            Some((axis, Preset::Monitor(count))) => {
                let rate = sim.channels.get(&axis).map_or(0.0, |c| c.rate);
                if rate > 0.0 { count / rate } else { count }
            }
            None => 1.0,
        };
        let axes = std::mem::take(&mut sim.pending);
        tracing::debug!(
            channels = axes.len(),
            duration_s,
            "DummyCounterTimerController: acquisition started"
        );
        sim.acquisition = Some(Acquisition {
            axes,
            duration_s,
            polls_done: 0,
            polls_total: self.settle_polls,
            started: Instant::now(),
        });
        if !self.mode.is_timed() && self.settle_polls == 0 {
            sim.update(duration_s, true);
        }
        Ok(())
    }

    async fn stop_one(&mut self, axis: Axis) -> Result<()> {
        self.enter(ControllerCall::StopOne(axis), "stop_one")?;
        self.abort_axis(axis);
        Ok(())
    }

    async fn abort_one(&mut self, axis: Axis) -> Result<()> {
        self.enter(ControllerCall::AbortOne(axis), "abort_one")?;
        self.abort_axis(axis);
        Ok(())
    }
}

impl DummyCounterTimerController {
    /// Any abort stops the whole card: channels share one gate.
    fn abort_axis(&self, axis: Axis) {
        let mut sim = self.sim.lock();
        let elapsed = match &sim.acquisition {
            Some(acq) if acq.axes.contains(&axis) => {
                if self.mode.is_timed() {
                    acq.started.elapsed().as_secs_f64()
                } else {
                    acq.duration_s * f64::from(acq.polls_done)
                        / f64::from(acq.polls_total.max(1))
                }
            }
            _ => return,
        };
        sim.freeze(elapsed);
    }
}
