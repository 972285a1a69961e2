//! Simulated motor controller.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use sardana_core::controller::limit_switches;
use sardana_core::error::{ControllerError, ControllerErrorKind};
use sardana_core::{Axis, Controller, ControllerFeatures, State, StateInfo};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::time::{Duration, Instant, sleep};

use crate::common::{CallLog, ControllerCall, ErrorConfig, MockMode, TimingConfig};

const CONTROLLER_TYPE: &str = "DummyMotorController";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for [`DummyMotorController`], as found in a `[[controllers]]`
/// table of type `dummy_motor`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DummyMotorConfig {
    /// Operational mode
    pub mode: MockMode,
    /// Dial position of every axis when it is added
    pub initial_position: f64,
    /// Maximum velocity in units/sec (realistic mode)
    pub max_velocity: f64,
    /// Acceleration in units/sec² (realistic mode)
    pub acceleration: f64,
    /// State polls a motion takes to complete (instant mode)
    pub settle_polls: u32,
    /// Lower limit switch position
    pub lower_limit: Option<f64>,
    /// Upper limit switch position
    pub upper_limit: Option<f64>,
    /// Advertise hardware backlash handling
    pub hardware_backlash: bool,
    /// Advertise step rounding
    pub rounding: bool,
    /// Random failure rate applied to every call in chaos mode
    pub failure_rate: f64,
    /// Seed for the failure RNG
    pub seed: Option<u64>,
}

impl Default for DummyMotorConfig {
    fn default() -> Self {
        Self {
            mode: MockMode::Instant,
            initial_position: 0.0,
            max_velocity: 10.0,
            acceleration: 20.0,
            settle_polls: 3,
            lower_limit: None,
            upper_limit: None,
            hardware_backlash: false,
            rounding: false,
            failure_rate: 0.0,
            seed: None,
        }
    }
}

// =============================================================================
// Velocity profile
// =============================================================================

/// Trapezoidal velocity profile used in realistic mode
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocityProfile {
    /// Maximum velocity in units/sec
    pub max_velocity: f64,
    /// Acceleration in units/sec²
    pub acceleration: f64,
    /// Deceleration in units/sec²
    pub deceleration: f64,
}

impl VelocityProfile {
    /// Create a symmetric profile (same accel/decel)
    pub fn symmetric(max_velocity: f64, acceleration: f64) -> Self {
        Self {
            max_velocity,
            acceleration,
            deceleration: acceleration,
        }
    }

    /// Phase durations in seconds: (accel, cruise, decel)
    fn phases(&self, distance: f64) -> (f64, f64, f64) {
        let distance = distance.abs();

        let accel_time = self.max_velocity / self.acceleration;
        let decel_time = self.max_velocity / self.deceleration;
        let accel_dist = 0.5 * self.acceleration * accel_time * accel_time;
        let decel_dist = 0.5 * self.deceleration * decel_time * decel_time;

        if accel_dist + decel_dist <= distance {
            let cruise_time = (distance - accel_dist - decel_dist) / self.max_velocity;
            (accel_time, cruise_time, decel_time)
        } else {
            // Triangular: max velocity is never reached
            let sum = self.acceleration + self.deceleration;
            let t_accel = (2.0 * distance * self.deceleration / (self.acceleration * sum)).sqrt();
            let t_decel = (2.0 * distance * self.acceleration / (self.deceleration * sum)).sqrt();
            (t_accel, 0.0, t_decel)
        }
    }

    /// Time needed to travel `distance`
    pub fn motion_time(&self, distance: f64) -> Duration {
        let (a, c, d) = self.phases(distance);
        Duration::from_secs_f64(a + c + d)
    }

    /// Distance travelled after `elapsed` on a move of length `distance`.
    pub fn travelled(&self, distance: f64, elapsed: Duration) -> f64 {
        let distance = distance.abs();
        let (ta, tc, td) = self.phases(distance);
        let total = ta + tc + td;
        let t = elapsed.as_secs_f64();
        let peak = self.acceleration * ta;
        let accel_dist = 0.5 * self.acceleration * ta * ta;

        if t >= total {
            distance
        } else if t < ta {
            0.5 * self.acceleration * t * t
        } else if t < ta + tc {
            accel_dist + peak * (t - ta)
        } else {
            let remaining = total - t;
            distance - 0.5 * self.deceleration * remaining * remaining
        }
    }
}

impl Default for VelocityProfile {
    fn default() -> Self {
        Self::symmetric(10.0, 20.0)
    }
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug, Clone)]
struct Motion {
    from: f64,
    to: f64,
    polls_done: u32,
    polls_total: u32,
    started: Instant,
    duration: Duration,
}

#[derive(Debug)]
struct MotorAxis {
    position: f64,
    motion: Option<Motion>,
    lower_limit: f64,
    upper_limit: f64,
    power: bool,
    refuse_pre_start: bool,
    failing_state_reads: u32,
}

impl MotorAxis {
    fn new(position: f64, lower_limit: f64, upper_limit: f64) -> Self {
        Self {
            position,
            motion: None,
            lower_limit,
            upper_limit,
            power: true,
            refuse_pre_start: false,
            failing_state_reads: 0,
        }
    }

    fn clamp(&mut self) {
        if self.position <= self.lower_limit {
            self.position = self.lower_limit;
            self.motion = None;
        } else if self.position >= self.upper_limit {
            self.position = self.upper_limit;
            self.motion = None;
        }
    }

    fn switches(&self) -> u8 {
        let mut switches = 0;
        if self.position <= self.lower_limit {
            switches |= limit_switches::LOWER;
        }
        if self.position >= self.upper_limit {
            switches |= limit_switches::UPPER;
        }
        switches
    }
}

#[derive(Debug, Default)]
struct Sim {
    axes: BTreeMap<Axis, MotorAxis>,
    pending: Vec<(Axis, f64)>,
    online: bool,
    fail_next: HashMap<&'static str, u32>,
}

impl Sim {
    fn axis_mut(&mut self, axis: Axis) -> Result<&mut MotorAxis, ControllerError> {
        self.axes
            .get_mut(&axis)
            .ok_or_else(|| ControllerError::invalid_axis(CONTROLLER_TYPE, axis))
    }
}

// =============================================================================
// DummyMotorController
// =============================================================================

/// Simulated motor controller.
///
/// In instant mode a motion completes after `settle_polls` state polls
/// (`StateAll` calls), with the position interpolated in between, so tests are
/// deterministic without any sleeping. Realistic and chaos modes follow a
/// [`VelocityProfile`] in wall-clock time.
///
/// The controller is `Clone`; clones share the simulated hardware, so a test
/// can hand one clone to the pool and keep another to script failures and
/// inspect the [`CallLog`].
///
/// # Example
///
/// ```rust,ignore
/// let ctrl = DummyMotorController::builder().settle_polls(2).build();
/// let handle = ctrl.clone();
/// pool.add_controller("motctrl01", Box::new(ctrl))?;
/// handle.refuse_pre_start(1);
/// ```
#[derive(Clone)]
pub struct DummyMotorController {
    sim: Arc<Mutex<Sim>>,
    calls: CallLog,
    profile: VelocityProfile,
    settle_polls: u32,
    initial_position: f64,
    lower_limit: f64,
    upper_limit: f64,
    features: ControllerFeatures,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
}

impl DummyMotorController {
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a controller from its configuration table.
    pub fn with_config(config: DummyMotorConfig) -> Self {
        let mut builder = Self::builder()
            .mode(config.mode)
            .initial_position(config.initial_position)
            .velocity_profile(VelocityProfile::symmetric(
                config.max_velocity,
                config.acceleration,
            ))
            .settle_polls(config.settle_polls)
            .hardware_backlash(config.hardware_backlash)
            .rounding(config.rounding);
        if let (Some(lower), Some(upper)) = (config.lower_limit, config.upper_limit) {
            builder = builder.limits(lower, upper);
        }
        if config.mode == MockMode::Chaos && config.failure_rate > 0.0 {
            builder = builder.error_config(ErrorConfig::random_failures_seeded(
                config.failure_rate,
                config.seed,
            ));
        }
        builder.build()
    }

    pub fn builder() -> DummyMotorControllerBuilder {
        DummyMotorControllerBuilder::new()
    }

    /// Shared log of every call received.
    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }

    /// Current dial position of an axis.
    pub fn position(&self, axis: Axis) -> Option<f64> {
        let now = Instant::now();
        let mut sim = self.sim.lock();
        let axis = sim.axes.get_mut(&axis)?;
        self.advance_timed(axis, now);
        Some(axis.position)
    }

    pub fn is_moving(&self, axis: Axis) -> bool {
        self.sim
            .lock()
            .axes
            .get(&axis)
            .is_some_and(|a| a.motion.is_some())
    }

    /// Teleports an axis (no motion, no call recorded).
    pub fn set_position(&self, axis: Axis, position: f64) {
        if let Some(a) = self.sim.lock().axes.get_mut(&axis) {
            a.position = position;
            a.motion = None;
        }
    }

    pub fn set_limits(&self, axis: Axis, lower: f64, upper: f64) {
        if let Some(a) = self.sim.lock().axes.get_mut(&axis) {
            a.lower_limit = lower;
            a.upper_limit = upper;
        }
    }

    /// A powered-off axis reports `Off`.
    pub fn set_power(&self, axis: Axis, power: bool) {
        if let Some(a) = self.sim.lock().axes.get_mut(&axis) {
            a.power = power;
        }
    }

    /// Makes `PreStartOne` return `false` for this axis.
    pub fn refuse_pre_start(&self, axis: Axis) {
        if let Some(a) = self.sim.lock().axes.get_mut(&axis) {
            a.refuse_pre_start = true;
        }
    }

    /// Makes the next `count` `StateOne` calls for this axis fail with a
    /// communication error.
    pub fn fail_state_reads(&self, axis: Axis, count: u32) {
        if let Some(a) = self.sim.lock().axes.get_mut(&axis) {
            a.failing_state_reads = count;
        }
    }

    /// Makes the next call of `operation` (e.g. `"start_all"`) fail.
    pub fn fail_next(&self, operation: &'static str) {
        *self.sim.lock().fail_next.entry(operation).or_insert(0) += 1;
    }

    /// An offline controller fails every call and reports `is_online() == false`.
    pub fn set_online(&self, online: bool) {
        self.sim.lock().online = online;
    }

    /// Records the call and applies the scripted and injected failures.
    fn enter(&self, call: ControllerCall, operation: &'static str) -> Result<(), ControllerError> {
        self.calls.record(call);
        {
            let mut sim = self.sim.lock();
            if !sim.online {
                return Err(ControllerError::new(
                    CONTROLLER_TYPE,
                    ControllerErrorKind::Communication,
                    "controller is offline",
                ));
            }
            if let Some(n) = sim.fail_next.get_mut(operation) {
                if *n > 0 {
                    *n -= 1;
                    return Err(ControllerError::new(
                        CONTROLLER_TYPE,
                        ControllerErrorKind::Hardware,
                        format!("scripted failure in {}", operation),
                    ));
                }
            }
        }
        self.error_config.check_operation(CONTROLLER_TYPE, operation)
    }

    async fn latency(&self) {
        if self.mode.is_timed() {
            let delay = self.timing.communication_delay();
            if !delay.is_zero() {
                sleep(delay).await;
            }
        }
    }

    fn advance_timed(&self, axis: &mut MotorAxis, now: Instant) {
        if !self.mode.is_timed() {
            return;
        }
        if let Some(motion) = &axis.motion {
            let elapsed = now.saturating_duration_since(motion.started);
            let distance = motion.to - motion.from;
            let travelled = self.profile.travelled(distance, elapsed);
            axis.position = motion.from + travelled.copysign(distance);
            if elapsed >= motion.duration {
                axis.position = motion.to;
                axis.motion = None;
            }
            axis.clamp();
        }
    }

    fn advance_polled(axis: &mut MotorAxis) {
        if let Some(motion) = &mut axis.motion {
            motion.polls_done += 1;
            if motion.polls_done >= motion.polls_total {
                axis.position = motion.to;
                axis.motion = None;
            } else {
                let fraction = f64::from(motion.polls_done) / f64::from(motion.polls_total);
                axis.position = motion.from + (motion.to - motion.from) * fraction;
            }
            axis.clamp();
        }
    }

    fn halt(&self, axis: Axis) -> Result<(), ControllerError> {
        let now = Instant::now();
        let mut sim = self.sim.lock();
        sim.pending.retain(|(a, _)| *a != axis);
        let motor = sim.axis_mut(axis)?;
        self.advance_timed(motor, now);
        motor.motion = None;
        Ok(())
    }
}

impl Default for DummyMotorController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Controller for DummyMotorController {
    fn controller_type(&self) -> &str {
        CONTROLLER_TYPE
    }

    fn features(&self) -> ControllerFeatures {
        self.features
    }

    fn is_online(&self) -> bool {
        let sim = self.sim.lock();
        sim.online && !self.error_config.is_communication_lost()
    }

    async fn add_device(&mut self, axis: Axis) -> Result<()> {
        self.enter(ControllerCall::AddDevice(axis), "add_device")?;
        self.sim.lock().axes.insert(
            axis,
            MotorAxis::new(self.initial_position, self.lower_limit, self.upper_limit),
        );
        tracing::debug!(axis, "DummyMotorController: axis added");
        Ok(())
    }

    async fn delete_device(&mut self, axis: Axis) -> Result<()> {
        self.enter(ControllerCall::DeleteDevice(axis), "delete_device")?;
        self.sim.lock().axes.remove(&axis);
        Ok(())
    }

    async fn pre_state_all(&mut self) -> Result<()> {
        self.enter(ControllerCall::PreStateAll, "pre_state_all")?;
        Ok(())
    }

    async fn pre_state_one(&mut self, axis: Axis) -> Result<()> {
        self.enter(ControllerCall::PreStateOne(axis), "pre_state_one")?;
        Ok(())
    }

    async fn state_all(&mut self) -> Result<()> {
        self.enter(ControllerCall::StateAll, "state_all")?;
        self.latency().await;
        let now = Instant::now();
        let mut sim = self.sim.lock();
        for motor in sim.axes.values_mut() {
            if self.mode.is_timed() {
                self.advance_timed(motor, now);
            } else {
                Self::advance_polled(motor);
            }
        }
        Ok(())
    }

    async fn state_one(&mut self, axis: Axis) -> Result<StateInfo> {
        self.enter(ControllerCall::StateOne(axis), "state_one")?;
        let now = Instant::now();
        let mut sim = self.sim.lock();
        let motor = sim.axis_mut(axis)?;
        if motor.failing_state_reads > 0 {
            motor.failing_state_reads -= 1;
            return Err(ControllerError::new(
                CONTROLLER_TYPE,
                ControllerErrorKind::Communication,
                format!("connection error reading state of axis {}", axis),
            )
            .into());
        }
        self.advance_timed(motor, now);

        let switches = motor.switches();
        let info = if switches & limit_switches::LOWER != 0 {
            StateInfo::new(State::Alarm)
                .with_status("Motor HW is in ALARM. Hit hardware lower limit switch")
        } else if switches & limit_switches::UPPER != 0 {
            StateInfo::new(State::Alarm)
                .with_status("Motor HW is in ALARM. Hit hardware upper limit switch")
        } else if motor.motion.is_some() {
            StateInfo::new(State::Moving).with_status("Motor is moving")
        } else if !motor.power {
            StateInfo::new(State::Off).with_status("Motor is powered off")
        } else {
            StateInfo::new(State::On).with_status("Motor is stopped")
        };
        Ok(info.with_limit_switches(switches))
    }

    async fn read_all(&mut self) -> Result<()> {
        self.enter(ControllerCall::ReadAll, "read_all")?;
        self.latency().await;
        Ok(())
    }

    async fn read_one(&mut self, axis: Axis) -> Result<f64> {
        self.enter(ControllerCall::ReadOne(axis), "read_one")?;
        let now = Instant::now();
        let mut sim = self.sim.lock();
        let motor = sim.axis_mut(axis)?;
        self.advance_timed(motor, now);
        Ok(motor.position)
    }

    async fn pre_start_all(&mut self) -> Result<()> {
        self.enter(ControllerCall::PreStartAll, "pre_start_all")?;
        self.sim.lock().pending.clear();
        Ok(())
    }

    async fn pre_start_one(&mut self, axis: Axis, target: f64) -> Result<bool> {
        self.enter(ControllerCall::PreStartOne(axis, target), "pre_start_one")?;
        let mut sim = self.sim.lock();
        let motor = sim.axis_mut(axis)?;
        Ok(motor.power && !motor.refuse_pre_start)
    }

    async fn start_one(&mut self, axis: Axis, target: f64) -> Result<()> {
        self.enter(ControllerCall::StartOne(axis, target), "start_one")?;
        let mut sim = self.sim.lock();
        sim.axis_mut(axis)?;
        sim.pending.push((axis, target));
        Ok(())
    }

    async fn start_all(&mut self) -> Result<()> {
        self.enter(ControllerCall::StartAll, "start_all")?;
        self.latency().await;
        let now = Instant::now();
        let mut sim = self.sim.lock();
        let pending = std::mem::take(&mut sim.pending);
        for (axis, target) in pending {
            let motor = sim.axis_mut(axis)?;
            let from = motor.position;
            let duration =
                self.profile.motion_time(target - from) + self.timing.settling_time();
            tracing::debug!(axis, from, target, "DummyMotorController: motion started");
            if !self.mode.is_timed() && self.settle_polls == 0 {
                motor.position = target;
                motor.motion = None;
                motor.clamp();
                continue;
            }
            motor.motion = Some(Motion {
                from,
                to: target,
                polls_done: 0,
                polls_total: self.settle_polls,
                started: now,
                duration,
            });
        }
        Ok(())
    }

    async fn stop_one(&mut self, axis: Axis) -> Result<()> {
        self.enter(ControllerCall::StopOne(axis), "stop_one")?;
        self.halt(axis)?;
        Ok(())
    }

    async fn stop_all(&mut self) -> Result<()> {
        self.enter(ControllerCall::StopAll, "stop_all")?;
        Ok(())
    }

    async fn abort_one(&mut self, axis: Axis) -> Result<()> {
        self.enter(ControllerCall::AbortOne(axis), "abort_one")?;
        self.halt(axis)?;
        Ok(())
    }

    async fn abort_all(&mut self) -> Result<()> {
        self.enter(ControllerCall::AbortAll, "abort_all")?;
        Ok(())
    }

    async fn define_position(&mut self, axis: Axis, dial: f64) -> Result<()> {
        self.enter(ControllerCall::DefinePosition(axis, dial), "define_position")?;
        let mut sim = self.sim.lock();
        let motor = sim.axis_mut(axis)?;
        motor.position = dial;
        Ok(())
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for DummyMotorController with fluent API
pub struct DummyMotorControllerBuilder {
    initial_position: f64,
    profile: VelocityProfile,
    settle_polls: u32,
    lower_limit: f64,
    upper_limit: f64,
    hardware_backlash: bool,
    rounding: bool,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
}

impl DummyMotorControllerBuilder {
    pub fn new() -> Self {
        Self {
            initial_position: 0.0,
            profile: VelocityProfile::default(),
            settle_polls: 3,
            lower_limit: f64::NEG_INFINITY,
            upper_limit: f64::INFINITY,
            hardware_backlash: false,
            rounding: false,
            mode: MockMode::Instant,
            timing: TimingConfig::motor(),
            error_config: ErrorConfig::none(),
        }
    }

    /// Dial position of newly added axes
    pub fn initial_position(mut self, position: f64) -> Self {
        self.initial_position = position;
        self
    }

    pub fn velocity_profile(mut self, profile: VelocityProfile) -> Self {
        self.profile = profile;
        self
    }

    /// State polls a motion takes in instant mode (0 = completes on StartAll)
    pub fn settle_polls(mut self, polls: u32) -> Self {
        self.settle_polls = polls;
        self
    }

    /// Limit switch positions of newly added axes
    pub fn limits(mut self, lower: f64, upper: f64) -> Self {
        self.lower_limit = lower;
        self.upper_limit = upper;
        self
    }

    pub fn hardware_backlash(mut self, enabled: bool) -> Self {
        self.hardware_backlash = enabled;
        self
    }

    pub fn rounding(mut self, enabled: bool) -> Self {
        self.rounding = enabled;
        self
    }

    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    pub fn build(self) -> DummyMotorController {
        let mut features = ControllerFeatures::MOTOR | ControllerFeatures::DEFINE_POSITION;
        if self.hardware_backlash {
            features |= ControllerFeatures::BACKLASH;
        }
        if self.rounding {
            features |= ControllerFeatures::ROUNDING;
        }
        DummyMotorController {
            sim: Arc::new(Mutex::new(Sim {
                online: true,
                ..Default::default()
            })),
            calls: CallLog::default(),
            profile: self.profile,
            settle_polls: self.settle_polls,
            initial_position: self.initial_position,
            lower_limit: self.lower_limit,
            upper_limit: self.upper_limit,
            features,
            mode: self.mode,
            timing: self.timing,
            error_config: self.error_config,
        }
    }
}

impl Default for DummyMotorControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn poll(ctrl: &mut DummyMotorController, axis: Axis) -> StateInfo {
        ctrl.pre_state_all().await.unwrap();
        ctrl.state_all().await.unwrap();
        ctrl.state_one(axis).await.unwrap()
    }

    async fn start(ctrl: &mut DummyMotorController, axis: Axis, target: f64) {
        ctrl.pre_start_all().await.unwrap();
        assert!(ctrl.pre_start_one(axis, target).await.unwrap());
        ctrl.start_one(axis, target).await.unwrap();
        ctrl.start_all().await.unwrap();
    }

    #[test]
    fn test_velocity_profile_trapezoid() {
        let profile = VelocityProfile::symmetric(10.0, 20.0);
        // 0.5s accel (2.5), 0.5s decel (2.5), 0.5s cruise (5.0)
        let t = profile.motion_time(10.0);
        assert!((t.as_secs_f64() - 1.5).abs() < 1e-9);
        assert!((profile.travelled(10.0, Duration::from_millis(250)) - 0.625).abs() < 1e-9);
        assert!((profile.travelled(10.0, Duration::from_secs(1)) - 7.5).abs() < 1e-9);
        assert_eq!(profile.travelled(10.0, Duration::from_secs(5)), 10.0);
    }

    #[test]
    fn test_velocity_profile_triangle() {
        let profile = VelocityProfile::symmetric(10.0, 20.0);
        // 1.0 units never reaches max velocity: t = 2*sqrt(1/20)
        let t = profile.motion_time(1.0).as_secs_f64();
        assert!((t - 2.0 * (1.0f64 / 20.0).sqrt()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_instant_motion_completes_after_polls() {
        let mut ctrl = DummyMotorController::builder().settle_polls(3).build();
        ctrl.add_device(1).await.unwrap();
        start(&mut ctrl, 1, 9.0).await;

        assert_eq!(poll(&mut ctrl, 1).await.state, State::Moving);
        assert_eq!(ctrl.position(1), Some(3.0));
        assert_eq!(poll(&mut ctrl, 1).await.state, State::Moving);
        let info = poll(&mut ctrl, 1).await;
        assert_eq!(info.state, State::On);
        assert_eq!(ctrl.read_one(1).await.unwrap(), 9.0);
    }

    #[tokio::test]
    async fn test_unknown_axis_is_rejected() {
        let mut ctrl = DummyMotorController::new();
        let err = ctrl.state_one(4).await.unwrap_err();
        let inner = err.downcast_ref::<ControllerError>().unwrap();
        assert_eq!(inner.kind, ControllerErrorKind::InvalidAxis);
    }

    #[tokio::test]
    async fn test_refused_pre_start() {
        let mut ctrl = DummyMotorController::new();
        ctrl.add_device(1).await.unwrap();
        ctrl.refuse_pre_start(1);
        assert!(!ctrl.pre_start_one(1, 5.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_limit_switch_raises_alarm() {
        let mut ctrl = DummyMotorController::builder()
            .settle_polls(1)
            .limits(-5.0, 5.0)
            .build();
        ctrl.add_device(1).await.unwrap();
        start(&mut ctrl, 1, 20.0).await;
        let info = poll(&mut ctrl, 1).await;
        assert_eq!(info.state, State::Alarm);
        assert_eq!(info.limit_switches, limit_switches::UPPER);
        assert!(info.status_str().contains("upper limit"));
        assert_eq!(ctrl.position(1), Some(5.0));
    }

    #[tokio::test]
    async fn test_scripted_state_failure_recovers() {
        let mut ctrl = DummyMotorController::new();
        ctrl.add_device(1).await.unwrap();
        ctrl.fail_state_reads(1, 1);
        assert!(ctrl.state_one(1).await.is_err());
        assert_eq!(ctrl.state_one(1).await.unwrap().state, State::On);
    }

    #[tokio::test]
    async fn test_offline_fails_every_call() {
        let mut ctrl = DummyMotorController::new();
        ctrl.add_device(1).await.unwrap();
        ctrl.set_online(false);
        assert!(!ctrl.is_online());
        assert!(ctrl.read_one(1).await.is_err());
    }

    #[tokio::test]
    async fn test_abort_freezes_position() {
        let mut ctrl = DummyMotorController::builder().settle_polls(4).build();
        ctrl.add_device(1).await.unwrap();
        start(&mut ctrl, 1, 8.0).await;
        poll(&mut ctrl, 1).await;
        ctrl.abort_one(1).await.unwrap();
        let info = poll(&mut ctrl, 1).await;
        assert_eq!(info.state, State::On);
        assert_eq!(ctrl.position(1), Some(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_realistic_motion_follows_clock() {
        let mut ctrl = DummyMotorController::builder()
            .mode(MockMode::Realistic)
            .timing(TimingConfig::default())
            .build();
        ctrl.add_device(1).await.unwrap();
        start(&mut ctrl, 1, 10.0).await;
        assert_eq!(poll(&mut ctrl, 1).await.state, State::Moving);

        tokio::time::advance(Duration::from_secs(1)).await;
        let pos = ctrl.position(1).unwrap();
        assert!((pos - 7.5).abs() < 1e-6, "position {}", pos);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(poll(&mut ctrl, 1).await.state, State::On);
        assert_eq!(ctrl.position(1), Some(10.0));
    }

    #[tokio::test]
    async fn test_call_log_records_start_order() {
        let mut ctrl = DummyMotorController::new();
        ctrl.add_device(1).await.unwrap();
        let log = ctrl.calls();
        log.clear();
        start(&mut ctrl, 1, 1.0).await;
        assert_eq!(
            log.calls(),
            vec![
                ControllerCall::PreStartAll,
                ControllerCall::PreStartOne(1, 1.0),
                ControllerCall::StartOne(1, 1.0),
                ControllerCall::StartAll,
            ]
        );
    }

    #[test]
    fn test_config_features() {
        let config: DummyMotorConfig =
            toml::from_str("hardware_backlash = true\nsettle_polls = 1").unwrap();
        let ctrl = DummyMotorController::with_config(config);
        assert!(ctrl.features().contains(ControllerFeatures::BACKLASH));
        assert!(!ctrl.features().contains(ControllerFeatures::ROUNDING));
    }
}
