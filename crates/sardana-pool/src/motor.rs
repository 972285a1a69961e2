//! Motor element.
//!
//! A [`PoolMotor`] wraps one controller axis and converts between the raw
//! dial position the controller speaks and the user position clients see:
//!
//! ```text
//! user = sign * dial + offset
//! dial = (user - offset) / sign
//! ```
//!
//! Each motor owns a single-element [`PoolMotion`]; motor groups build their
//! own motion over all their members.

use crate::action::Action;
use crate::element::{ElementCore, PoolElement};
use crate::executor::WorkerPool;
use crate::motion::{MotionItems, MotionState, MotionTarget, PoolMotion};
use crate::pool_controller::PoolController;
use parking_lot::Mutex;
use sardana_core::{
    filters, limit_switches, Axis, ControllerFeatures, ElementId, ElementType, ErrorInfo,
    PoolConfig, PoolError, PoolResult, Propagate, SardanaAttribute, SardanaSoftwareAttribute,
    SardanaValue, State, StateInfo,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const EPSILON: f64 = 1e-16;

/// A motor bound to one axis of a motor controller.
pub struct PoolMotor {
    core: ElementCore,
    controller: Arc<PoolController>,
    axis: Axis,
    position: SardanaAttribute<f64>,
    dial_position: SardanaAttribute<f64>,
    offset: SardanaSoftwareAttribute<f64>,
    sign: SardanaSoftwareAttribute<f64>,
    backlash: SardanaSoftwareAttribute<f64>,
    step_per_unit: SardanaSoftwareAttribute<f64>,
    limit_switches: SardanaAttribute<u8>,
    dial_limits: Mutex<Option<(f64, f64)>>,
    instability_time: Mutex<Option<Duration>>,
    motion_state: Mutex<MotionState>,
    motion: Arc<PoolMotion>,
}

impl std::fmt::Debug for PoolMotor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolMotor")
            .field("name", &self.core.name())
            .field("controller", &self.controller.name())
            .field("axis", &self.axis)
            .field("state", &self.core.state())
            .finish()
    }
}

impl PoolElement for PoolMotor {
    fn core(&self) -> &ElementCore {
        &self.core
    }

    fn controller(&self) -> &Arc<PoolController> {
        &self.controller
    }

    fn axis(&self) -> Axis {
        self.axis
    }
}

impl PoolMotor {
    pub fn new(
        id: ElementId,
        name: impl Into<String>,
        controller: Arc<PoolController>,
        axis: Axis,
        worker_pool: WorkerPool,
        config: PoolConfig,
    ) -> PoolResult<Arc<Self>> {
        let core = ElementCore::new(id, name, ElementType::Motor);
        let events = Arc::clone(core.events());
        let motion = Arc::new(PoolMotion::new(
            format!("{}.motion", core.name()),
            worker_pool,
            config,
        ));
        let motor = Arc::new(Self {
            position: SardanaAttribute::new("position", Arc::clone(&events))
                .with_filter(filters::scalar_number),
            dial_position: SardanaAttribute::new("dial_position", Arc::clone(&events))
                .with_filter(filters::scalar_number),
            offset: SardanaSoftwareAttribute::new("offset", Arc::clone(&events), 0.0),
            sign: SardanaSoftwareAttribute::new("sign", Arc::clone(&events), 1.0),
            backlash: SardanaSoftwareAttribute::new("backlash", Arc::clone(&events), 0.0),
            step_per_unit: SardanaSoftwareAttribute::new("step_per_unit", Arc::clone(&events), 1.0),
            limit_switches: SardanaAttribute::new("limit_switches", events)
                .with_filter(filters::not_equal::<u8>)
                .with_initial_value(0),
            dial_limits: Mutex::new(None),
            instability_time: Mutex::new(None),
            motion_state: Mutex::new(MotionState::Stopped),
            motion,
            core,
            controller,
            axis,
        });
        motor.motion.core().add_element(&motor)?;
        Ok(motor)
    }

    pub fn motion(&self) -> &Arc<PoolMotion> {
        &self.motion
    }

    // -------------------------------------------------------------------------
    // Calibration
    // -------------------------------------------------------------------------

    pub fn offset(&self) -> f64 {
        self.offset.value()
    }

    /// Changing the offset moves the user position, so it is re-pushed.
    pub fn set_offset(&self, offset: f64, propagate: Propagate) {
        self.offset.set_write_value(offset, propagate);
        self.refresh_user_position(propagate);
    }

    pub fn sign(&self) -> f64 {
        self.sign.value()
    }

    pub fn set_sign(&self, sign: f64, propagate: Propagate) -> PoolResult<()> {
        if sign != 1.0 && sign != -1.0 {
            return Err(PoolError::InvalidParameter(format!(
                "sign must be 1 or -1, got {}",
                sign
            )));
        }
        self.sign.set_write_value(sign, propagate);
        self.refresh_user_position(propagate);
        Ok(())
    }

    pub fn backlash(&self) -> f64 {
        self.backlash.value()
    }

    pub fn set_backlash(&self, backlash: f64, propagate: Propagate) {
        self.backlash.set_write_value(backlash, propagate);
    }

    pub fn step_per_unit(&self) -> f64 {
        self.step_per_unit.value()
    }

    pub fn set_step_per_unit(&self, step_per_unit: f64, propagate: Propagate) -> PoolResult<()> {
        if step_per_unit == 0.0 || !step_per_unit.is_finite() {
            return Err(PoolError::InvalidParameter(format!(
                "step_per_unit must be finite and non-zero, got {}",
                step_per_unit
            )));
        }
        self.step_per_unit.set_write_value(step_per_unit, propagate);
        Ok(())
    }

    pub fn dial_limits(&self) -> Option<(f64, f64)> {
        *self.dial_limits.lock()
    }

    /// Software limits on the dial target; `None` disables them.
    pub fn set_dial_limits(&self, limits: Option<(f64, f64)>) -> PoolResult<()> {
        if let Some((low, high)) = limits {
            if low > high {
                return Err(PoolError::InvalidParameter(format!(
                    "lower limit {} is above upper limit {}",
                    low, high
                )));
            }
        }
        *self.dial_limits.lock() = limits;
        Ok(())
    }

    pub fn instability_time(&self) -> Option<Duration> {
        *self.instability_time.lock()
    }

    /// Settling time waited after the hardware reports the motor stopped.
    pub fn set_instability_time(&self, wait: Option<Duration>) {
        *self.instability_time.lock() = wait.filter(|d| !d.is_zero());
    }

    pub fn user_from_dial(&self, dial: f64) -> f64 {
        self.sign() * dial + self.offset()
    }

    pub fn dial_from_user(&self, user: f64) -> f64 {
        (user - self.offset()) / self.sign()
    }

    // -------------------------------------------------------------------------
    // Position
    // -------------------------------------------------------------------------

    pub fn position_attribute(&self) -> &SardanaAttribute<f64> {
        &self.position
    }

    pub fn dial_position_attribute(&self) -> &SardanaAttribute<f64> {
        &self.dial_position
    }

    /// Last user position, if one was ever read.
    pub fn cached_position(&self) -> Option<f64> {
        self.position.get_value()
    }

    /// User position. With `cache == false` (or nothing cached yet) the dial is
    /// read from the controller first and pushed with `propagate`.
    pub async fn get_position(&self, cache: bool, propagate: Propagate) -> PoolResult<f64> {
        if (!cache || !self.position.has_value()) && !self.core.simulation_mode() {
            let dial = self.read_dial_position().await?;
            self.put_dial_position(dial, propagate);
        }
        let value = self
            .position
            .get_value_obj()
            .ok_or_else(|| PoolError::ValueError {
                element: self.name().to_string(),
                message: "position was never read".to_string(),
            })?;
        value.into_result().map_err(|e| PoolError::ValueError {
            element: self.name().to_string(),
            message: e.to_string(),
        })
    }

    async fn read_dial_position(&self) -> PoolResult<SardanaValue<f64>> {
        let only: BTreeSet<ElementId> = [self.id()].into_iter().collect();
        let mut values = self.motion.core().read_value_of(Some(&only), true).await?;
        values.remove(&self.id()).ok_or_else(|| PoolError::ValueError {
            element: self.name().to_string(),
            message: "controller returned no value".to_string(),
        })
    }

    /// Stores a freshly read dial position and derives the user position.
    pub fn put_dial_position(&self, dial: SardanaValue<f64>, propagate: Propagate) {
        let timestamp = dial.timestamp();
        match dial.value().copied() {
            Some(raw) => {
                self.dial_position.set_value_at(raw, timestamp, propagate);
                self.position
                    .set_value_at(self.user_from_dial(raw), timestamp, propagate);
            }
            None => {
                let error = dial
                    .error()
                    .cloned()
                    .unwrap_or_else(|| ErrorInfo::new("dial position unavailable"));
                self.dial_position.set_error(error.clone(), propagate);
                self.position.set_error(error, propagate);
            }
        }
    }

    fn refresh_user_position(&self, propagate: Propagate) {
        if let Some(dial) = self.dial_position.get_value() {
            if !self.dial_position.in_error() {
                self.position.set_value(self.user_from_dial(dial), propagate);
            }
        }
    }

    // -------------------------------------------------------------------------
    // State
    // -------------------------------------------------------------------------

    pub fn motion_state(&self) -> MotionState {
        *self.motion_state.lock()
    }

    pub fn set_motion_state(&self, state: MotionState) {
        *self.motion_state.lock() = state;
    }

    /// Limit switches as seen in user coordinates.
    pub fn limit_switches(&self) -> u8 {
        self.limit_switches.get_value().unwrap_or(0)
    }

    pub fn limit_switches_attribute(&self) -> &SardanaAttribute<u8> {
        &self.limit_switches
    }

    /// Applied when the start is committed: motion state and element state go
    /// to Moving and the state event is forced.
    pub fn begin_motion(&self) {
        self.set_motion_state(MotionState::Moving);
        self.core.set_state(State::Moving, Propagate::Force);
        self.core
            .set_status(self.build_status(State::Moving, None), Propagate::Normal);
    }

    /// Applies a state read from the controller.
    pub fn set_state_info(&self, info: &StateInfo, propagate: Propagate) {
        let state = if info.error {
            info.state
        } else {
            self.motion_state().to_state(info.state)
        };
        let switches = if self.sign() < 0.0 {
            swap_upper_lower(info.limit_switches)
        } else {
            info.limit_switches
        };
        self.limit_switches.set_value(switches, propagate);
        let status = self.build_status(state, info.status.as_deref());
        self.core.set_status(status, propagate);
        self.core.set_state(state, propagate);
    }

    fn build_status(&self, state: State, ctrl_status: Option<&str>) -> String {
        let mut status = format!("{} is ", self.name());
        match state {
            State::On => status.push_str("Stopped"),
            State::Moving => {
                status.push_str("Moving");
                match self.motion_state() {
                    MotionState::MovingBacklash => status.push_str(" (backlash)"),
                    MotionState::MovingInstability => status.push_str(" (instability)"),
                    _ if !self.core.is_in_operation() => status.push_str(" (external)"),
                    _ => {}
                }
            }
            other => {
                status.push_str("in ");
                status.push_str(other.as_str());
            }
        }
        let switches = self.limit_switches();
        if switches & limit_switches::HOME != 0 {
            status.push_str(". Hit home switch");
        }
        if switches & limit_switches::UPPER != 0 {
            status.push_str(". Hit upper switch");
        }
        if switches & limit_switches::LOWER != 0 {
            status.push_str(". Hit lower switch");
        }
        if let Some(ctrl_status) = ctrl_status.filter(|s| !s.is_empty()) {
            status.push('\n');
            status.push_str(ctrl_status);
        }
        status
    }

    // -------------------------------------------------------------------------
    // Motion
    // -------------------------------------------------------------------------

    /// Computes the dial target (and backlash pass) for a move to `user`.
    pub fn calculate_motion(&self, user: f64) -> PoolResult<MotionTarget> {
        let backlash = self.backlash();
        let step_per_unit = self.step_per_unit();
        let mut dial = self.dial_from_user(user);
        let mut do_backlash = false;

        if backlash != 0.0 && !self.controller.has_feature(ControllerFeatures::BACKLASH) {
            if self.dial_position.in_error() {
                return Err(PoolError::ValueError {
                    element: self.name().to_string(),
                    message: "cannot compute backlash: dial position is in error".to_string(),
                });
            }
            let current = self.dial_position.get_value().ok_or_else(|| {
                PoolError::ValueError {
                    element: self.name().to_string(),
                    message: "cannot compute backlash: dial position was never read".to_string(),
                }
            })?;
            let displacement = dial - current;
            if displacement.abs() > EPSILON && (backlash > 0.0) != (displacement > 0.0) {
                do_backlash = true;
                dial -= backlash / step_per_unit;
            }
        }

        if self.controller.has_feature(ControllerFeatures::ROUNDING) {
            dial = (dial * step_per_unit).round() / step_per_unit;
        }

        let backlash_position = if do_backlash {
            dial + backlash / step_per_unit
        } else {
            dial
        };

        if let Some((low, high)) = self.dial_limits() {
            let checked = [dial, backlash_position];
            if checked.iter().any(|d| *d < low || *d > high) {
                return Err(PoolError::InvalidParameter(format!(
                    "{}: dial target {} is outside limits [{}, {}]",
                    self.name(),
                    dial,
                    low,
                    high
                )));
            }
        }

        Ok(MotionTarget {
            position: user,
            dial_position: dial,
            do_backlash,
            backlash_position,
        })
    }

    /// Moves to the user position `user` and returns once the motion started.
    pub async fn start_move(&self, user: f64) -> PoolResult<()> {
        if !self.core.simulation_mode() {
            self.get_position(false, Propagate::Normal).await?;
        }
        let target = self.calculate_motion(user)?;
        debug!(
            element = %self.name(),
            user,
            dial = target.dial_position,
            backlash = target.do_backlash,
            "starting move"
        );
        self.position.set_write_value(user, Propagate::Suppress);
        if self.core.simulation_mode() {
            return Ok(());
        }
        let items: MotionItems = [(self.id(), target)].into_iter().collect();
        Arc::clone(&self.motion).run(items, false).await
    }

    /// Moves and waits for the motion to finish.
    pub async fn move_to(&self, user: f64) -> PoolResult<()> {
        self.start_move(user).await?;
        self.motion.core().wait_finished().await;
        Ok(())
    }

    pub async fn stop(&self) -> PoolResult<()> {
        self.motion.core().stop(Some(self)).await
    }

    pub async fn abort(&self) -> PoolResult<()> {
        self.motion.core().abort(Some(self)).await
    }

    /// Redefines the current user position without moving.
    pub async fn define_position(&self, user: f64) -> PoolResult<()> {
        let dial = self.dial_from_user(user);
        self.controller.define_position(self.axis, dial).await?;
        self.get_position(false, Propagate::Force).await?;
        Ok(())
    }
}

fn swap_upper_lower(switches: u8) -> u8 {
    let mut swapped = switches & limit_switches::HOME;
    if switches & limit_switches::UPPER != 0 {
        swapped |= limit_switches::LOWER;
    }
    if switches & limit_switches::LOWER != 0 {
        swapped |= limit_switches::UPPER;
    }
    swapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use sardana_core::{ControllerId, RecordingListener};
    use sardana_driver_mock::DummyMotorController;
    use tokio::runtime::Handle;

    async fn motor_with(mock: DummyMotorController) -> Arc<PoolMotor> {
        let controller = Arc::new(PoolController::new(
            ControllerId(1),
            "motctrl01",
            Box::new(mock),
        ));
        controller.add_axis(1).await.unwrap();
        PoolMotor::new(
            ElementId(10),
            "mot01",
            controller,
            1,
            WorkerPool::inline(Handle::current()),
            PoolConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_user_dial_conversion() {
        let motor = motor_with(DummyMotorController::new()).await;
        motor.set_offset(2.0, Propagate::Suppress);
        motor.set_sign(-1.0, Propagate::Suppress).unwrap();
        assert_eq!(motor.user_from_dial(3.0), -1.0);
        assert_eq!(motor.dial_from_user(-1.0), 3.0);
        assert!(motor.set_sign(2.0, Propagate::Suppress).is_err());
    }

    #[tokio::test]
    async fn test_get_position_reads_dial() {
        let mock = DummyMotorController::builder().initial_position(4.0).build();
        let motor = motor_with(mock).await;
        motor.set_offset(1.0, Propagate::Suppress);
        assert_eq!(motor.get_position(false, Propagate::Normal).await.unwrap(), 5.0);
        assert_eq!(motor.dial_position_attribute().get_value(), Some(4.0));
    }

    #[tokio::test]
    async fn test_backlash_when_moving_against_it() {
        let motor = motor_with(DummyMotorController::new()).await;
        motor.get_position(false, Propagate::Normal).await.unwrap();
        motor.set_backlash(0.5, Propagate::Suppress);

        let down = motor.calculate_motion(-2.0).unwrap();
        assert!(down.do_backlash);
        assert_eq!(down.dial_position, -2.5);
        assert_eq!(down.backlash_position, -2.0);

        let up = motor.calculate_motion(2.0).unwrap();
        assert!(!up.do_backlash);
        assert_eq!(up.dial_position, 2.0);
    }

    #[tokio::test]
    async fn test_hardware_backlash_disables_pool_pass() {
        let mock = DummyMotorController::builder().hardware_backlash(true).build();
        let motor = motor_with(mock).await;
        motor.set_backlash(0.5, Propagate::Suppress);
        assert!(!motor.calculate_motion(-2.0).unwrap().do_backlash);
    }

    #[tokio::test]
    async fn test_rounding_to_steps() {
        let mock = DummyMotorController::builder().rounding(true).build();
        let motor = motor_with(mock).await;
        motor.set_step_per_unit(10.0, Propagate::Suppress).unwrap();
        assert_eq!(motor.calculate_motion(1.234).unwrap().dial_position, 1.2);
    }

    #[tokio::test]
    async fn test_dial_limits_reject_target() {
        let motor = motor_with(DummyMotorController::new()).await;
        motor.set_dial_limits(Some((-1.0, 1.0))).unwrap();
        assert!(matches!(
            motor.calculate_motion(5.0),
            Err(PoolError::InvalidParameter(_))
        ));
        assert!(motor.set_dial_limits(Some((1.0, -1.0))).is_err());
    }

    #[tokio::test]
    async fn test_status_text_and_switch_swap() {
        let motor = motor_with(DummyMotorController::new()).await;
        motor.set_sign(-1.0, Propagate::Suppress).unwrap();
        let info = StateInfo::new(State::Alarm)
            .with_status("limit reached")
            .with_limit_switches(limit_switches::UPPER);
        motor.set_state_info(&info, Propagate::Normal);
        assert_eq!(motor.limit_switches(), limit_switches::LOWER);
        assert_eq!(
            motor.core().status(),
            "mot01 is in Alarm. Hit lower switch\nlimit reached"
        );

        motor.set_state_info(&StateInfo::new(State::On), Propagate::Normal);
        assert_eq!(motor.core().status(), "mot01 is Stopped");
    }

    #[tokio::test]
    async fn test_external_motion_status() {
        let motor = motor_with(DummyMotorController::new()).await;
        motor.set_state_info(&StateInfo::new(State::Moving), Propagate::Normal);
        assert_eq!(motor.core().status(), "mot01 is Moving (external)");
    }

    #[tokio::test]
    async fn test_move_to_reaches_target() {
        let motor = motor_with(DummyMotorController::builder().settle_polls(2).build()).await;
        let recorder = Arc::new(RecordingListener::default());
        motor.core().add_listener(&recorder);
        motor.move_to(3.0).await.unwrap();
        assert_eq!(motor.cached_position(), Some(3.0));
        assert_eq!(motor.core().state(), State::On);
        assert!(!motor.core().is_in_operation());
        assert_eq!(motor.position_attribute().get_write_value(), Some(3.0));
        let states: Vec<_> = recorder
            .events_named("state")
            .iter()
            .filter_map(|e| e.value.as_state())
            .collect();
        assert_eq!(states.first(), Some(&State::Moving));
        assert_eq!(states.last(), Some(&State::On));
    }

    #[tokio::test]
    async fn test_simulation_mode_skips_hardware() {
        let mock = DummyMotorController::new();
        let handle = mock.clone();
        let motor = motor_with(mock).await;
        motor.core().set_simulation_mode(true);
        handle.calls().clear();
        motor.start_move(7.0).await.unwrap();
        assert!(handle.calls().calls().is_empty());
        assert_eq!(motor.position_attribute().get_write_value(), Some(7.0));
    }
}
