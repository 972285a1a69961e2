//! Simultaneous multi-axis motion.
//!
//! [`PoolMotion`] starts a move of any set of motors, possibly spread over
//! several controllers, with a strict call order every driver can rely on:
//!
//! ```text
//! PreStartAll (per controller)
//! PreStartOne (per axis)       any false: nothing is started
//! StartOne    (per axis)
//! state -> Moving (per motor, forced event)
//! StartAll    (per controller)
//! ```
//!
//! The loop then polls states until every motor has settled, applying the
//! per-motor [`PoolMotionItem`] state machine on each poll. A settled motor
//! reports its final position exactly once, from a fresh read.

use crate::action::{Action, PoolAction};
use crate::element::PoolElement;
use crate::executor::WorkerPool;
use crate::motor::PoolMotor;
use crate::pool_controller::PoolController;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sardana_core::{
    ControllerId, ElementId, PoolConfig, PoolError, PoolResult, Propagate, State, StateInfo,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Motion-level state of one motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    Stopped,
    Moving,
    MovingBacklash,
    MovingInstability,
    Invalid,
}

impl MotionState {
    pub fn is_moving(self) -> bool {
        matches!(
            self,
            MotionState::Moving | MotionState::MovingBacklash | MotionState::MovingInstability
        )
    }

    /// Element state to show for this motion state given the controller state.
    pub fn to_state(self, ctrl_state: State) -> State {
        match self {
            MotionState::Moving | MotionState::MovingBacklash | MotionState::MovingInstability => {
                State::Moving
            }
            MotionState::Invalid => State::Invalid,
            MotionState::Stopped => ctrl_state,
        }
    }
}

/// Where one motor goes: user and dial target plus the pending backlash pass.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionTarget {
    pub position: f64,
    pub dial_position: f64,
    pub do_backlash: bool,
    pub backlash_position: f64,
}

impl MotionTarget {
    /// A target with no backlash correction.
    pub fn direct(position: f64, dial_position: f64) -> Self {
        Self {
            position,
            dial_position,
            do_backlash: false,
            backlash_position: dial_position,
        }
    }
}

/// Targets of one motion, keyed by motor id.
pub type MotionItems = BTreeMap<ElementId, MotionTarget>;

/// Per-motor bookkeeping of one motion.
#[derive(Debug, Clone)]
pub struct PoolMotionItem {
    pub target: MotionTarget,
    instability_time: Option<Duration>,
    old_motion_state: MotionState,
    motion_state: MotionState,
    last_state: State,
    start_time: Option<Instant>,
    stop_time: Option<Instant>,
    read_errors: u32,
}

impl PoolMotionItem {
    pub fn new(target: MotionTarget, instability_time: Option<Duration>) -> Self {
        Self {
            target,
            instability_time,
            old_motion_state: MotionState::Invalid,
            motion_state: MotionState::Stopped,
            last_state: State::On,
            start_time: None,
            stop_time: None,
            read_errors: 0,
        }
    }

    pub fn motion_state(&self) -> MotionState {
        self.motion_state
    }

    pub fn old_motion_state(&self) -> MotionState {
        self.old_motion_state
    }

    pub fn in_motion(&self) -> bool {
        self.motion_state.is_moving()
    }

    /// Time since the hardware start was committed.
    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        self.start_time
            .map(|start| now.saturating_duration_since(start))
    }

    /// Applied when the start is committed.
    pub fn start(&mut self, now: Instant) {
        self.start_time = Some(now);
        self.last_state = State::Moving;
        self.old_motion_state = self.motion_state;
        self.motion_state = MotionState::Moving;
    }

    fn stopped(&mut self, now: Instant) -> MotionState {
        self.stop_time = Some(now);
        if self.instability_time.is_some() {
            MotionState::MovingInstability
        } else {
            MotionState::Stopped
        }
    }

    fn handle_instability(&mut self, now: Instant) -> MotionState {
        let settled = match (self.stop_time, self.instability_time) {
            (Some(stop), Some(wait)) => now.saturating_duration_since(stop) >= wait,
            _ => true,
        };
        if settled {
            MotionState::Stopped
        } else {
            MotionState::MovingInstability
        }
    }

    /// Feeds one observed controller state. Returns `(old, new)` motion state.
    pub fn on_state_switch(
        &mut self,
        state: State,
        interrupted: bool,
        now: Instant,
    ) -> (MotionState, MotionState) {
        let ms = self.motion_state;
        let mut new_ms = ms;

        if interrupted {
            if ms == MotionState::MovingInstability {
                new_ms = self.handle_instability(now);
            } else if state == State::Moving {
                new_ms = MotionState::Moving;
            } else if ms.is_moving() {
                new_ms = self.stopped(now);
            }
        } else {
            match ms {
                MotionState::Stopped | MotionState::Invalid => {
                    if state == State::Moving {
                        self.start_time = Some(now);
                        new_ms = MotionState::Moving;
                    }
                }
                MotionState::Moving => {
                    if state != State::Moving {
                        new_ms = if self.target.do_backlash && state == State::On {
                            MotionState::MovingBacklash
                        } else {
                            self.stopped(now)
                        };
                    }
                }
                MotionState::MovingBacklash => {
                    if state != State::Moving {
                        new_ms = self.stopped(now);
                    }
                }
                MotionState::MovingInstability => {
                    new_ms = self.handle_instability(now);
                }
            }
        }

        self.last_state = state;
        self.old_motion_state = ms;
        self.motion_state = new_ms;
        (ms, new_ms)
    }
}

/// Corrective pass issued when a motor that needs backlash has settled.
#[async_trait]
pub trait BacklashStrategy: Send + Sync {
    async fn correct(&self, motor: &PoolMotor, target: &MotionTarget) -> PoolResult<()>;
}

/// Moves the motor on to `backlash_position` with a single-axis start.
#[derive(Debug, Default, Clone, Copy)]
pub struct MoveToBacklashPosition;

#[async_trait]
impl BacklashStrategy for MoveToBacklashPosition {
    async fn correct(&self, motor: &PoolMotor, target: &MotionTarget) -> PoolResult<()> {
        motor
            .controller()
            .move_axes(&[(motor.name(), motor.axis(), target.backlash_position)])
            .await
    }
}

type ControllerBatch = (Arc<PoolController>, Vec<(Arc<PoolMotor>, MotionTarget)>);

/// Motion action of a motor or of a motor group.
pub struct PoolMotion {
    core: PoolAction<PoolMotor>,
    items: Mutex<BTreeMap<ElementId, PoolMotionItem>>,
    backlash: RwLock<Arc<dyn BacklashStrategy>>,
}

impl std::fmt::Debug for PoolMotion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolMotion")
            .field("core", &self.core)
            .field("items", &self.items.lock().len())
            .finish()
    }
}

impl PoolMotion {
    pub fn new(name: impl Into<String>, worker_pool: WorkerPool, config: PoolConfig) -> Self {
        Self {
            core: PoolAction::new(name, worker_pool, config),
            items: Mutex::new(BTreeMap::new()),
            backlash: RwLock::new(Arc::new(MoveToBacklashPosition)),
        }
    }

    pub fn set_backlash_strategy(&self, strategy: Arc<dyn BacklashStrategy>) {
        *self.backlash.write() = strategy;
    }

    /// Motion state of a motor in the current (or last) run.
    pub fn motion_state_of(&self, id: ElementId) -> Option<MotionState> {
        self.items.lock().get(&id).map(PoolMotionItem::motion_state)
    }

    fn group_by_controller(&self, items: MotionItems) -> PoolResult<Vec<ControllerBatch>> {
        let mut batches: BTreeMap<ControllerId, ControllerBatch> = BTreeMap::new();
        for (id, target) in items {
            let motor = self
                .core
                .get_element(id)
                .ok_or_else(|| PoolError::ElementNotFound(id.to_string()))?;
            let controller = Arc::clone(motor.controller());
            batches
                .entry(controller.id())
                .or_insert_with(|| (controller, Vec::new()))
                .1
                .push((motor, target));
        }
        Ok(batches.into_values().collect())
    }

    async fn emergency_break_batches(&self, batches: &[ControllerBatch]) {
        for (controller, members) in batches {
            let axes: Vec<_> = members.iter().map(|(motor, _)| motor.axis()).collect();
            if let Err(e) = controller.emergency_break(&axes).await {
                error!(
                    action = %self.core.name(),
                    controller = %controller.name(),
                    error = %format!("{:#}", e),
                    "emergency break failed"
                );
            }
        }
    }

    async fn push_positions(&self, ids: &BTreeSet<ElementId>, propagate: Propagate) {
        match self.core.read_value_of(Some(ids), false).await {
            Ok(values) => {
                for (id, value) in values {
                    if let Some(motor) = self.core.get_element(id) {
                        motor.put_dial_position(value, propagate);
                    }
                }
            }
            Err(e) => warn!(action = %self.core.name(), error = %e, "position read failed"),
        }
    }

    /// Final position, operation release and final state of one motor.
    async fn settle(&self, motor: &PoolMotor, info: &StateInfo) {
        motor.set_motion_state(MotionState::Stopped);
        motor.set_state_info(info, Propagate::Suppress);
        if let Err(e) = motor.get_position(false, Propagate::Force).await {
            warn!(element = %motor.name(), error = %e, "final position read failed");
        }
        self.core.release_operation(motor.id());
        motor.set_state_info(info, Propagate::Force);
        debug!(element = %motor.name(), state = %motor.core().state(), "motion ended");
    }

    fn update_item<R>(&self, id: ElementId, f: impl FnOnce(&mut PoolMotionItem) -> R) -> Option<R> {
        self.items.lock().get_mut(&id).map(f)
    }
}

#[async_trait]
impl Action for PoolMotion {
    type Element = PoolMotor;
    type Items = MotionItems;

    fn core(&self) -> &PoolAction<PoolMotor> {
        &self.core
    }

    fn involved(&self, items: &MotionItems) -> PoolResult<Vec<Arc<PoolMotor>>> {
        items
            .keys()
            .map(|id| {
                self.core
                    .get_element(*id)
                    .ok_or_else(|| PoolError::ElementNotFound(id.to_string()))
            })
            .collect()
    }

    #[tracing::instrument(skip_all, fields(action = %self.core.name(), motors = items.len()))]
    async fn start_action(&self, items: MotionItems) -> PoolResult<()> {
        let batches = self.group_by_controller(items)?;
        for (controller, _) in &batches {
            controller.check_online()?;
        }

        {
            let mut motion_items = self.items.lock();
            motion_items.clear();
            for (_, members) in &batches {
                for (motor, target) in members {
                    motion_items.insert(
                        motor.id(),
                        PoolMotionItem::new(target.clone(), motor.instability_time()),
                    );
                }
            }
        }

        // controllers are always locked in id order
        let mut drivers = Vec::with_capacity(batches.len());
        for (controller, _) in &batches {
            drivers.push(controller.lock().await);
        }

        for ((controller, _), driver) in batches.iter().zip(drivers.iter_mut()) {
            debug!(controller = %controller.name(), "PreStartAll");
            driver
                .pre_start_all()
                .await
                .map_err(|e| PoolError::driver(controller.name(), "PreStartAll", e))?;
        }

        for ((controller, members), driver) in batches.iter().zip(drivers.iter_mut()) {
            for (motor, target) in members {
                let accepted = driver
                    .pre_start_one(motor.axis(), target.dial_position)
                    .await
                    .map_err(|e| PoolError::driver(controller.name(), "PreStartOne", e))?;
                if !accepted {
                    return Err(PoolError::PreStartOneFailed {
                        controller: controller.name().to_string(),
                        element: motor.name().to_string(),
                        axis: motor.axis(),
                        target: target.dial_position,
                    });
                }
            }
        }

        let mut failure = None;
        'start: for ((controller, members), driver) in batches.iter().zip(drivers.iter_mut()) {
            for (motor, target) in members {
                debug!(
                    controller = %controller.name(),
                    element = %motor.name(),
                    axis = motor.axis(),
                    dial = target.dial_position,
                    "StartOne"
                );
                if let Err(e) = driver.start_one(motor.axis(), target.dial_position).await {
                    failure = Some(PoolError::driver(controller.name(), "StartOne", e));
                    break 'start;
                }
            }
        }
        if let Some(err) = failure {
            drop(drivers);
            self.emergency_break_batches(&batches).await;
            return Err(err);
        }

        let now = Instant::now();
        for (_, members) in &batches {
            for (motor, _) in members {
                self.update_item(motor.id(), |item| item.start(now));
                motor.begin_motion();
            }
        }

        for ((controller, _), driver) in batches.iter().zip(drivers.iter_mut()) {
            debug!(controller = %controller.name(), "StartAll");
            if let Err(e) = driver.start_all().await {
                failure = Some(PoolError::driver(controller.name(), "StartAll", e));
                break;
            }
        }
        drop(drivers);

        if let Some(err) = failure {
            self.emergency_break_batches(&batches).await;
            let ids: BTreeSet<ElementId> = batches
                .iter()
                .flat_map(|(_, members)| members.iter().map(|(motor, _)| motor.id()))
                .collect();
            let states = self.core.read_state_info_of(Some(&ids), true).await;
            for (_, members) in &batches {
                for (motor, _) in members {
                    motor.set_motion_state(MotionState::Stopped);
                    if let Some(info) = states.get(&motor.id()) {
                        motor.set_state_info(info, Propagate::Force);
                    }
                }
            }
            return Err(err);
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(action = %self.core.name()))]
    async fn action_loop(self: Arc<Self>) -> PoolResult<()> {
        let config = self.core.config().clone();
        let per_position = u64::from(config.motion_loop_states_per_position.max(1));
        let mut in_flight: BTreeSet<ElementId> = self.items.lock().keys().copied().collect();

        // motion started: immediate position event
        self.push_positions(&in_flight, Propagate::Force).await;

        let mut iteration: u64 = 0;
        while !in_flight.is_empty() {
            let states = self.core.read_state_info_of(Some(&in_flight), false).await;
            let now = Instant::now();

            for (id, info) in states {
                let Some(motor) = self.core.get_element(id) else {
                    in_flight.remove(&id);
                    continue;
                };

                if info.error {
                    let errors = self
                        .update_item(id, |item| {
                            item.read_errors += 1;
                            item.read_errors
                        })
                        .unwrap_or(u32::MAX);
                    if errors >= config.max_consecutive_read_errors {
                        error!(element = %motor.name(), errors, "giving up on motor after repeated state read errors");
                        self.settle(&motor, &info).await;
                        in_flight.remove(&id);
                    } else {
                        motor.set_state_info(&info, Propagate::Normal);
                    }
                    continue;
                }

                let interrupted = motor.core().was_interrupted();
                let Some((old_ms, new_ms, target)) = self.update_item(id, |item| {
                    item.read_errors = 0;
                    let (old_ms, new_ms) = item.on_state_switch(info.state, interrupted, now);
                    (old_ms, new_ms, item.target.clone())
                }) else {
                    in_flight.remove(&id);
                    continue;
                };
                motor.set_motion_state(new_ms);

                let start_backlash =
                    new_ms == MotionState::MovingBacklash && old_ms != MotionState::MovingBacklash;
                let start_instability = new_ms == MotionState::MovingInstability
                    && old_ms != MotionState::MovingInstability;
                let stopped_now = !new_ms.is_moving() && old_ms.is_moving();

                if start_backlash {
                    debug!(element = %motor.name(), "starting backlash");
                    if let Err(e) = motor.get_position(false, Propagate::Force).await {
                        warn!(element = %motor.name(), error = %e, "position read failed");
                    }
                    let strategy = Arc::clone(&*self.backlash.read());
                    if let Err(e) = strategy.correct(&motor, &target).await {
                        warn!(element = %motor.name(), error = %e, "backlash correction failed");
                    }
                    motor.set_state_info(&info, Propagate::Normal);
                } else if start_instability {
                    debug!(element = %motor.name(), "waiting for instability time");
                    if let Err(e) = motor.get_position(false, Propagate::Force).await {
                        warn!(element = %motor.name(), error = %e, "position read failed");
                    }
                    motor.set_state_info(&info, Propagate::Normal);
                } else if stopped_now {
                    self.settle(&motor, &info).await;
                    in_flight.remove(&id);
                } else {
                    motor.set_state_info(&info, Propagate::Normal);
                }
            }

            if in_flight.is_empty() {
                break;
            }

            if self.core.interrupt_expired() {
                warn!(
                    action = %self.core.name(),
                    remaining = in_flight.len(),
                    "motors did not settle after stop/abort, giving up"
                );
                let states = self.core.read_state_info_of(Some(&in_flight), true).await;
                for (id, info) in states {
                    if let Some(motor) = self.core.get_element(id) {
                        self.settle(&motor, &info).await;
                    }
                }
                break;
            }

            iteration += 1;
            if iteration % per_position == 0 {
                self.push_positions(&in_flight, Propagate::Normal).await;
            }

            sleep(config.motion_loop_sleep()).await;
        }

        info!(action = %self.core.name(), "motion finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(do_backlash: bool, instability: Option<Duration>) -> PoolMotionItem {
        let mut target = MotionTarget::direct(10.0, 10.0);
        target.do_backlash = do_backlash;
        PoolMotionItem::new(target, instability)
    }

    #[test]
    fn test_motion_state_mapping() {
        assert_eq!(MotionState::MovingBacklash.to_state(State::On), State::Moving);
        assert_eq!(MotionState::Stopped.to_state(State::Alarm), State::Alarm);
        assert_eq!(MotionState::Invalid.to_state(State::On), State::Invalid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_motion_stops() {
        let mut item = item(false, None);
        let now = Instant::now();
        item.start(now);
        assert_eq!(
            item.on_state_switch(State::Moving, false, now),
            (MotionState::Moving, MotionState::Moving)
        );
        assert_eq!(
            item.on_state_switch(State::On, false, now),
            (MotionState::Moving, MotionState::Stopped)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlash_pass_then_stop() {
        let mut item = item(true, None);
        let now = Instant::now();
        item.start(now);
        assert_eq!(
            item.on_state_switch(State::On, false, now).1,
            MotionState::MovingBacklash
        );
        assert_eq!(
            item.on_state_switch(State::Moving, false, now).1,
            MotionState::MovingBacklash
        );
        assert_eq!(
            item.on_state_switch(State::On, false, now).1,
            MotionState::Stopped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlash_skipped_on_alarm() {
        let mut item = item(true, None);
        let now = Instant::now();
        item.start(now);
        assert_eq!(
            item.on_state_switch(State::Alarm, false, now).1,
            MotionState::Stopped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_motion_skips_backlash() {
        let mut item = item(true, None);
        let now = Instant::now();
        item.start(now);
        item.on_state_switch(State::Moving, true, now);
        assert_eq!(
            item.on_state_switch(State::On, true, now).1,
            MotionState::Stopped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_instability_wait() {
        let wait = Duration::from_millis(100);
        let mut item = item(false, Some(wait));
        let start = Instant::now();
        item.start(start);
        assert_eq!(
            item.on_state_switch(State::On, false, start).1,
            MotionState::MovingInstability
        );
        assert_eq!(
            item.on_state_switch(State::On, false, start + Duration::from_millis(50))
                .1,
            MotionState::MovingInstability
        );
        assert_eq!(
            item.on_state_switch(State::On, false, start + wait).1,
            MotionState::Stopped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_start_is_tracked() {
        let mut item = item(false, None);
        let now = Instant::now();
        assert_eq!(
            item.on_state_switch(State::Moving, false, now),
            (MotionState::Stopped, MotionState::Moving)
        );
        assert!(item.in_motion());
    }
}
