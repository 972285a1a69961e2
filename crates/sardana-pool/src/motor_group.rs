//! Motor groups: simultaneous motion of several motors.
//!
//! A group owns no axis. Its state is derived from its members and its
//! position is the vector of member user positions; both are kept current by
//! listening to member events. The group holds a strong reference to its
//! listener and the members hold only weak ones, so dropping the group
//! silently unsubscribes it.

use crate::action::Action;
use crate::element::{ElementCore, PoolElement};
use crate::executor::WorkerPool;
use crate::motion::{MotionItems, PoolMotion};
use crate::motor::PoolMotor;
use parking_lot::Mutex;
use sardana_core::{
    filters, ElementId, ElementType, Event, EventListener, PoolConfig, PoolError, PoolResult,
    Propagate, SardanaAttribute, State, SubscriptionId,
};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Group state from member states: Fault, then Alarm, then Moving, else On.
pub fn group_state(states: impl IntoIterator<Item = State>) -> State {
    let mut any_alarm = false;
    let mut any_moving = false;
    for state in states {
        match state {
            State::Fault => return State::Fault,
            State::Alarm => any_alarm = true,
            s if s.is_moving() => any_moving = true,
            _ => {}
        }
    }
    if any_alarm {
        State::Alarm
    } else if any_moving {
        State::Moving
    } else {
        State::On
    }
}

struct MemberForwarder {
    group: Weak<PoolMotorGroup>,
}

impl EventListener for MemberForwarder {
    fn event_received(&self, event: &Event) {
        if let Some(group) = self.group.upgrade() {
            group.on_member_event(event);
        }
    }
}

/// An ordered set of motors moved together.
pub struct PoolMotorGroup {
    core: ElementCore,
    members: Vec<Arc<PoolMotor>>,
    position: SardanaAttribute<Vec<f64>>,
    motion: Arc<PoolMotion>,
    forwarder: Arc<MemberForwarder>,
    subscriptions: Mutex<Vec<(ElementId, SubscriptionId)>>,
}

impl std::fmt::Debug for PoolMotorGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolMotorGroup")
            .field("name", &self.core.name())
            .field(
                "members",
                &self.members.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .field("state", &self.core.state())
            .finish()
    }
}

impl Drop for PoolMotorGroup {
    fn drop(&mut self) {
        for (id, subscription) in self.subscriptions.get_mut().drain(..) {
            if let Some(member) = self.members.iter().find(|m| m.id() == id) {
                member.core().remove_listener(subscription);
            }
        }
    }
}

impl PoolMotorGroup {
    pub fn new(
        id: ElementId,
        name: impl Into<String>,
        members: Vec<Arc<PoolMotor>>,
        worker_pool: WorkerPool,
        config: PoolConfig,
    ) -> PoolResult<Arc<Self>> {
        let name = name.into();
        if members.is_empty() {
            return Err(PoolError::InvalidParameter(format!(
                "motor group {} needs at least one motor",
                name
            )));
        }
        let mut seen = BTreeSet::new();
        for member in &members {
            if !seen.insert(member.id()) {
                return Err(PoolError::InvalidParameter(format!(
                    "motor {} appears twice in group {}",
                    member.name(),
                    name
                )));
            }
        }

        let motion = Arc::new(PoolMotion::new(
            format!("{}.motion", name),
            worker_pool,
            config,
        ));
        for member in &members {
            motion.core().add_element(member)?;
        }

        let core = ElementCore::new(id, name, ElementType::MotorGroup);
        let position = SardanaAttribute::new("position", Arc::clone(core.events()))
            .with_filter(filters::vector_number);
        let group = Arc::new_cyclic(|weak| Self {
            core,
            members,
            position,
            motion,
            forwarder: Arc::new(MemberForwarder {
                group: Weak::clone(weak),
            }),
            subscriptions: Mutex::new(Vec::new()),
        });

        let subscriptions = group
            .members
            .iter()
            .map(|m| (m.id(), m.core().add_listener(&group.forwarder)))
            .collect();
        *group.subscriptions.lock() = subscriptions;
        group.refresh_state(Propagate::Suppress);
        group.refresh_position(Propagate::Suppress);
        Ok(group)
    }

    pub fn core(&self) -> &ElementCore {
        &self.core
    }

    pub fn id(&self) -> ElementId {
        self.core.id()
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn members(&self) -> &[Arc<PoolMotor>] {
        &self.members
    }

    pub fn motion(&self) -> &Arc<PoolMotion> {
        &self.motion
    }

    pub fn position_attribute(&self) -> &SardanaAttribute<Vec<f64>> {
        &self.position
    }

    /// Member user positions in member order. With `cache == false` every
    /// member is read from hardware first.
    pub async fn position(&self, cache: bool, propagate: Propagate) -> PoolResult<Vec<f64>> {
        let mut positions = Vec::with_capacity(self.members.len());
        for member in &self.members {
            positions.push(member.get_position(cache, propagate).await?);
        }
        Ok(positions)
    }

    /// Moves every member to its entry of `positions` in one motion.
    pub async fn start_move(&self, positions: Vec<f64>) -> PoolResult<()> {
        if positions.len() != self.members.len() {
            return Err(PoolError::InvalidParameter(format!(
                "{} expects {} positions, got {}",
                self.name(),
                self.members.len(),
                positions.len()
            )));
        }
        if !self.core.simulation_mode() {
            self.position(false, Propagate::Normal).await?;
        }
        let mut items = MotionItems::new();
        for (member, &user) in self.members.iter().zip(&positions) {
            items.insert(member.id(), member.calculate_motion(user)?);
        }
        for (member, &user) in self.members.iter().zip(&positions) {
            member
                .position_attribute()
                .set_write_value(user, Propagate::Suppress);
        }
        self.position.set_write_value(positions, Propagate::Suppress);
        debug!(group = %self.name(), members = self.members.len(), "starting group move");
        if self.core.simulation_mode() {
            return Ok(());
        }
        Arc::clone(&self.motion).run(items, false).await
    }

    /// Moves and waits for every member to settle.
    pub async fn move_to(&self, positions: Vec<f64>) -> PoolResult<()> {
        self.start_move(positions).await?;
        self.motion.core().wait_finished().await;
        Ok(())
    }

    pub async fn stop(&self) -> PoolResult<()> {
        self.motion.core().stop(None).await
    }

    pub async fn abort(&self) -> PoolResult<()> {
        self.motion.core().abort(None).await
    }

    fn on_member_event(&self, event: &Event) {
        let propagate = Propagate::from_level(event.event_type.priority);
        match event.name() {
            "state" => self.refresh_state(propagate),
            "position" => {
                self.refresh_position(propagate);
                self.refresh_state(Propagate::Suppress);
            }
            _ => {}
        }
    }

    fn refresh_state(&self, propagate: Propagate) {
        let state = group_state(self.members.iter().map(|m| m.core().state()));
        let mut status = match state {
            State::On => format!("{} is Stopped", self.name()),
            State::Moving => format!("{} is Moving", self.name()),
            other => format!("{} is in {}", self.name(), other),
        };
        for member in &self.members {
            if member.core().state() != State::On {
                status.push('\n');
                status.push_str(&member.core().status());
            }
        }
        self.core.set_status(status, propagate);
        self.core.set_state(state, propagate);
    }

    fn refresh_position(&self, propagate: Propagate) {
        let positions: Option<Vec<f64>> = self
            .members
            .iter()
            .map(|m| {
                let attr = m.position_attribute();
                if attr.in_error() {
                    None
                } else {
                    attr.get_value()
                }
            })
            .collect();
        if let Some(positions) = positions {
            self.position.set_value(positions, propagate);
        }
    }
}
