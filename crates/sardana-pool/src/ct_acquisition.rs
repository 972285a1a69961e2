//! Counter/timer acquisition.
//!
//! One master channel (a timer, or a monitor) gates the acquisition. Every
//! controller is loaded with the preset, then started with the master's
//! controller last so the other cards are armed before the gate opens:
//!
//! ```text
//! PreLoadAll, PreLoadOne, LoadOne, LoadAll   (per controller)
//! PreStartAll                                (per controller)
//! PreStartOne, StartOne                      (per channel)
//! state -> Moving (per channel, forced event)
//! StartAll                                   (per controller, master last)
//! ```

use crate::action::{Action, PoolAction};
use crate::channel::PoolCTExpChannel;
use crate::element::PoolElement;
use crate::executor::WorkerPool;
use crate::pool_controller::PoolController;
use crate::zerod::Pool0DAcquisition;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sardana_core::{
    ControllerId, ElementId, PoolConfig, PoolError, PoolResult, Propagate, StateInfo,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// What gates the acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcquisitionMode {
    /// Count for this many seconds
    IntegrationTime(f64),
    /// Count until the monitor reaches this many counts
    MonitorCount(f64),
}

/// Parameters of one counter/timer acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct CTAcquisitionItems {
    pub mode: AcquisitionMode,
    pub master: ElementId,
    /// Channels to acquire; every channel of the action when `None`.
    pub channels: Option<BTreeSet<ElementId>>,
}

impl CTAcquisitionItems {
    /// Exactly one of `integ_time` and `monitor_count` must be given.
    pub fn new(
        integ_time: Option<f64>,
        monitor_count: Option<f64>,
        master: ElementId,
    ) -> PoolResult<Self> {
        let mode = match (integ_time, monitor_count) {
            (Some(t), None) => AcquisitionMode::IntegrationTime(t),
            (None, Some(m)) => AcquisitionMode::MonitorCount(m),
            (None, None) => {
                return Err(PoolError::InvalidParameter(
                    "must give integration time or monitor counts".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(PoolError::InvalidParameter(
                    "must give either integration time or monitor counts (not both)".to_string(),
                ))
            }
        };
        let preset = match mode {
            AcquisitionMode::IntegrationTime(v) | AcquisitionMode::MonitorCount(v) => v,
        };
        if !preset.is_finite() || preset < 0.0 {
            return Err(PoolError::InvalidParameter(format!(
                "acquisition preset must not be negative, got {}",
                preset
            )));
        }
        Ok(Self {
            mode,
            master,
            channels: None,
        })
    }

    pub fn with_channels(mut self, channels: impl IntoIterator<Item = ElementId>) -> Self {
        self.channels = Some(channels.into_iter().collect());
        self
    }

    /// Value loaded into the master: the time, or minus the monitor count.
    pub fn master_value(&self) -> f64 {
        match self.mode {
            AcquisitionMode::IntegrationTime(t) => t,
            AcquisitionMode::MonitorCount(m) => -m,
        }
    }
}

type ControllerBatch = (Arc<PoolController>, Vec<Arc<PoolCTExpChannel>>);

/// Counter/timer acquisition action.
pub struct PoolCTAcquisition {
    core: PoolAction<PoolCTExpChannel>,
    channels: Mutex<BTreeSet<ElementId>>,
    slaves: RwLock<Vec<Weak<Pool0DAcquisition>>>,
}

impl std::fmt::Debug for PoolCTAcquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolCTAcquisition")
            .field("core", &self.core)
            .finish()
    }
}

impl PoolCTAcquisition {
    pub fn new(name: impl Into<String>, worker_pool: WorkerPool, config: PoolConfig) -> Self {
        Self {
            core: PoolAction::new(name, worker_pool, config),
            channels: Mutex::new(BTreeSet::new()),
            slaves: RwLock::new(Vec::new()),
        }
    }

    /// Attaches a 0D acquisition that is stopped when this one ends.
    pub fn add_slave(&self, slave: &Arc<Pool0DAcquisition>) {
        self.slaves.write().push(Arc::downgrade(slave));
    }

    fn selected(&self, items: &CTAcquisitionItems) -> PoolResult<Vec<Arc<PoolCTExpChannel>>> {
        let ids = match &items.channels {
            Some(ids) => ids.clone(),
            None => self.core.element_ids(),
        };
        if !ids.contains(&items.master) {
            return Err(PoolError::ElementNotFound(items.master.to_string()));
        }
        ids.iter()
            .map(|id| {
                self.core
                    .get_element(*id)
                    .ok_or_else(|| PoolError::ElementNotFound(id.to_string()))
            })
            .collect()
    }

    /// Channels grouped per controller in id order, then the master's
    /// controller moved to the end.
    fn call_order(
        channels: Vec<Arc<PoolCTExpChannel>>,
        master_ctrl: ControllerId,
    ) -> Vec<ControllerBatch> {
        let mut by_ctrl: BTreeMap<ControllerId, ControllerBatch> = BTreeMap::new();
        for channel in channels {
            let controller = Arc::clone(channel.controller());
            by_ctrl
                .entry(controller.id())
                .or_insert_with(|| (controller, Vec::new()))
                .1
                .push(channel);
        }
        let master = by_ctrl.remove(&master_ctrl);
        let mut ordered: Vec<ControllerBatch> = by_ctrl.into_values().collect();
        ordered.extend(master);
        ordered
    }

    async fn emergency_break_batches(&self, batches: &[ControllerBatch]) {
        for (controller, channels) in batches {
            let axes: Vec<_> = channels.iter().map(|c| c.axis()).collect();
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

    async fn push_values(&self, ids: &BTreeSet<ElementId>, serial: bool, propagate: Propagate) {
        match self.core.read_value_of(Some(ids), serial).await {
            Ok(values) => {
                for (id, value) in values {
                    if let Some(channel) = self.core.get_element(id) {
                        channel.put_value(value, propagate);
                    }
                }
            }
            Err(e) => warn!(action = %self.core.name(), error = %e, "value read failed"),
        }
    }

    fn stop_slaves(&self) {
        for slave in self.slaves.read().iter().filter_map(Weak::upgrade) {
            slave.request_stop();
        }
    }

    async fn start_sequence(
        &self,
        batches: &[ControllerBatch],
        items: &CTAcquisitionItems,
    ) -> PoolResult<()> {
        let master_value = items.master_value();

        for (controller, channels) in batches {
            let load_axis = channels
                .iter()
                .find(|c| c.id() == items.master)
                .or_else(|| channels.first())
                .map(|c| c.axis());
            if let Some(axis) = load_axis {
                debug!(controller = %controller.name(), axis, master_value, "loading preset");
                controller.load(axis, master_value).await?;
            }
        }

        // lock in id order, call in master-last order
        let mut lock_order: Vec<usize> = (0..batches.len()).collect();
        lock_order.sort_by_key(|&i| batches[i].0.id());
        let mut slots: Vec<Option<_>> = (0..batches.len()).map(|_| None).collect();
        for i in lock_order {
            slots[i] = Some(batches[i].0.lock().await);
        }
        let mut drivers: Vec<_> = slots.into_iter().flatten().collect();

        for ((controller, _), driver) in batches.iter().zip(drivers.iter_mut()) {
            driver
                .pre_start_all()
                .await
                .map_err(|e| PoolError::driver(controller.name(), "PreStartAll", e))?;
        }

        let mut started = false;
        let mut failure = None;
        'start: for ((controller, channels), driver) in batches.iter().zip(drivers.iter_mut()) {
            for channel in channels {
                let accepted = match driver.pre_start_one(channel.axis(), master_value).await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        failure = Some(PoolError::driver(controller.name(), "PreStartOne", e));
                        break 'start;
                    }
                };
                if !accepted {
                    failure = Some(PoolError::PreStartOneFailed {
                        controller: controller.name().to_string(),
                        element: channel.name().to_string(),
                        axis: channel.axis(),
                        target: master_value,
                    });
                    break 'start;
                }
                if let Err(e) = driver.start_one(channel.axis(), master_value).await {
                    failure = Some(PoolError::driver(controller.name(), "StartOne", e));
                    break 'start;
                }
                started = true;
            }
        }
        if let Some(err) = failure {
            drop(drivers);
            if started {
                self.emergency_break_batches(batches).await;
            }
            return Err(err);
        }

        for (_, channels) in batches {
            for channel in channels {
                channel.core().set_state(sardana_core::State::Moving, Propagate::Force);
            }
        }

        for ((controller, _), driver) in batches.iter().zip(drivers.iter_mut()) {
            if let Err(e) = driver.start_all().await {
                failure = Some(PoolError::driver(controller.name(), "StartAll", e));
                break;
            }
        }
        drop(drivers);
        if let Some(err) = failure {
            self.emergency_break_batches(batches).await;
            let ids = self.channels.lock().clone();
            let states = self.core.read_state_info_of(Some(&ids), true).await;
            for (id, info) in states {
                if let Some(channel) = self.core.get_element(id) {
                    channel.set_state_info(&info, Propagate::Force);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    async fn settle_all(&self, ids: &BTreeSet<ElementId>) {
        let states = self.core.read_state_info_of(Some(ids), true).await;
        let values = match self.core.read_value_of(Some(ids), true).await {
            Ok(values) => values,
            Err(e) => {
                warn!(action = %self.core.name(), error = %e, "final value read failed");
                BTreeMap::new()
            }
        };
        let mut values = values;
        for (id, info) in states {
            let Some(channel) = self.core.get_element(id) else {
                continue;
            };
            channel.set_state_info(&info, Propagate::Suppress);
            if let Some(value) = values.remove(&id) {
                channel.put_value(value, Propagate::Force);
            }
            self.core.release_operation(id);
            channel.set_state_info(&info, Propagate::Force);
        }
    }
}

fn in_acquisition(states: &BTreeMap<ElementId, StateInfo>) -> bool {
    states.values().any(|info| info.state.is_moving())
}

#[async_trait]
impl Action for PoolCTAcquisition {
    type Element = PoolCTExpChannel;
    type Items = CTAcquisitionItems;

    fn core(&self) -> &PoolAction<PoolCTExpChannel> {
        &self.core
    }

    fn involved(&self, items: &CTAcquisitionItems) -> PoolResult<Vec<Arc<PoolCTExpChannel>>> {
        self.selected(items)
    }

    #[tracing::instrument(skip_all, fields(action = %self.core.name(), mode = ?items.mode))]
    async fn start_action(&self, items: CTAcquisitionItems) -> PoolResult<()> {
        let channels = self.selected(&items)?;
        let master_ctrl = channels
            .iter()
            .find(|c| c.id() == items.master)
            .map(|c| c.controller().id())
            .ok_or_else(|| PoolError::ElementNotFound(items.master.to_string()))?;
        *self.channels.lock() = channels.iter().map(|c| c.id()).collect();

        let batches = Self::call_order(channels, master_ctrl);
        for (controller, _) in &batches {
            controller.check_online()?;
        }
        self.start_sequence(&batches, &items).await
    }

    #[tracing::instrument(skip_all, fields(action = %self.core.name()))]
    async fn action_loop(self: Arc<Self>) -> PoolResult<()> {
        let config = self.core.config().clone();
        let per_value = u64::from(config.acq_loop_states_per_value.max(1));
        let ids = self.channels.lock().clone();

        self.push_values(&ids, true, Propagate::Force).await;

        let mut iteration: u64 = 0;
        loop {
            let states = self.core.read_state_info_of(Some(&ids), false).await;
            for (id, info) in &states {
                if info.error {
                    if let Some(channel) = self.core.get_element(*id) {
                        channel.set_state_info(info, Propagate::Normal);
                    }
                }
            }
            if !in_acquisition(&states) {
                break;
            }
            if self.core.interrupt_expired() {
                warn!(action = %self.core.name(), "channels did not stop after stop/abort, giving up");
                break;
            }
            if iteration % per_value == 0 {
                self.push_values(&ids, false, Propagate::Normal).await;
            }
            iteration += 1;
            sleep(config.acq_loop_sleep()).await;
        }

        self.stop_slaves();
        self.settle_all(&ids).await;
        info!(action = %self.core.name(), "acquisition finished");
        Ok(())
    }
}
