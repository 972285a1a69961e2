//! Experiment channels.
//!
//! [`BaseChannel`] carries what every acquirable channel shares: the element
//! core, its axis and a `value` attribute with the numeric change filter.
//! [`PoolCTExpChannel`] is a counter/timer channel that can also act as the
//! master of its own acquisition.

use crate::action::Action;
use crate::ct_acquisition::{CTAcquisitionItems, PoolCTAcquisition};
use crate::element::{ElementCore, PoolElement};
use crate::executor::WorkerPool;
use crate::pool_controller::PoolController;
use sardana_core::{
    filters, Axis, ElementId, ElementType, PoolConfig, PoolError, PoolResult, Propagate,
    SardanaAttribute, SardanaValue, StateInfo,
};
use std::sync::Arc;

/// State shared by every acquirable channel.
pub struct BaseChannel {
    core: ElementCore,
    controller: Arc<PoolController>,
    axis: Axis,
    value: SardanaAttribute<f64>,
}

impl std::fmt::Debug for BaseChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseChannel")
            .field("name", &self.core.name())
            .field("controller", &self.controller.name())
            .field("axis", &self.axis)
            .finish()
    }
}

impl BaseChannel {
    pub fn new(
        id: ElementId,
        name: impl Into<String>,
        element_type: ElementType,
        controller: Arc<PoolController>,
        axis: Axis,
    ) -> Self {
        let core = ElementCore::new(id, name, element_type);
        let value = SardanaAttribute::new("value", Arc::clone(core.events()))
            .with_filter(filters::scalar_number);
        Self {
            core,
            controller,
            axis,
            value,
        }
    }

    pub fn core(&self) -> &ElementCore {
        &self.core
    }

    pub fn controller(&self) -> &Arc<PoolController> {
        &self.controller
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    pub fn value_attribute(&self) -> &SardanaAttribute<f64> {
        &self.value
    }

    pub fn put_value(&self, value: SardanaValue<f64>, propagate: Propagate) {
        self.value.set_value_obj(value, propagate);
    }

    /// Applies a state read from the controller.
    pub fn set_state_info(&self, info: &StateInfo, propagate: Propagate) {
        let status = match info.status.as_deref().filter(|s| !s.is_empty()) {
            Some(ctrl_status) if info.error => ctrl_status.to_string(),
            Some(ctrl_status) => format!("{} is {}\n{}", self.core.name(), info.state, ctrl_status),
            None => format!("{} is {}", self.core.name(), info.state),
        };
        self.core.set_status(status, propagate);
        self.core.set_state(info.state, propagate);
    }

    /// Validates the acquisition parameter and resets the interrupt flags.
    /// A zero time is a valid request; only a missing or non-finite value is
    /// refused.
    pub fn prepare_acquisition(&self, value: Option<f64>) -> PoolResult<f64> {
        let value =
            value.ok_or_else(|| PoolError::InvalidIntegrationTime("None".to_string()))?;
        if !value.is_finite() {
            return Err(PoolError::InvalidIntegrationTime(value.to_string()));
        }
        self.core.clear_interrupted();
        Ok(value)
    }
}

/// Counter/timer channel.
pub struct PoolCTExpChannel {
    base: BaseChannel,
    acquisition: Arc<PoolCTAcquisition>,
}

impl std::fmt::Debug for PoolCTExpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolCTExpChannel")
            .field("base", &self.base)
            .field("state", &self.base.core.state())
            .finish()
    }
}

impl PoolElement for PoolCTExpChannel {
    fn core(&self) -> &ElementCore {
        &self.base.core
    }

    fn controller(&self) -> &Arc<PoolController> {
        &self.base.controller
    }

    fn axis(&self) -> Axis {
        self.base.axis
    }
}

impl PoolCTExpChannel {
    pub fn new(
        id: ElementId,
        name: impl Into<String>,
        controller: Arc<PoolController>,
        axis: Axis,
        worker_pool: WorkerPool,
        config: PoolConfig,
    ) -> PoolResult<Arc<Self>> {
        let base = BaseChannel::new(id, name, ElementType::CTExpChannel, controller, axis);
        let acquisition = Arc::new(PoolCTAcquisition::new(
            format!("{}.acquisition", base.core.name()),
            worker_pool,
            config,
        ));
        let channel = Arc::new(Self { base, acquisition });
        channel.acquisition.core().add_element(&channel)?;
        Ok(channel)
    }

    pub fn base(&self) -> &BaseChannel {
        &self.base
    }

    pub fn acquisition(&self) -> &Arc<PoolCTAcquisition> {
        &self.acquisition
    }

    pub fn value_attribute(&self) -> &SardanaAttribute<f64> {
        &self.base.value
    }

    /// Last value read, if any.
    pub fn value(&self) -> Option<f64> {
        self.base.value.get_value()
    }

    pub fn put_value(&self, value: SardanaValue<f64>, propagate: Propagate) {
        self.base.put_value(value, propagate);
    }

    pub fn set_state_info(&self, info: &StateInfo, propagate: Propagate) {
        self.base.set_state_info(info, propagate);
    }

    /// Counts on this channel alone with it as timer for `integ_time` seconds.
    pub async fn start_acquisition(&self, integ_time: Option<f64>) -> PoolResult<()> {
        let integ_time = self.base.prepare_acquisition(integ_time)?;
        if self.base.core.simulation_mode() {
            return Ok(());
        }
        let items = CTAcquisitionItems::new(Some(integ_time), None, self.id())?;
        Arc::clone(&self.acquisition).run(items, false).await
    }

    /// Counts and waits for the acquisition to end.
    pub async fn count(&self, integ_time: Option<f64>) -> PoolResult<Option<f64>> {
        self.start_acquisition(integ_time).await?;
        self.acquisition.core().wait_finished().await;
        Ok(self.value())
    }

    pub async fn stop(&self) -> PoolResult<()> {
        self.acquisition.core().stop(Some(self)).await
    }

    pub async fn abort(&self) -> PoolResult<()> {
        self.acquisition.core().abort(Some(self)).await
    }
}
