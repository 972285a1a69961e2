//! 0D channels and their acquisition.
//!
//! A 0D channel has no hardware gate: during an acquisition the pool samples
//! it as fast as the loop allows and reduces the samples with an
//! [`Accumulation`]. The reduced value is the channel's `value`; the latest
//! raw sample is its `current_value`.

use crate::accumulation::{Accumulation, AccumulationType};
use crate::action::{Action, PoolAction};
use crate::channel::BaseChannel;
use crate::element::{ElementCore, PoolElement};
use crate::executor::WorkerPool;
use crate::pool_controller::PoolController;
use async_trait::async_trait;
use parking_lot::Mutex;
use sardana_core::{
    filters, Axis, ElementId, ElementType, PoolConfig, PoolError, PoolResult, Propagate,
    SardanaAttribute, SardanaValue, State, StateInfo,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// 0D experiment channel.
pub struct Pool0DExpChannel {
    base: BaseChannel,
    current_value: SardanaAttribute<f64>,
    accumulation: Mutex<Accumulation>,
    acquisition: Arc<Pool0DAcquisition>,
}

impl std::fmt::Debug for Pool0DExpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool0DExpChannel")
            .field("base", &self.base)
            .field("accumulation", &self.accumulation.lock().kind())
            .finish()
    }
}

impl PoolElement for Pool0DExpChannel {
    fn core(&self) -> &ElementCore {
        self.base.core()
    }

    fn controller(&self) -> &Arc<PoolController> {
        self.base.controller()
    }

    fn axis(&self) -> Axis {
        self.base.axis()
    }
}

impl Pool0DExpChannel {
    pub fn new(
        id: ElementId,
        name: impl Into<String>,
        controller: Arc<PoolController>,
        axis: Axis,
        worker_pool: WorkerPool,
        config: PoolConfig,
    ) -> PoolResult<Arc<Self>> {
        let base = BaseChannel::new(id, name, ElementType::ZeroDExpChannel, controller, axis);
        let current_value = SardanaAttribute::new("current_value", Arc::clone(base.core().events()))
            .with_filter(filters::scalar_number);
        let accumulation = Accumulation::new(AccumulationType::default(), config.zerod_buffer_size);
        let acquisition = Arc::new(Pool0DAcquisition::new(
            format!("{}.acquisition", base.core().name()),
            worker_pool,
            config,
        ));
        let channel = Arc::new(Self {
            base,
            current_value,
            accumulation: Mutex::new(accumulation),
            acquisition,
        });
        channel.acquisition.core().add_element(&channel)?;
        Ok(channel)
    }

    pub fn base(&self) -> &BaseChannel {
        &self.base
    }

    pub fn acquisition(&self) -> &Arc<Pool0DAcquisition> {
        &self.acquisition
    }

    pub fn value_attribute(&self) -> &SardanaAttribute<f64> {
        self.base.value_attribute()
    }

    pub fn current_value_attribute(&self) -> &SardanaAttribute<f64> {
        &self.current_value
    }

    /// Accumulated value of the last (or running) acquisition.
    pub fn value(&self) -> Option<f64> {
        self.base.value_attribute().get_value()
    }

    pub fn accumulation_type(&self) -> AccumulationType {
        self.accumulation.lock().kind()
    }

    pub fn set_accumulation_type(&self, kind: AccumulationType) {
        self.accumulation.lock().set_kind(kind);
    }

    pub fn clear_buffer(&self) {
        self.accumulation.lock().clear();
    }

    pub fn value_buffer(&self) -> Vec<f64> {
        self.accumulation.lock().value_buffer().to_vec()
    }

    pub fn time_buffer(&self) -> Vec<f64> {
        self.accumulation.lock().time_buffer().to_vec()
    }

    /// Records a sample. Only samples taken during an acquisition are
    /// accumulated.
    pub fn put_current_value(&self, sample: SardanaValue<f64>, propagate: Propagate) {
        let accumulate = self.core().is_in_operation();
        let reading = sample.value().copied().map(|v| (v, sample.timestamp()));
        self.current_value.set_value_obj(sample, propagate);
        let Some((value, timestamp)) = reading else {
            return;
        };
        if !accumulate {
            return;
        }
        let reduced = {
            let mut accumulation = self.accumulation.lock();
            accumulation.append(value, timestamp.timestamp_micros() as f64 / 1e6);
            accumulation.value()
        };
        if let Some(reduced) = reduced {
            self.base
                .value_attribute()
                .set_value_at(reduced, timestamp, propagate);
        }
    }

    pub fn set_state_info(&self, info: &StateInfo, propagate: Propagate) {
        self.base.set_state_info(info, propagate);
    }

    /// Reads the channel once from hardware.
    pub async fn get_current_value(&self) -> PoolResult<f64> {
        let ids = BTreeSet::from([self.id()]);
        let mut values = self.acquisition.core().read_value_of(Some(&ids), true).await?;
        let sample = values
            .remove(&self.id())
            .ok_or_else(|| PoolError::ElementNotFound(self.name().to_string()))?;
        let value = sample.clone().into_result().map_err(|e| PoolError::ValueError {
            element: self.name().to_string(),
            message: e.to_string(),
        })?;
        self.put_current_value(sample, Propagate::Normal);
        Ok(value)
    }

    /// Samples for `integ_time` seconds.
    pub async fn start_acquisition(&self, integ_time: Option<f64>) -> PoolResult<()> {
        let integ_time = self.base.prepare_acquisition(integ_time)?;
        if self.core().simulation_mode() {
            return Ok(());
        }
        let items = ZeroDAcquisitionItems {
            integ_time: Some(integ_time),
            channels: None,
        };
        Arc::clone(&self.acquisition).run(items, false).await
    }

    pub async fn stop(&self) -> PoolResult<()> {
        self.acquisition.request_stop();
        self.acquisition.core().stop(Some(self)).await
    }

    pub async fn abort(&self) -> PoolResult<()> {
        self.acquisition.request_stop();
        self.acquisition.core().abort(Some(self)).await
    }
}

/// Parameters of one 0D acquisition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZeroDAcquisitionItems {
    /// Sampling window; runs until stopped when `None`.
    pub integ_time: Option<f64>,
    /// Channels to sample; every channel of the action when `None`.
    pub channels: Option<BTreeSet<ElementId>>,
}

/// 0D acquisition action.
pub struct Pool0DAcquisition {
    core: PoolAction<Pool0DExpChannel>,
    channels: Mutex<BTreeSet<ElementId>>,
    window: Mutex<Option<(Instant, Option<Duration>)>>,
    stop_requested: AtomicBool,
}

impl std::fmt::Debug for Pool0DAcquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool0DAcquisition")
            .field("core", &self.core)
            .field("stop_requested", &self.stop_requested.load(Ordering::Acquire))
            .finish()
    }
}

impl Pool0DAcquisition {
    pub fn new(name: impl Into<String>, worker_pool: WorkerPool, config: PoolConfig) -> Self {
        Self {
            core: PoolAction::new(name, worker_pool, config),
            channels: Mutex::new(BTreeSet::new()),
            window: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
        }
    }

    /// Ends the sampling loop after its current iteration.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    fn selected(&self, items: &ZeroDAcquisitionItems) -> PoolResult<Vec<Arc<Pool0DExpChannel>>> {
        let ids = match &items.channels {
            Some(ids) => ids.clone(),
            None => self.core.element_ids(),
        };
        ids.iter()
            .map(|id| {
                self.core
                    .get_element(*id)
                    .ok_or_else(|| PoolError::ElementNotFound(id.to_string()))
            })
            .collect()
    }

    fn should_end(&self) -> bool {
        if self.stop_requested.load(Ordering::Acquire)
            || self.core.was_stopped()
            || self.core.was_aborted()
        {
            return true;
        }
        let window = *self.window.lock();
        window
            .and_then(|(started, limit)| limit.map(|limit| started.elapsed() >= limit))
            .unwrap_or(false)
    }

    async fn sample(&self, ids: &BTreeSet<ElementId>) {
        match self.core.read_value_of(Some(ids), false).await {
            Ok(values) => {
                for (id, value) in values {
                    if let Some(channel) = self.core.get_element(id) {
                        channel.put_current_value(value, Propagate::Normal);
                    }
                }
            }
            Err(e) => warn!(action = %self.core.name(), error = %e, "0D read failed"),
        }
    }
}

#[async_trait]
impl Action for Pool0DAcquisition {
    type Element = Pool0DExpChannel;
    type Items = ZeroDAcquisitionItems;

    fn core(&self) -> &PoolAction<Pool0DExpChannel> {
        &self.core
    }

    fn involved(&self, items: &ZeroDAcquisitionItems) -> PoolResult<Vec<Arc<Pool0DExpChannel>>> {
        self.selected(items)
    }

    #[tracing::instrument(skip_all, fields(action = %self.core.name()))]
    async fn start_action(&self, items: ZeroDAcquisitionItems) -> PoolResult<()> {
        let channels = self.selected(&items)?;
        for channel in &channels {
            channel.controller().check_online()?;
        }
        let limit = match items.integ_time {
            Some(t) if t.is_finite() && t >= 0.0 => Some(Duration::from_secs_f64(t)),
            Some(t) => return Err(PoolError::InvalidIntegrationTime(t.to_string())),
            None => None,
        };
        self.stop_requested.store(false, Ordering::Release);
        *self.channels.lock() = channels.iter().map(|c| c.id()).collect();
        for channel in &channels {
            channel.clear_buffer();
            channel.set_state_info(
                &StateInfo::new(State::Moving).with_status("Acquiring"),
                Propagate::Force,
            );
        }
        *self.window.lock() = Some((Instant::now(), limit));
        debug!(channels = channels.len(), ?limit, "0D acquisition started");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(action = %self.core.name()))]
    async fn action_loop(self: Arc<Self>) -> PoolResult<()> {
        let ids = self.channels.lock().clone();
        let pause = self.core.config().acq_loop_sleep();
        loop {
            self.sample(&ids).await;
            if self.should_end() {
                break;
            }
            sleep(pause).await;
        }

        let states = self.core.read_state_info_of(Some(&ids), true).await;
        for (id, info) in states {
            let Some(channel) = self.core.get_element(id) else {
                continue;
            };
            channel.value_attribute().fire_event(Propagate::Force);
            self.core.release_operation(id);
            channel.set_state_info(&info, Propagate::Force);
        }
        *self.window.lock() = None;
        Ok(())
    }
}
