//! Composite acquisition: counter/timers with 0D channels sampled alongside.

use crate::action::Action;
use crate::channel::PoolCTExpChannel;
use crate::ct_acquisition::{CTAcquisitionItems, PoolCTAcquisition};
use crate::element::PoolElement;
use crate::executor::WorkerPool;
use crate::zerod::{Pool0DAcquisition, Pool0DExpChannel, ZeroDAcquisitionItems};
use sardana_core::{ElementId, PoolConfig, PoolError, PoolResult};
use std::sync::Arc;
use tracing::{info, warn};

/// What to count and for how long.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionRequest {
    pub integ_time: Option<f64>,
    pub monitor_count: Option<f64>,
    /// Master channel; the first counter/timer when `None`.
    pub master: Option<ElementId>,
}

impl AcquisitionRequest {
    pub fn timed(integ_time: f64) -> Self {
        Self {
            integ_time: Some(integ_time),
            monitor_count: None,
            master: None,
        }
    }

    pub fn monitored(monitor_count: f64, master: ElementId) -> Self {
        Self {
            integ_time: None,
            monitor_count: Some(monitor_count),
            master: Some(master),
        }
    }
}

/// Counter/timer acquisition with 0D slaves.
///
/// The 0D part is started first with an open window and is stopped by the
/// counter/timer loop when the master finishes.
#[derive(Debug)]
pub struct PoolAcquisition {
    name: String,
    ct: Arc<PoolCTAcquisition>,
    zerod: Arc<Pool0DAcquisition>,
}

impl PoolAcquisition {
    pub fn new(name: impl Into<String>, worker_pool: WorkerPool, config: PoolConfig) -> Self {
        let name = name.into();
        let ct = Arc::new(PoolCTAcquisition::new(
            format!("{}.ct", name),
            worker_pool.clone(),
            config.clone(),
        ));
        let zerod = Arc::new(Pool0DAcquisition::new(
            format!("{}.0d", name),
            worker_pool,
            config,
        ));
        ct.add_slave(&zerod);
        Self { name, ct, zerod }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ct_acquisition(&self) -> &Arc<PoolCTAcquisition> {
        &self.ct
    }

    pub fn zerod_acquisition(&self) -> &Arc<Pool0DAcquisition> {
        &self.zerod
    }

    pub fn add_ct_channel(&self, channel: &Arc<PoolCTExpChannel>) -> PoolResult<()> {
        self.ct.core().add_element(channel)
    }

    pub fn add_zerod_channel(&self, channel: &Arc<Pool0DExpChannel>) -> PoolResult<()> {
        self.zerod.core().add_element(channel)
    }

    pub fn is_running(&self) -> bool {
        self.ct.core().is_running() || self.zerod.core().is_running()
    }

    /// Starts both parts and returns once they are running.
    #[tracing::instrument(skip(self), fields(acquisition = %self.name))]
    pub async fn start(&self, request: AcquisitionRequest) -> PoolResult<()> {
        let master = match request.master {
            Some(master) => master,
            None => self
                .ct
                .core()
                .element_ids()
                .into_iter()
                .next()
                .ok_or_else(|| {
                    PoolError::InvalidParameter(format!("{} has no counter/timer", self.name))
                })?,
        };
        let ct_items = CTAcquisitionItems::new(request.integ_time, request.monitor_count, master)?;

        let with_zerod = !self.zerod.core().element_ids().is_empty();
        if with_zerod {
            Arc::clone(&self.zerod)
                .run(ZeroDAcquisitionItems::default(), false)
                .await?;
        }

        if let Err(e) = Arc::clone(&self.ct).run(ct_items, false).await {
            if with_zerod {
                warn!(acquisition = %self.name, error = %e, "counter/timer start failed, stopping 0D");
                self.zerod.request_stop();
                self.zerod.core().wait_finished().await;
            }
            return Err(e);
        }
        info!(acquisition = %self.name, master = %master, "acquisition started");
        Ok(())
    }

    pub async fn wait_finished(&self) {
        self.ct.core().wait_finished().await;
        self.zerod.core().wait_finished().await;
    }

    /// Runs one acquisition to the end.
    pub async fn acquire(&self, request: AcquisitionRequest) -> PoolResult<()> {
        self.start(request).await?;
        self.wait_finished().await;
        Ok(())
    }

    pub async fn stop(&self) -> PoolResult<()> {
        self.zerod.request_stop();
        let ct = self.ct.core().stop(None).await;
        let zerod = self.zerod.core().stop(None).await;
        ct.and(zerod)
    }

    pub async fn abort(&self) -> PoolResult<()> {
        self.zerod.request_stop();
        let ct = self.ct.core().abort(None).await;
        let zerod = self.zerod.core().abort(None).await;
        ct.and(zerod)
    }
}

impl PoolAcquisition {
    /// Builds an acquisition over the given channels.
    pub fn with_channels(
        name: impl Into<String>,
        worker_pool: WorkerPool,
        config: PoolConfig,
        ct_channels: &[Arc<PoolCTExpChannel>],
        zerod_channels: &[Arc<Pool0DExpChannel>],
    ) -> PoolResult<Self> {
        let acquisition = Self::new(name, worker_pool, config);
        for channel in ct_channels {
            acquisition.add_ct_channel(channel)?;
        }
        for channel in zerod_channels {
            acquisition.add_zerod_channel(channel)?;
        }
        Ok(acquisition)
    }

    /// Ids of every channel taking part.
    pub fn channel_ids(&self) -> Vec<ElementId> {
        let mut ids: Vec<_> = self.ct.core().element_ids().into_iter().collect();
        ids.extend(self.zerod.core().element_ids());
        ids
    }

    /// Name of each counter/timer channel with its value.
    pub fn ct_values(&self) -> Vec<(String, Option<f64>)> {
        self.ct
            .core()
            .elements()
            .iter()
            .map(|c| (c.name().to_string(), c.value()))
            .collect()
    }

    /// Name of each 0D channel with its accumulated value.
    pub fn zerod_values(&self) -> Vec<(String, Option<f64>)> {
        self.zerod
            .core()
            .elements()
            .iter()
            .map(|c| (c.name().to_string(), c.value()))
            .collect()
    }
}
