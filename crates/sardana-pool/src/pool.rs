//! The pool: registry of controllers and elements.
//!
//! The pool is the arena. It owns the strong handles; actions and groups see
//! elements through `Arc`s handed out here and refer to them by id. Names are
//! unique across controllers and elements, compared case-insensitively.

use crate::acquisition::PoolAcquisition;
use crate::channel::PoolCTExpChannel;
use crate::element::{ElementCore, PoolElement};
use crate::executor::WorkerPool;
use crate::motor::PoolMotor;
use crate::motor_group::PoolMotorGroup;
use crate::pool_controller::PoolController;
use crate::zerod::Pool0DExpChannel;
use parking_lot::RwLock;
use sardana_core::{
    Axis, Controller, ControllerFeatures, ControllerId, ElementId, ElementType, PoolConfig,
    PoolError, PoolResult,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Handle to any pool element.
#[derive(Debug, Clone)]
pub enum PoolElementRef {
    Motor(Arc<PoolMotor>),
    CTExpChannel(Arc<PoolCTExpChannel>),
    ZeroDExpChannel(Arc<Pool0DExpChannel>),
    MotorGroup(Arc<PoolMotorGroup>),
}

impl PoolElementRef {
    pub fn core(&self) -> &ElementCore {
        match self {
            PoolElementRef::Motor(m) => m.core(),
            PoolElementRef::CTExpChannel(c) => c.core(),
            PoolElementRef::ZeroDExpChannel(c) => c.core(),
            PoolElementRef::MotorGroup(g) => g.core(),
        }
    }

    pub fn id(&self) -> ElementId {
        self.core().id()
    }

    pub fn name(&self) -> &str {
        self.core().name()
    }

    pub fn element_type(&self) -> ElementType {
        self.core().element_type()
    }

    /// Controller and axis; `None` for groups.
    pub fn hardware(&self) -> Option<(&Arc<PoolController>, Axis)> {
        match self {
            PoolElementRef::Motor(m) => Some((m.controller(), m.axis())),
            PoolElementRef::CTExpChannel(c) => Some((c.controller(), c.axis())),
            PoolElementRef::ZeroDExpChannel(c) => Some((c.controller(), c.axis())),
            PoolElementRef::MotorGroup(_) => None,
        }
    }

    pub async fn stop(&self) -> PoolResult<()> {
        match self {
            PoolElementRef::Motor(m) => m.stop().await,
            PoolElementRef::CTExpChannel(c) => c.stop().await,
            PoolElementRef::ZeroDExpChannel(c) => c.stop().await,
            PoolElementRef::MotorGroup(g) => g.stop().await,
        }
    }

    pub async fn abort(&self) -> PoolResult<()> {
        match self {
            PoolElementRef::Motor(m) => m.abort().await,
            PoolElementRef::CTExpChannel(c) => c.abort().await,
            PoolElementRef::ZeroDExpChannel(c) => c.abort().await,
            PoolElementRef::MotorGroup(g) => g.abort().await,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Named {
    Controller(ControllerId),
    Element(ElementId),
    /// Name taken by an element still being created.
    Reserved,
}

#[derive(Debug, Default)]
struct Registry {
    controllers: BTreeMap<ControllerId, Arc<PoolController>>,
    elements: BTreeMap<ElementId, PoolElementRef>,
    names: HashMap<String, Named>,
}

fn name_key(name: &str) -> String {
    name.to_lowercase()
}

/// Device pool.
pub struct Pool {
    config: PoolConfig,
    worker_pool: WorkerPool,
    next_id: AtomicU64,
    registry: RwLock<Registry>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.read();
        f.debug_struct("Pool")
            .field("controllers", &registry.controllers.len())
            .field("elements", &registry.elements.len())
            .field("worker_pool", &self.worker_pool)
            .finish()
    }
}

impl Pool {
    pub fn new(config: PoolConfig, worker_pool: WorkerPool) -> Self {
        Self {
            config,
            worker_pool,
            next_id: AtomicU64::new(1),
            registry: RwLock::new(Registry::default()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.worker_pool
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn reserve_name(&self, name: &str) -> PoolResult<()> {
        let mut registry = self.registry.write();
        let key = name_key(name);
        if registry.names.contains_key(&key) {
            return Err(PoolError::DuplicateName(name.to_string()));
        }
        registry.names.insert(key, Named::Reserved);
        Ok(())
    }

    fn unreserve_name(&self, name: &str) {
        let mut registry = self.registry.write();
        let key = name_key(name);
        if matches!(registry.names.get(&key), Some(Named::Reserved)) {
            registry.names.remove(&key);
        }
    }

    fn commit(&self, element: PoolElementRef) {
        let mut registry = self.registry.write();
        registry
            .names
            .insert(name_key(element.name()), Named::Element(element.id()));
        registry.elements.insert(element.id(), element);
    }

    // -------------------------------------------------------------------------
    // Controllers
    // -------------------------------------------------------------------------

    pub fn add_controller(
        &self,
        name: impl Into<String>,
        driver: Box<dyn Controller>,
    ) -> PoolResult<Arc<PoolController>> {
        let name = name.into();
        let mut registry = self.registry.write();
        let key = name_key(&name);
        if registry.names.contains_key(&key) {
            return Err(PoolError::DuplicateName(name));
        }
        let id = ControllerId(self.next_id());
        let controller = Arc::new(PoolController::new(id, name, driver));
        registry.names.insert(key, Named::Controller(id));
        registry.controllers.insert(id, Arc::clone(&controller));
        info!(
            controller = %controller.name(),
            id = %id,
            controller_type = %controller.controller_type(),
            "controller added"
        );
        Ok(controller)
    }

    pub fn get_controller(&self, name: &str) -> PoolResult<Arc<PoolController>> {
        let registry = self.registry.read();
        match registry.names.get(&name_key(name)) {
            Some(Named::Controller(id)) => registry
                .controllers
                .get(id)
                .cloned()
                .ok_or_else(|| PoolError::ControllerNotFound(name.to_string())),
            _ => Err(PoolError::ControllerNotFound(name.to_string())),
        }
    }

    /// Every controller in id order.
    pub fn controllers(&self) -> Vec<Arc<PoolController>> {
        self.registry.read().controllers.values().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Elements
    // -------------------------------------------------------------------------

    /// Reserves the name, checks the controller and registers the axis.
    ///
    /// An `AddDevice` failure does not prevent the element from being
    /// created: the controller records the error and reports its elements
    /// offline.
    async fn prepare_axis(
        &self,
        name: &str,
        controller: &str,
        axis: Axis,
        feature: ControllerFeatures,
        capability: &str,
    ) -> PoolResult<(ElementId, Arc<PoolController>)> {
        if axis == 0 {
            return Err(PoolError::InvalidParameter(format!(
                "{}: axes are numbered from 1",
                name
            )));
        }
        let controller = self.get_controller(controller)?;
        if !controller.has_feature(feature) {
            return Err(PoolError::MissingCapability {
                controller: controller.name().to_string(),
                capability: capability.to_string(),
            });
        }
        if controller.axes().contains(&axis) {
            return Err(PoolError::InvalidParameter(format!(
                "axis {} of {} is already in use",
                axis,
                controller.name()
            )));
        }
        self.reserve_name(name)?;
        if let Err(e) = controller.add_axis(axis).await {
            warn!(element = %name, controller = %controller.name(), axis, error = %e, "element added with controller in error");
        }
        Ok((ElementId(self.next_id()), controller))
    }

    fn finish_element<T>(
        &self,
        name: &str,
        built: PoolResult<Arc<T>>,
        wrap: impl FnOnce(Arc<T>) -> PoolElementRef,
    ) -> PoolResult<Arc<T>> {
        match built {
            Ok(element) => {
                let handle = wrap(Arc::clone(&element));
                info!(element = %name, id = %handle.id(), kind = %handle.element_type(), "element added");
                self.commit(handle);
                Ok(element)
            }
            Err(e) => {
                self.unreserve_name(name);
                Err(e)
            }
        }
    }

    pub async fn add_motor(
        &self,
        name: &str,
        controller: &str,
        axis: Axis,
    ) -> PoolResult<Arc<PoolMotor>> {
        let (id, controller) = self
            .prepare_axis(name, controller, axis, ControllerFeatures::MOTOR, "motors")
            .await?;
        let built = PoolMotor::new(
            id,
            name,
            controller,
            axis,
            self.worker_pool.clone(),
            self.config.clone(),
        );
        self.finish_element(name, built, PoolElementRef::Motor)
    }

    pub async fn add_ct_channel(
        &self,
        name: &str,
        controller: &str,
        axis: Axis,
    ) -> PoolResult<Arc<PoolCTExpChannel>> {
        let (id, controller) = self
            .prepare_axis(
                name,
                controller,
                axis,
                ControllerFeatures::COUNTER_TIMER,
                "counter/timer channels",
            )
            .await?;
        let built = PoolCTExpChannel::new(
            id,
            name,
            controller,
            axis,
            self.worker_pool.clone(),
            self.config.clone(),
        );
        self.finish_element(name, built, PoolElementRef::CTExpChannel)
    }

    pub async fn add_zerod_channel(
        &self,
        name: &str,
        controller: &str,
        axis: Axis,
    ) -> PoolResult<Arc<Pool0DExpChannel>> {
        let (id, controller) = self
            .prepare_axis(name, controller, axis, ControllerFeatures::ZERO_D, "0D channels")
            .await?;
        let built = Pool0DExpChannel::new(
            id,
            name,
            controller,
            axis,
            self.worker_pool.clone(),
            self.config.clone(),
        );
        self.finish_element(name, built, PoolElementRef::ZeroDExpChannel)
    }

    pub fn add_motor_group(&self, name: &str, members: &[&str]) -> PoolResult<Arc<PoolMotorGroup>> {
        let motors = members
            .iter()
            .map(|m| self.get_motor(m))
            .collect::<PoolResult<Vec<_>>>()?;
        self.reserve_name(name)?;
        let built = PoolMotorGroup::new(
            ElementId(self.next_id()),
            name,
            motors,
            self.worker_pool.clone(),
            self.config.clone(),
        );
        self.finish_element(name, built, PoolElementRef::MotorGroup)
    }

    /// Removes an element. Refused while it takes part in an operation or,
    /// for a motor, while a group still contains it.
    pub async fn delete_element(&self, name: &str) -> PoolResult<()> {
        let element = self.get_element(name)?;
        if element.core().is_in_operation() {
            return Err(PoolError::AlreadyInOperation(element.name().to_string()));
        }
        if let PoolElementRef::Motor(motor) = &element {
            let owner = self.elements().into_iter().find_map(|e| match e {
                PoolElementRef::MotorGroup(g) if g.members().iter().any(|m| m.id() == motor.id()) => {
                    Some(g.name().to_string())
                }
                _ => None,
            });
            if let Some(group) = owner {
                return Err(PoolError::InvalidParameter(format!(
                    "{} is a member of {}",
                    motor.name(),
                    group
                )));
            }
        }

        {
            let mut registry = self.registry.write();
            registry.elements.remove(&element.id());
            registry.names.remove(&name_key(element.name()));
        }
        info!(element = %element.name(), "element deleted");

        if let Some((controller, axis)) = element.hardware() {
            controller.delete_axis(axis).await?;
        }
        Ok(())
    }

    pub fn get_element(&self, name: &str) -> PoolResult<PoolElementRef> {
        let registry = self.registry.read();
        match registry.names.get(&name_key(name)) {
            Some(Named::Element(id)) => registry
                .elements
                .get(id)
                .cloned()
                .ok_or_else(|| PoolError::ElementNotFound(name.to_string())),
            _ => Err(PoolError::ElementNotFound(name.to_string())),
        }
    }

    pub fn get_element_by_id(&self, id: ElementId) -> PoolResult<PoolElementRef> {
        self.registry
            .read()
            .elements
            .get(&id)
            .cloned()
            .ok_or_else(|| PoolError::ElementNotFound(id.to_string()))
    }

    pub fn get_motor(&self, name: &str) -> PoolResult<Arc<PoolMotor>> {
        match self.get_element(name)? {
            PoolElementRef::Motor(motor) => Ok(motor),
            other => Err(PoolError::InvalidParameter(format!(
                "{} is a {}, not a Motor",
                other.name(),
                other.element_type()
            ))),
        }
    }

    pub fn get_motor_group(&self, name: &str) -> PoolResult<Arc<PoolMotorGroup>> {
        match self.get_element(name)? {
            PoolElementRef::MotorGroup(group) => Ok(group),
            other => Err(PoolError::InvalidParameter(format!(
                "{} is a {}, not a MotorGroup",
                other.name(),
                other.element_type()
            ))),
        }
    }

    pub fn get_ct_channel(&self, name: &str) -> PoolResult<Arc<PoolCTExpChannel>> {
        match self.get_element(name)? {
            PoolElementRef::CTExpChannel(channel) => Ok(channel),
            other => Err(PoolError::InvalidParameter(format!(
                "{} is a {}, not a CTExpChannel",
                other.name(),
                other.element_type()
            ))),
        }
    }

    pub fn get_zerod_channel(&self, name: &str) -> PoolResult<Arc<Pool0DExpChannel>> {
        match self.get_element(name)? {
            PoolElementRef::ZeroDExpChannel(channel) => Ok(channel),
            other => Err(PoolError::InvalidParameter(format!(
                "{} is a {}, not a ZeroDExpChannel",
                other.name(),
                other.element_type()
            ))),
        }
    }

    /// Every element in id order.
    pub fn elements(&self) -> Vec<PoolElementRef> {
        self.registry.read().elements.values().cloned().collect()
    }

    /// Builds an acquisition over every counter/timer and 0D channel.
    pub fn acquisition(&self, name: impl Into<String>) -> PoolResult<PoolAcquisition> {
        let mut ct_channels = Vec::new();
        let mut zerod_channels = Vec::new();
        for element in self.elements() {
            match element {
                PoolElementRef::CTExpChannel(c) => ct_channels.push(c),
                PoolElementRef::ZeroDExpChannel(c) => zerod_channels.push(c),
                _ => {}
            }
        }
        PoolAcquisition::with_channels(
            name,
            self.worker_pool.clone(),
            self.config.clone(),
            &ct_channels,
            &zerod_channels,
        )
    }

    // -------------------------------------------------------------------------
    // Interrupts
    // -------------------------------------------------------------------------

    /// Stops every element. Every element is attempted.
    pub async fn stop_all(&self) -> PoolResult<()> {
        self.interrupt_all("stop_all", false).await
    }

    /// Aborts every element. Every element is attempted.
    pub async fn abort_all(&self) -> PoolResult<()> {
        self.interrupt_all("abort_all", true).await
    }

    async fn interrupt_all(&self, operation: &'static str, abort: bool) -> PoolResult<()> {
        let mut errors = Vec::new();
        for element in self.elements() {
            if matches!(element, PoolElementRef::MotorGroup(_)) {
                continue;
            }
            let result = if abort {
                element.abort().await
            } else {
                element.stop().await
            };
            if let Err(e) = result {
                warn!(element = %element.name(), error = %e, "{} failed", operation);
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PoolError::OperationFailed { operation, errors })
        }
    }
}
