//! Base machinery shared by every multi-controller operation.
//!
//! A [`PoolAction`] owns a set of elements partitioned by controller and
//! performs one class of operation (read state, read value, stop, abort)
//! against every controller of the partition. Controller calls are grouped
//! per controller, never per axis.
//!
//! State reads never fail: a controller that cannot be read yields a Fault
//! entry for each of its elements, so loops that key their termination off
//! state always get an answer. Value reads propagate the failure.
//!
//! Concrete operations implement [`Action`], whose provided [`Action::run`]
//! marks the elements busy, calls `start_action` and then drives
//! `action_loop` either inline or on the worker pool.

use crate::element::{OperationToken, PoolElement};
use crate::executor::WorkerPool;
use crate::pool_controller::PoolController;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sardana_core::{
    Axis, ControllerId, ElementId, PoolConfig, PoolError, PoolResult, SardanaValue, StateInfo,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// An element registered in an action.
pub struct ActionItem<E> {
    pub id: ElementId,
    pub name: String,
    pub axis: Axis,
    pub controller: Arc<PoolController>,
    element: Weak<E>,
}

impl<E> Clone for ActionItem<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            axis: self.axis,
            controller: Arc::clone(&self.controller),
            element: Weak::clone(&self.element),
        }
    }
}

impl<E> ActionItem<E> {
    /// The element, if it still exists.
    pub fn element(&self) -> Option<Arc<E>> {
        self.element.upgrade()
    }
}

struct Partition {
    controller: Arc<PoolController>,
    elements: BTreeSet<ElementId>,
}

/// One controller and the `(element, axis)` pairs to ask it about.
type Batch = (Arc<PoolController>, Vec<(ElementId, Axis)>);

#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Stop,
    Abort,
    EmergencyBreak,
}

impl Interrupt {
    fn label(self) -> &'static str {
        match self {
            Interrupt::Stop => "stop",
            Interrupt::Abort => "abort",
            Interrupt::EmergencyBreak => "emergency break",
        }
    }

    fn mark<E: PoolElement>(self, element: &E) {
        match self {
            Interrupt::Abort => element.core().mark_aborted(),
            Interrupt::Stop | Interrupt::EmergencyBreak => element.core().mark_stopped(),
        }
    }
}

/// Element set, controller partition and run bookkeeping of an action.
pub struct PoolAction<E: PoolElement> {
    name: String,
    worker_pool: WorkerPool,
    config: PoolConfig,
    elements: RwLock<BTreeMap<ElementId, ActionItem<E>>>,
    partitions: RwLock<BTreeMap<ControllerId, Partition>>,
    running: AtomicBool,
    stopped: AtomicBool,
    aborted: AtomicBool,
    interrupted_at: Mutex<Option<Instant>>,
    finished: watch::Sender<bool>,
    context: Mutex<Vec<(ElementId, Weak<E>, OperationToken)>>,
}

impl<E: PoolElement> std::fmt::Debug for PoolAction<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolAction")
            .field("name", &self.name)
            .field("elements", &self.elements.read().len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl<E: PoolElement> PoolAction<E> {
    pub fn new(name: impl Into<String>, worker_pool: WorkerPool, config: PoolConfig) -> Self {
        let (finished, _rx) = watch::channel(true);
        Self {
            name: name.into(),
            worker_pool,
            config,
            elements: RwLock::new(BTreeMap::new()),
            partitions: RwLock::new(BTreeMap::new()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            interrupted_at: Mutex::new(None),
            finished,
            context: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.worker_pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    // -------------------------------------------------------------------------
    // Element set
    // -------------------------------------------------------------------------

    /// Adds an element. Refused while the action runs.
    pub fn add_element(&self, element: &Arc<E>) -> PoolResult<()> {
        if self.is_running() {
            return Err(PoolError::ActionBusy(self.name.clone()));
        }
        let controller = Arc::clone(element.controller());
        let item = ActionItem {
            id: element.id(),
            name: element.name().to_string(),
            axis: element.axis(),
            controller: Arc::clone(&controller),
            element: Arc::downgrade(element),
        };
        self.elements.write().insert(item.id, item);
        self.partitions
            .write()
            .entry(controller.id())
            .or_insert_with(|| Partition {
                controller,
                elements: BTreeSet::new(),
            })
            .elements
            .insert(element.id());
        Ok(())
    }

    /// Removes an element. Refused while the action runs; fails with
    /// [`PoolError::ElementNotFound`] if it is not part of the action.
    pub fn remove_element(&self, element: &E) -> PoolResult<()> {
        if self.is_running() {
            return Err(PoolError::ActionBusy(self.name.clone()));
        }
        let removed = self
            .elements
            .write()
            .remove(&element.id())
            .ok_or_else(|| PoolError::ElementNotFound(element.name().to_string()))?;
        let mut partitions = self.partitions.write();
        let ctrl_id = removed.controller.id();
        let now_empty = partitions
            .get_mut(&ctrl_id)
            .map(|p| {
                p.elements.remove(&removed.id);
                p.elements.is_empty()
            })
            .unwrap_or(false);
        if now_empty {
            partitions.remove(&ctrl_id);
        }
        Ok(())
    }

    pub fn contains(&self, id: ElementId) -> bool {
        self.elements.read().contains_key(&id)
    }

    pub fn get_element(&self, id: ElementId) -> Option<Arc<E>> {
        self.elements.read().get(&id).and_then(ActionItem::element)
    }

    pub fn item(&self, id: ElementId) -> Option<ActionItem<E>> {
        self.elements.read().get(&id).cloned()
    }

    /// Live elements in id order.
    pub fn elements(&self) -> Vec<Arc<E>> {
        self.elements
            .read()
            .values()
            .filter_map(ActionItem::element)
            .collect()
    }

    pub fn element_ids(&self) -> BTreeSet<ElementId> {
        self.elements.read().keys().copied().collect()
    }

    /// Controllers of the partition in id order.
    pub fn controllers(&self) -> Vec<Arc<PoolController>> {
        self.partitions
            .read()
            .values()
            .map(|p| Arc::clone(&p.controller))
            .collect()
    }

    fn batches(&self, only: Option<&BTreeSet<ElementId>>) -> Vec<Batch> {
        let elements = self.elements.read();
        self.partitions
            .read()
            .values()
            .filter_map(|partition| {
                let members: Vec<(ElementId, Axis)> = partition
                    .elements
                    .iter()
                    .filter(|id| only.map_or(true, |set| set.contains(id)))
                    .filter_map(|id| elements.get(id).map(|item| (item.id, item.axis)))
                    .collect();
                (!members.is_empty()).then(|| (Arc::clone(&partition.controller), members))
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// State of every element of the action.
    pub async fn read_state_info(&self, serial: bool) -> BTreeMap<ElementId, StateInfo> {
        self.read_state_info_of(None, serial).await
    }

    /// State of the given elements (all if `None`), one batched read per
    /// controller. Every requested element gets an entry.
    pub async fn read_state_info_of(
        &self,
        only: Option<&BTreeSet<ElementId>>,
        serial: bool,
    ) -> BTreeMap<ElementId, StateInfo> {
        let batches = self.batches(only);
        let tasks: Vec<_> = batches
            .iter()
            .map(|(controller, members)| {
                let controller = Arc::clone(controller);
                let axes: Vec<Axis> = members.iter().map(|(_, axis)| *axis).collect();
                async move { controller.read_axis_states(&axes).await }
            })
            .collect();
        let results = self.dispatch(tasks, serial).await;

        let mut states = BTreeMap::new();
        for ((controller, members), result) in batches.into_iter().zip(results) {
            match result {
                Some(Ok(mut by_axis)) => {
                    for (id, axis) in members {
                        let info = by_axis.remove(&axis).unwrap_or_else(|| {
                            StateInfo::fault(format!(
                                "{} returned no state for axis {}",
                                controller.name(),
                                axis
                            ))
                        });
                        states.insert(id, info);
                    }
                }
                Some(Err(e)) => {
                    warn!(
                        action = %self.name,
                        controller = %controller.name(),
                        error = %format!("{:#}", e),
                        "state read failed"
                    );
                    let status = controller.fault_status(&e);
                    for (id, _) in members {
                        states.insert(id, StateInfo::fault(status.clone()));
                    }
                }
                None => {
                    let status = format!(
                        "Unexpected controller error:\n{} state read panicked",
                        controller.name()
                    );
                    for (id, _) in members {
                        states.insert(id, StateInfo::fault(status.clone()));
                    }
                }
            }
        }
        states
    }

    /// Value of every element of the action.
    pub async fn read_value(
        &self,
        serial: bool,
    ) -> PoolResult<BTreeMap<ElementId, SardanaValue<f64>>> {
        self.read_value_of(None, serial).await
    }

    /// Values of the given elements (all if `None`). The first controller
    /// failure is returned.
    pub async fn read_value_of(
        &self,
        only: Option<&BTreeSet<ElementId>>,
        serial: bool,
    ) -> PoolResult<BTreeMap<ElementId, SardanaValue<f64>>> {
        let batches = self.batches(only);
        let tasks: Vec<_> = batches
            .iter()
            .map(|(controller, members)| {
                let controller = Arc::clone(controller);
                let axes: Vec<Axis> = members.iter().map(|(_, axis)| *axis).collect();
                async move { controller.read_axis_values(&axes).await }
            })
            .collect();
        let results = self.dispatch(tasks, serial).await;

        let mut values = BTreeMap::new();
        for ((controller, members), result) in batches.into_iter().zip(results) {
            let mut by_axis = match result {
                Some(Ok(by_axis)) => by_axis,
                Some(Err(e)) => return Err(PoolError::driver(controller.name(), "read_value", e)),
                None => {
                    return Err(PoolError::driver(
                        controller.name(),
                        "read_value",
                        anyhow::anyhow!("controller task panicked"),
                    ))
                }
            };
            for (id, axis) in members {
                if let Some(value) = by_axis.remove(&axis) {
                    values.insert(id, value);
                }
            }
        }
        Ok(values)
    }

    async fn dispatch<T, F>(&self, tasks: Vec<F>, serial: bool) -> Vec<Option<T>>
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if serial {
            let mut results = Vec::with_capacity(tasks.len());
            for task in tasks {
                results.push(Some(task.await));
            }
            results
        } else {
            self.worker_pool.run_all(tasks).await
        }
    }

    // -------------------------------------------------------------------------
    // Stop / abort
    // -------------------------------------------------------------------------

    /// Stops one element, or every element of the action.
    pub async fn stop(&self, element: Option<&E>) -> PoolResult<()> {
        self.stopped.store(true, Ordering::Release);
        self.note_interrupt();
        self.interrupt(Interrupt::Stop, element).await
    }

    /// Aborts one element, or every element of the action.
    ///
    /// Does not wait for the elements to settle; the running loop observes the
    /// effect on its next poll.
    pub async fn abort(&self, element: Option<&E>) -> PoolResult<()> {
        self.aborted.store(true, Ordering::Release);
        self.note_interrupt();
        self.interrupt(Interrupt::Abort, element).await
    }

    /// Stop with abort fallback on every controller of the action.
    pub async fn emergency_break(&self) -> PoolResult<()> {
        self.stopped.store(true, Ordering::Release);
        self.note_interrupt();
        self.interrupt(Interrupt::EmergencyBreak, None).await
    }

    fn note_interrupt(&self) {
        self.interrupted_at.lock().get_or_insert_with(Instant::now);
    }

    async fn interrupt(&self, kind: Interrupt, element: Option<&E>) -> PoolResult<()> {
        let batches = match element {
            Some(element) => vec![(
                Arc::clone(element.controller()),
                vec![(element.id(), element.axis())],
            )],
            None => self.batches(None),
        };

        // serial fan-out in controller id order
        let mut errors = Vec::new();
        for (controller, members) in batches {
            match element {
                Some(element) => kind.mark(element),
                None => members
                    .iter()
                    .filter_map(|(id, _)| self.get_element(*id))
                    .for_each(|element| kind.mark(&*element)),
            }
            let axes: Vec<Axis> = members.iter().map(|(_, axis)| *axis).collect();
            debug!(action = %self.name, controller = %controller.name(), ?axes, "{}", kind.label());
            let result = match kind {
                Interrupt::Stop => controller.stop_axes(&axes, element.is_none()).await,
                Interrupt::Abort => controller.abort_axes(&axes, element.is_none()).await,
                Interrupt::EmergencyBreak => controller.emergency_break(&axes).await,
            };
            if let Err(e) = result {
                error!(
                    action = %self.name,
                    controller = %controller.name(),
                    error = %format!("{:#}", e),
                    "{} failed",
                    kind.label()
                );
                errors.push(PoolError::driver(controller.name(), kind.label(), e));
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 if element.is_some() => Err(errors.remove(0)),
            _ => Err(PoolError::OperationFailed {
                operation: kind.label(),
                errors,
            }),
        }
    }

    pub fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// True once a stop or abort was issued more than `abort_timeout` ago.
    pub fn interrupt_expired(&self) -> bool {
        self.interrupted_at
            .lock()
            .map_or(false, |at| at.elapsed() >= self.config.abort_timeout())
    }

    // -------------------------------------------------------------------------
    // Operation context
    // -------------------------------------------------------------------------

    /// Marks every element as busy with this action, all or nothing.
    pub fn enter_operation(
        &self,
        elements: &[Arc<E>],
    ) -> PoolResult<Vec<(ElementId, Weak<E>, OperationToken)>> {
        let mut entered = Vec::with_capacity(elements.len());
        for element in elements {
            match element.core().set_operation(&self.name) {
                Ok(token) => entered.push((element.id(), Arc::downgrade(element), token)),
                Err(e) => {
                    for (_, weak, token) in entered {
                        if let Some(element) = weak.upgrade() {
                            element.core().release_operation(token);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(entered)
    }

    /// Starts a run holding the given operation marks.
    pub fn begin(&self, entered: Vec<(ElementId, Weak<E>, OperationToken)>) {
        *self.context.lock() = entered;
        self.stopped.store(false, Ordering::Release);
        self.aborted.store(false, Ordering::Release);
        *self.interrupted_at.lock() = None;
        self.running.store(true, Ordering::Release);
        self.finished.send_replace(false);
    }

    /// Releases the operation mark of one element before the run ends.
    pub fn release_operation(&self, id: ElementId) -> bool {
        let entry = {
            let mut context = self.context.lock();
            context
                .iter()
                .position(|(eid, _, _)| *eid == id)
                .map(|index| context.remove(index))
        };
        match entry {
            Some((_, weak, token)) => weak
                .upgrade()
                .map_or(false, |element| element.core().release_operation(token)),
            None => false,
        }
    }

    /// Ends the run: releases every remaining mark and wakes waiters.
    pub fn finish(&self) {
        let remaining = std::mem::take(&mut *self.context.lock());
        for (_, weak, token) in remaining {
            if let Some(element) = weak.upgrade() {
                element.core().release_operation(token);
            }
        }
        self.running.store(false, Ordering::Release);
        self.finished.send_replace(true);
        debug!(action = %self.name, "action finished");
    }

    /// Resolves when no run is in progress.
    pub async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        // the sender lives in self
        let _ = rx.wait_for(|finished| *finished).await;
    }
}

/// Finishes the run of an action when dropped, even if the loop panics.
struct RunGuard<A: Action>(Arc<A>);

impl<A: Action> Drop for RunGuard<A> {
    fn drop(&mut self) {
        self.0.core().finish();
    }
}

/// A concrete operation: how to start it and how to follow it.
#[async_trait]
pub trait Action: Send + Sync + Sized + 'static {
    type Element: PoolElement;
    /// What one run operates on, e.g. motion targets per element.
    type Items: Send + 'static;

    fn core(&self) -> &PoolAction<Self::Element>;

    /// Elements that a run over `items` marks as busy.
    fn involved(&self, items: &Self::Items) -> PoolResult<Vec<Arc<Self::Element>>>;

    /// Ordered hardware start. Must leave every started element in its
    /// in-progress state before returning.
    async fn start_action(&self, items: Self::Items) -> PoolResult<()>;

    /// Polls until the operation is over.
    async fn action_loop(self: Arc<Self>) -> PoolResult<()>;

    /// Starts the action, then runs the loop inline (`synch`) or on the
    /// worker pool. Start errors are returned; loop errors only when `synch`.
    async fn run(self: Arc<Self>, items: Self::Items, synch: bool) -> PoolResult<()> {
        let elements = self.involved(&items)?;
        let entered = self.core().enter_operation(&elements)?;
        // a previous run whose elements are all released is only winding down
        self.core().wait_finished().await;
        self.core().begin(entered);
        let guard = RunGuard(Arc::clone(&self));

        if let Err(e) = self.start_action(items).await {
            drop(guard);
            return Err(e);
        }

        if synch {
            let result = Arc::clone(&self).action_loop().await;
            drop(guard);
            return result;
        }

        let name = self.core().name().to_string();
        let worker_pool = self.core().worker_pool().clone();
        worker_pool.spawn(async move {
            let _guard = guard;
            if let Err(e) = self.action_loop().await {
                error!(action = %name, error = %e, "action loop failed");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementCore;
    use sardana_core::{ElementType, State};
    use sardana_driver_mock::{ControllerCall, DummyMotorController};
    use tokio::runtime::Handle;

    struct AxisElement {
        core: ElementCore,
        controller: Arc<PoolController>,
        axis: Axis,
    }

    impl PoolElement for AxisElement {
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

    struct Fixture {
        action: PoolAction<AxisElement>,
        elements: Vec<Arc<AxisElement>>,
        mocks: Vec<DummyMotorController>,
    }

    /// Controller A with axes 1 and 2, controller B with axis 1.
    async fn fixture(pool: WorkerPool) -> Fixture {
        let action = PoolAction::new("test", pool, PoolConfig::default());
        let mut elements = Vec::new();
        let mut mocks = Vec::new();
        let mut next_id = 1;
        for (ctrl_id, axes) in [(1u64, vec![1u32, 2]), (2, vec![1])] {
            let mock = DummyMotorController::new();
            let controller = Arc::new(PoolController::new(
                ControllerId(ctrl_id),
                format!("ctrl{}", ctrl_id),
                Box::new(mock.clone()),
            ));
            for axis in axes {
                controller.add_axis(axis).await.unwrap();
                let element = Arc::new(AxisElement {
                    core: ElementCore::new(
                        ElementId(next_id),
                        format!("e{}", next_id),
                        ElementType::Motor,
                    ),
                    controller: Arc::clone(&controller),
                    axis,
                });
                next_id += 1;
                action.add_element(&element).unwrap();
                elements.push(element);
            }
            mocks.push(mock);
        }
        Fixture {
            action,
            elements,
            mocks,
        }
    }

    #[tokio::test]
    async fn test_one_read_per_controller() {
        let f = fixture(WorkerPool::current(4).unwrap()).await;
        let states = f.action.read_state_info(false).await;
        assert_eq!(states.len(), 3);
        assert_eq!(f.mocks[0].calls().count(|c| *c == ControllerCall::StateAll), 1);
        assert_eq!(f.mocks[1].calls().count(|c| *c == ControllerCall::StateAll), 1);
    }

    #[tokio::test]
    async fn test_failed_controller_faults_only_its_elements() {
        for pool in [
            WorkerPool::current(4).unwrap(),
            WorkerPool::inline(Handle::current()),
        ] {
            let f = fixture(pool).await;
            f.mocks[0].fail_next("pre_state_all");
            let states = f.action.read_state_info(false).await;
            assert_eq!(states.len(), 3);
            assert_eq!(states[&ElementId(1)].state, State::Fault);
            assert_eq!(states[&ElementId(2)].state, State::Fault);
            assert!(states[&ElementId(1)]
                .status_str()
                .contains("PreStateAll"));
            assert_eq!(states[&ElementId(3)].state, State::On);
        }
    }

    #[tokio::test]
    async fn test_serial_read_matches_concurrent() {
        let f = fixture(WorkerPool::current(4).unwrap()).await;
        let serial = f.action.read_state_info(true).await;
        let concurrent = f.action.read_state_info(false).await;
        assert_eq!(serial, concurrent);
    }

    #[tokio::test]
    async fn test_value_read_propagates_failure() {
        let f = fixture(WorkerPool::current(4).unwrap()).await;
        f.mocks[1].fail_next("read_all");
        assert!(matches!(
            f.action.read_value(false).await,
            Err(PoolError::Driver { .. })
        ));
        let values = f.action.read_value(false).await.unwrap();
        assert_eq!(values.len(), 3);
    }

    #[tokio::test]
    async fn test_subset_read() {
        let f = fixture(WorkerPool::current(4).unwrap()).await;
        let only: BTreeSet<_> = [ElementId(3)].into_iter().collect();
        let states = f.action.read_state_info_of(Some(&only), false).await;
        assert_eq!(states.keys().copied().collect::<Vec<_>>(), vec![ElementId(3)]);
        assert_eq!(f.mocks[0].calls().count(|c| *c == ControllerCall::StateAll), 0);
    }

    #[tokio::test]
    async fn test_remove_unknown_element_names_it() {
        let f = fixture(WorkerPool::current(1).unwrap()).await;
        f.action.remove_element(&f.elements[2]).unwrap();
        let err = f.action.remove_element(&f.elements[2]).unwrap_err();
        assert_eq!(err.to_string(), "Element 'e3' not found");
        assert_eq!(f.action.controllers().len(), 1);
    }

    #[tokio::test]
    async fn test_membership_frozen_while_running() {
        let f = fixture(WorkerPool::current(1).unwrap()).await;
        let entered = f.action.enter_operation(&f.elements).unwrap();
        f.action.begin(entered);
        assert!(matches!(
            f.action.remove_element(&f.elements[0]),
            Err(PoolError::ActionBusy(_))
        ));
        f.action.finish();
        assert!(f.action.remove_element(&f.elements[0]).is_ok());
    }

    #[tokio::test]
    async fn test_enter_operation_rolls_back() {
        let f = fixture(WorkerPool::current(1).unwrap()).await;
        let _held = f.elements[1].core().set_operation("other").unwrap();
        assert!(matches!(
            f.action.enter_operation(&f.elements),
            Err(PoolError::AlreadyInOperation(_))
        ));
        assert!(!f.elements[0].core().is_in_operation());
    }

    #[tokio::test]
    async fn test_finish_releases_marks() {
        let f = fixture(WorkerPool::current(1).unwrap()).await;
        let entered = f.action.enter_operation(&f.elements).unwrap();
        f.action.begin(entered);
        assert!(f.action.release_operation(ElementId(1)));
        assert!(!f.elements[0].core().is_in_operation());
        assert!(f.elements[1].core().is_in_operation());
        f.action.finish();
        assert!(f.elements.iter().all(|e| !e.core().is_in_operation()));
        f.action.wait_finished().await;
    }

    #[tokio::test]
    async fn test_abort_all_is_serial_in_controller_order() {
        let f = fixture(WorkerPool::current(4).unwrap()).await;
        f.action.abort(None).await.unwrap();
        assert!(f.action.was_aborted());
        assert!(f.elements.iter().all(|e| e.core().was_aborted()));
        assert_eq!(
            f.mocks[0].calls().calls(),
            vec![
                ControllerCall::AddDevice(1),
                ControllerCall::AddDevice(2),
                ControllerCall::AbortOne(1),
                ControllerCall::AbortOne(2),
                ControllerCall::AbortAll,
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_aggregates_failures() {
        let f = fixture(WorkerPool::current(4).unwrap()).await;
        f.mocks[0].fail_next("stop_all");
        f.mocks[1].fail_next("stop_all");
        match f.action.stop(None).await {
            Err(PoolError::OperationFailed { operation, errors }) => {
                assert_eq!(operation, "stop");
                assert_eq!(errors.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_single_element() {
        let f = fixture(WorkerPool::current(4).unwrap()).await;
        f.action.abort(Some(&f.elements[2])).await.unwrap();
        assert!(f.elements[2].core().was_aborted());
        assert!(!f.elements[0].core().was_aborted());
        assert_eq!(f.mocks[0].calls().count(|c| *c == ControllerCall::AbortAll), 0);
        assert_eq!(f.mocks[1].calls().count(|c| *c == ControllerCall::AbortOne(1)), 1);
        assert_eq!(f.mocks[1].calls().count(|c| *c == ControllerCall::AbortAll), 0);
    }

    #[tokio::test]
    async fn test_single_element_interrupt_leaves_controller_siblings_alone() {
        let f = fixture(WorkerPool::current(4).unwrap()).await;
        f.mocks[0].calls().clear();
        f.action.abort(Some(&f.elements[0])).await.unwrap();
        f.action.stop(Some(&f.elements[0])).await.unwrap();
        assert_eq!(
            f.mocks[0].calls().calls(),
            vec![ControllerCall::AbortOne(1), ControllerCall::StopOne(1)]
        );
        assert!(!f.elements[1].core().was_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_expiry() {
        let f = fixture(WorkerPool::current(1).unwrap()).await;
        assert!(!f.action.interrupt_expired());
        f.action.stop(None).await.unwrap();
        assert!(!f.action.interrupt_expired());
        tokio::time::advance(f.action.config().abort_timeout()).await;
        assert!(f.action.interrupt_expired());
    }
}
