//! Bounded task execution for per-controller fan-out.
//!
//! Actions dispatch one task per controller when they read states or values.
//! [`WorkerPool`] bounds how many of those tasks execute at once with a
//! semaphore, and [`OperationInfo`] is the countdown latch the dispatcher
//! waits on. Every dispatched task holds an [`OperationGuard`] that counts
//! down when dropped, so a task that fails or panics still releases the
//! waiter.
//!
//! The pool is injected into every action instead of living in a global.
//! Tests use [`WorkerPool::inline`], which runs the tasks one after the other
//! on the caller's task.

use futures::FutureExt;
use parking_lot::Mutex;
use sardana_core::{PoolError, PoolResult};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Concurrent,
    Inline,
}

struct Inner {
    handle: Handle,
    permits: Arc<Semaphore>,
    size: usize,
    mode: Mode,
}

/// Shared executor for action loops and controller tasks.
///
/// Cloning is cheap; clones share the same permits.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.inner.size)
            .field("mode", &self.inner.mode)
            .field("available", &self.inner.permits.available_permits())
            .finish()
    }
}

impl WorkerPool {
    /// Creates a pool running at most `size` controller tasks at once.
    pub fn new(handle: Handle, size: usize) -> Self {
        Self::with_mode(handle, size, Mode::Concurrent)
    }

    /// Creates a pool on the runtime of the calling task.
    pub fn current(size: usize) -> PoolResult<Self> {
        let handle = Handle::try_current()
            .map_err(|e| PoolError::Configuration(format!("no tokio runtime available: {}", e)))?;
        Ok(Self::new(handle, size))
    }

    /// Pool whose controller tasks run sequentially on the caller's task.
    ///
    /// Action loops started with `synch = false` are still spawned on `handle`.
    pub fn inline(handle: Handle) -> Self {
        Self::with_mode(handle, 1, Mode::Inline)
    }

    fn with_mode(handle: Handle, size: usize, mode: Mode) -> Self {
        let size = size.max(1);
        Self {
            inner: Arc::new(Inner {
                handle,
                permits: Arc::new(Semaphore::new(size)),
                size,
                mode,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn is_inline(&self) -> bool {
        self.inner.mode == Mode::Inline
    }

    /// Spawns a long-running task (an action loop). Not bounded by the permits.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(future)
    }

    /// Runs every task and waits for all of them.
    ///
    /// Results come back in task order. A task that panicked yields `None`;
    /// its siblings are unaffected.
    pub async fn run_all<T, F>(&self, tasks: Vec<F>) -> Vec<Option<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        match self.inner.mode {
            Mode::Inline => {
                let mut results = Vec::with_capacity(tasks.len());
                for task in tasks {
                    let result = AssertUnwindSafe(task).catch_unwind().await.ok();
                    if result.is_none() {
                        error!("controller task panicked");
                    }
                    results.push(result);
                }
                results
            }
            Mode::Concurrent => {
                let latch = OperationInfo::new();
                let slots: Arc<Mutex<Vec<Option<T>>>> =
                    Arc::new(Mutex::new((0..tasks.len()).map(|_| None).collect()));

                for (index, task) in tasks.into_iter().enumerate() {
                    let guard = latch.start_one();
                    let permits = Arc::clone(&self.inner.permits);
                    let slots = Arc::clone(&slots);
                    self.inner.handle.spawn(async move {
                        let _guard = guard;
                        // the semaphore is never closed
                        let _permit = permits.acquire_owned().await.ok();
                        let value = task.await;
                        slots.lock()[index] = Some(value);
                    });
                }

                latch.wait().await;
                let mut slots = slots.lock();
                let results = std::mem::take(&mut *slots);
                if results.iter().any(Option::is_none) {
                    error!("controller task panicked");
                }
                results
            }
        }
    }
}

/// Countdown latch over the tasks of one dispatch.
#[derive(Debug, Clone)]
pub struct OperationInfo {
    tx: Arc<watch::Sender<usize>>,
}

impl Default for OperationInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationInfo {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Registers one pending task. The count goes down when the guard drops.
    pub fn start_one(&self) -> OperationGuard {
        self.tx.send_modify(|pending| *pending += 1);
        OperationGuard {
            tx: Arc::clone(&self.tx),
        }
    }

    pub fn pending(&self) -> usize {
        *self.tx.borrow()
    }

    /// Resolves once every registered task has finished.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|pending| *pending == 0).await;
    }
}

/// Held by a dispatched task; counts the latch down on drop.
#[derive(Debug)]
pub struct OperationGuard {
    tx: Arc<watch::Sender<usize>>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.tx
            .send_modify(|pending| *pending = pending.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_keep_task_order() {
        let pool = WorkerPool::current(4).unwrap();
        let tasks: Vec<_> = (0..5u64)
            .map(|i| async move {
                tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                i * 10
            })
            .collect();
        let results = pool.run_all(tasks).await;
        assert_eq!(
            results,
            vec![Some(0), Some(10), Some(20), Some(30), Some(40)]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_task_still_counts_down() {
        let pool = WorkerPool::current(2).unwrap();
        let tasks: Vec<_> = (1..=3u32)
            .map(|i| async move {
                if i == 2 {
                    panic!("driver blew up");
                }
                i
            })
            .collect();
        let results = pool.run_all(tasks).await;
        assert_eq!(results, vec![Some(1), None, Some(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permits_bound_concurrency() {
        let pool = WorkerPool::current(2).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .collect();
        pool.run_all(tasks).await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_inline_runs_in_sequence() {
        let pool = WorkerPool::inline(Handle::current());
        let order = Arc::new(Mutex::new(Vec::new()));
        let tasks: Vec<_> = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().push(i);
                    i
                }
            })
            .collect();
        assert_eq!(pool.run_all(tasks).await, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_latch_waits_for_guards() {
        let latch = OperationInfo::new();
        let first = latch.start_one();
        let second = latch.start_one();
        assert_eq!(latch.pending(), 2);

        let waiter = tokio::spawn({
            let latch = latch.clone();
            async move { latch.wait().await }
        });
        drop(first);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(second);
        waiter.await.unwrap();
        assert_eq!(latch.pending(), 0);
    }

    #[tokio::test]
    async fn test_empty_dispatch_returns_immediately() {
        let pool = WorkerPool::current(1).unwrap();
        let results: Vec<Option<u8>> = pool
            .run_all(Vec::<std::future::Ready<u8>>::new())
            .await;
        assert!(results.is_empty());
    }
}
