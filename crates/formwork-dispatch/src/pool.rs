//! Worker Pool
//!
//! Worker threads for queued work packages, in one of two strategies:
//! - Fixed: a set number of persistent workers fed from an unbounded backlog
//! - Unbounded: workers created on demand, idle ones retired after a keep-alive
//!   window, tasks handed directly to an idle worker or a new one
//!
//! Workers are created lazily, on the first task that needs them.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{DispatcherConfig, WorkerThreads};
use crate::error::{PoolError, panic_message};
use crate::package::{InvokerCallStack, WorkPackage};
use crate::queue::{Task, TaskQueue};

thread_local! {
    /// Record of the pool worker running on this thread, if any
    static CURRENT_WORKER: RefCell<Option<Arc<WorkerRecord>>> = const { RefCell::new(None) };
}

/// Record of the worker running the current thread, `None` off-pool
pub fn current_worker() -> Option<Arc<WorkerRecord>> {
    CURRENT_WORKER.with(|current| current.borrow().clone())
}

/// Worker identity; ids increase monotonically and are never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a pool-owned thread plus the package it is busy with
///
/// The package reference is weak and only used for diagnostics.
pub struct WorkerRecord {
    id: WorkerId,
    name: String,
    current: Mutex<Option<Weak<WorkPackage>>>,
}

impl WorkerRecord {
    fn new(id: WorkerId, name: String) -> Self {
        Self {
            id,
            name,
            current: Mutex::new(None),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn slot(&self) -> MutexGuard<'_, Option<Weak<WorkPackage>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_package(&self, package: &Arc<WorkPackage>) {
        *self.slot() = Some(Arc::downgrade(package));
    }

    pub(crate) fn clear_package(&self) {
        *self.slot() = None;
    }

    /// Package currently running on this worker
    pub fn current_package(&self) -> Option<Arc<WorkPackage>> {
        self.slot().as_ref().and_then(Weak::upgrade)
    }

    /// Submitting call stack of the current package, when it was traced
    pub fn call_stack(&self) -> Option<Arc<InvokerCallStack>> {
        self.current_package()
            .and_then(|package| package.call_stack().cloned())
    }
}

impl fmt::Debug for WorkerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("busy", &self.current_package().is_some())
            .finish()
    }
}

impl fmt::Display for WorkerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ============================================================================
// Direct hand-off for the unbounded strategy
// ============================================================================

struct HandOffState {
    idle: usize,
    pending: VecDeque<Task>,
    shutdown: bool,
}

/// Rendezvous between submitters and idle workers
///
/// A task is only accepted when an idle worker is waiting to take it, so
/// nothing is ever buffered beyond the idle workers.
struct HandOff {
    state: Mutex<HandOffState>,
    available: Condvar,
}

impl HandOff {
    fn new() -> Self {
        Self {
            state: Mutex::new(HandOffState {
                idle: 0,
                pending: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandOffState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give the task to an idle worker, or hand it back if none is free
    fn offer(&self, task: Task) -> Result<(), Task> {
        let mut state = self.lock();
        if state.shutdown || state.idle <= state.pending.len() {
            return Err(task);
        }
        state.pending.push_back(task);
        self.available.notify_one();
        Ok(())
    }

    /// Wait up to `keep_alive` for a task; `None` means retire
    fn take(&self, keep_alive: Duration) -> Option<Task> {
        let deadline = Instant::now() + keep_alive;
        let mut state = self.lock();
        state.idle += 1;

        let task = loop {
            if state.shutdown {
                break None;
            }
            if let Some(task) = state.pending.pop_front() {
                break Some(task);
            }
            let now = Instant::now();
            if now >= deadline {
                break None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        };

        state.idle -= 1;
        task
    }

    fn shutdown(&self) -> usize {
        let dropped = {
            let mut state = self.lock();
            state.shutdown = true;
            self.available.notify_all();
            std::mem::take(&mut state.pending)
        };
        dropped.len()
    }

    fn pending(&self) -> usize {
        self.lock().pending.len()
    }
}

// ============================================================================
// Pool
// ============================================================================

enum Strategy {
    Fixed {
        size: usize,
        spawned: AtomicUsize,
        backlog: TaskQueue,
    },
    Unbounded {
        keep_alive: Duration,
        handoff: HandOff,
    },
}

struct PoolInner {
    strategy: Strategy,
    name_prefix: String,
    next_id: AtomicU64,
    created: AtomicUsize,
    alive: AtomicUsize,
    shutdown: AtomicBool,
}

impl PoolInner {
    fn spawn_worker(self: &Arc<Self>, first: Task) -> Result<(), PoolError> {
        let id = WorkerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let record = Arc::new(WorkerRecord::new(id, format!("{} {}", self.name_prefix, id)));
        let pool = Arc::clone(self);
        let worker = Arc::clone(&record);

        thread::Builder::new()
            .name(record.name().to_string())
            .spawn(move || pool.worker_main(worker, first))
            .map_err(PoolError::Spawn)?;

        self.created.fetch_add(1, Ordering::SeqCst);
        self.alive.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("{}: created", record);
        Ok(())
    }

    fn worker_main(&self, record: Arc<WorkerRecord>, first: Task) {
        CURRENT_WORKER.with(|current| *current.borrow_mut() = Some(Arc::clone(&record)));

        run_task(&record, first);
        while let Some(task) = self.next_task() {
            run_task(&record, task);
        }

        CURRENT_WORKER.with(|current| *current.borrow_mut() = None);
        self.alive.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!("{}: retired", record);
    }

    fn next_task(&self) -> Option<Task> {
        match &self.strategy {
            Strategy::Fixed { backlog, .. } => backlog.wait_for_task(),
            Strategy::Unbounded { keep_alive, handoff } => handoff.take(*keep_alive),
        }
    }
}

// A panicking task must not take its worker down with it
fn run_task(record: &WorkerRecord, task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        tracing::error!("{}: task panicked: {}", record, panic_message(payload.as_ref()));
    }
}

/// Pool of worker threads executing boxed tasks
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("strategy", &self.strategy_name())
            .field("created_workers", &self.created_workers())
            .field("live_workers", &self.live_workers())
            .field("pending_tasks", &self.pending_tasks())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl WorkerPool {
    fn with_strategy(strategy: Strategy, name_prefix: &str) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                strategy,
                name_prefix: name_prefix.to_string(),
                next_id: AtomicU64::new(0),
                created: AtomicUsize::new(0),
                alive: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Fixed-size pool with an unbounded backlog
    pub fn fixed(size: NonZeroUsize, name_prefix: &str) -> Self {
        Self::with_strategy(
            Strategy::Fixed {
                size: size.get(),
                spawned: AtomicUsize::new(0),
                backlog: TaskQueue::new(),
            },
            name_prefix,
        )
    }

    /// On-demand pool with direct hand-off and idle retirement
    pub fn unbounded(keep_alive: Duration, name_prefix: &str) -> Self {
        Self::with_strategy(
            Strategy::Unbounded {
                keep_alive,
                handoff: HandOff::new(),
            },
            name_prefix,
        )
    }

    /// Pool for the configured strategy; `None` when workers are disabled
    pub fn from_config(config: &DispatcherConfig) -> Option<Self> {
        match config.worker_threads {
            WorkerThreads::Disabled => None,
            WorkerThreads::Unbounded => {
                Some(Self::unbounded(config.keep_alive, &config.thread_name_prefix))
            }
            WorkerThreads::Fixed(size) => Some(Self::fixed(size, &config.thread_name_prefix)),
        }
    }

    /// Run a task on a worker
    ///
    /// Rejected with `PoolError::ShutDown` once the pool is shut down.
    pub fn execute<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(PoolError::ShutDown);
        }

        let task: Task = Box::new(task);
        match &self.inner.strategy {
            Strategy::Fixed {
                size,
                spawned,
                backlog,
            } => {
                let claimed = spawned
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < *size).then_some(n + 1)
                    })
                    .is_ok();
                if claimed {
                    return self.inner.spawn_worker(task).inspect_err(|_| {
                        spawned.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                backlog.push(task).map_err(|_| PoolError::ShutDown)
            }
            Strategy::Unbounded { handoff, .. } => match handoff.offer(task) {
                Ok(()) => Ok(()),
                Err(task) => self.inner.spawn_worker(task),
            },
        }
    }

    /// Stop accepting tasks and wake every idle worker
    ///
    /// Running tasks finish on their own; queued tasks are dropped and their
    /// number returned. Never blocks on worker threads.
    pub fn shutdown_now(&self) -> usize {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return 0;
        }

        let dropped = match &self.inner.strategy {
            Strategy::Fixed { backlog, .. } => backlog.shutdown(),
            Strategy::Unbounded { handoff, .. } => handoff.shutdown(),
        };
        tracing::debug!("Worker pool shut down, {} queued tasks dropped", dropped);
        dropped
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Worker threads ever created by this pool
    pub fn created_workers(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    /// Worker threads currently alive
    pub fn live_workers(&self) -> usize {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// Tasks accepted but not yet started
    pub fn pending_tasks(&self) -> usize {
        match &self.inner.strategy {
            Strategy::Fixed { backlog, .. } => backlog.len(),
            Strategy::Unbounded { handoff, .. } => handoff.pending(),
        }
    }

    /// Get strategy name
    pub fn strategy_name(&self) -> &'static str {
        match &self.inner.strategy {
            Strategy::Fixed { .. } => "fixed",
            Strategy::Unbounded { .. } => "unbounded",
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}
