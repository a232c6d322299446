//! Work Dispatcher
//!
//! Decides for every submitted package whether it runs inline or is queued,
//! and drains the priority lanes into the worker pool.
//!
//! Work is queued only when workers are enabled, the submitter is the
//! serialized context, inline execution was not forced and shutdown has not
//! begun. Everything else runs synchronously on the caller's thread.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::config::DispatcherConfig;
use crate::context::ExecutionContext;
use crate::error::PoolError;
use crate::lanes::{LaneCounts, PriorityLanes};
use crate::package::{InvokerCallStack, Priority, WorkPackage};
use crate::pool::{WorkerPool, WorkerRecord, current_worker};
use crate::work::{ComponentInstance, Controller, ExceptionHandler, ParamMap, WorkItem};

/// Everything needed to submit one work package
pub struct WorkRequest {
    controller: Arc<dyn Controller>,
    items: Vec<Option<Arc<dyn WorkItem>>>,
    params: ParamMap,
    component: Option<Arc<dyn ComponentInstance>>,
    priority: Priority,
    force_inline: bool,
    special_success: bool,
}

impl WorkRequest {
    /// Empty request against a controller
    pub fn new(controller: Arc<dyn Controller>) -> Self {
        Self {
            controller,
            items: Vec::new(),
            params: ParamMap::new(),
            component: None,
            priority: Priority::Normal,
            force_inline: false,
            special_success: false,
        }
    }

    /// Append an item
    pub fn item(mut self, item: Arc<dyn WorkItem>) -> Self {
        self.items.push(Some(item));
        self
    }

    /// Append an empty slot, skipped at run time
    pub fn skip(mut self) -> Self {
        self.items.push(None);
        self
    }

    /// Append a sequence of slots
    pub fn items<I>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = Option<Arc<dyn WorkItem>>>,
    {
        self.items.extend(items);
        self
    }

    pub fn params(mut self, params: ParamMap) -> Self {
        self.params = params;
        self
    }

    pub fn component(mut self, component: Arc<dyn ComponentInstance>) -> Self {
        self.component = Some(component);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Run on the caller's thread regardless of configuration
    pub fn force_inline(mut self, force: bool) -> Self {
        self.force_inline = force;
        self
    }

    /// Route the first item's outcome to the component instance
    pub fn special_success_handling(mut self, enabled: bool) -> Self {
        self.special_success = enabled;
        self
    }

    fn into_package(self) -> (WorkPackage, bool) {
        let package = WorkPackage::new(
            self.controller,
            self.items,
            self.params,
            self.component,
            self.priority,
            self.special_success,
        );
        (package, self.force_inline)
    }
}

/// Dispatcher counters at one instant
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatcherStats {
    pub lanes: LaneCounts,
    pub created_workers: usize,
    pub live_workers: usize,
    pub inline_packages: u64,
    pub queued_packages: u64,
    pub completed_packages: u64,
    pub dropped_packages: u64,
}

struct Shared {
    config: DispatcherConfig,
    context: Arc<dyn ExecutionContext>,
    handler: Arc<dyn ExceptionHandler>,
    lanes: PriorityLanes,
    pool: Option<WorkerPool>,
    dispatching: AtomicBool,
    shutting_down: AtomicBool,
    inline_packages: AtomicU64,
    queued_packages: AtomicU64,
    completed_packages: AtomicU64,
    dropped_packages: AtomicU64,
}

/// Releases the dispatch gate when the loop body exits
struct GateGuard<'a>(&'a AtomicBool);

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Bookkeeping for a package handed to the pool
///
/// Dropped after the package ran, or unrun if the pool discarded it; either
/// way its lane slot is released and the loop re-triggered.
struct Completion {
    shared: Arc<Shared>,
    priority: Priority,
    ran: bool,
    worker: Option<Arc<WorkerRecord>>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.shared.lanes.complete(self.priority);
        if let Some(worker) = self.worker.take() {
            worker.clear_package();
            tracing::debug!("{}: work finished", worker);
        }
        let counter = if self.ran {
            &self.shared.completed_packages
        } else {
            &self.shared.dropped_packages
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.shared.dispatch();
    }
}

impl Shared {
    /// Runs on the serialized context
    fn enqueue(self: &Arc<Self>, package: Arc<WorkPackage>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            self.dropped_packages.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                "Dropping {} priority work package submitted before shutdown",
                package.priority().name()
            );
            return;
        }
        self.lanes.push(package);
        self.dispatch();
    }

    /// Single-flight loop moving packages from the lanes into the pool
    fn dispatch(self: &Arc<Self>) {
        let Some(pool) = &self.pool else { return };

        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            if self
                .dispatching
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // The loop already in flight keeps draining
                return;
            }

            let gate = GateGuard(&self.dispatching);
            let mut rejected = false;
            while !self.shutting_down.load(Ordering::SeqCst) {
                let Some(package) = self.lanes.poll_next() else { break };
                if let Err(e) = self.submit_package(pool, package) {
                    tracing::warn!("Worker pool rejected work package: {}", e);
                    rejected = true;
                    break;
                }
            }
            drop(gate);

            // A completion may have lost the gate race while we were draining
            if rejected || !self.lanes.has_dispatchable() {
                return;
            }
        }
    }

    fn submit_package(
        self: &Arc<Self>,
        pool: &WorkerPool,
        package: Arc<WorkPackage>,
    ) -> Result<(), PoolError> {
        let counts = self.lanes.counts();
        tracing::debug!(
            "Submitting work package{}: high {} running {} waiting, normal {} running {} waiting",
            if package.priority() == Priority::High { " (high prio)" } else { "" },
            counts.running_high,
            counts.waiting_high,
            counts.running_normal,
            counts.waiting_normal
        );

        let mut completion = Completion {
            shared: Arc::clone(self),
            priority: package.priority(),
            ran: false,
            worker: None,
        };
        pool.execute(move || {
            completion.ran = true;
            completion.worker = current_worker();
            if let Some(worker) = &completion.worker {
                worker.set_package(&package);
            }
            package.run(completion.shared.handler.as_ref(), completion.worker.as_deref());
        })
    }
}

/// Schedules controller work inline or onto prioritized worker threads
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("worker_threads", &self.shared.config.worker_threads)
            .field("lanes", &self.shared.lanes.counts())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher bound to a serialized context and a global handler
    ///
    /// The worker strategy is fixed from here on.
    pub fn new(
        config: DispatcherConfig,
        context: Arc<dyn ExecutionContext>,
        handler: Arc<dyn ExceptionHandler>,
    ) -> Self {
        let pool = WorkerPool::from_config(&config);
        tracing::info!(
            "Dispatcher initialized ({} worker threads)",
            config.worker_threads.as_raw()
        );

        Self {
            shared: Arc::new(Shared {
                config,
                context,
                handler,
                lanes: PriorityLanes::new(),
                pool,
                dispatching: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                inline_packages: AtomicU64::new(0),
                queued_packages: AtomicU64::new(0),
                completed_packages: AtomicU64::new(0),
                dropped_packages: AtomicU64::new(0),
            }),
        }
    }

    /// Submit a package
    ///
    /// Inline execution finishes before this returns. Queued execution only
    /// posts to the serialized context; lane insertion and dispatch happen
    /// there afterwards.
    pub fn submit(&self, request: WorkRequest) {
        let shared = &self.shared;
        let (package, force_inline) = request.into_package();

        let queue = shared.pool.is_some()
            && shared.context.is_current()
            && !force_inline
            && !shared.shutting_down.load(Ordering::SeqCst);
        if !queue {
            shared.inline_packages.fetch_add(1, Ordering::SeqCst);
            package.run_inline(shared.handler.as_ref());
            return;
        }

        let package = if shared.config.trace_invocations {
            package.with_call_stack(InvokerCallStack::capture())
        } else {
            package
        };
        let package = Arc::new(package);

        let enqueue = {
            let shared = Arc::clone(shared);
            let package = Arc::clone(&package);
            Box::new(move || shared.enqueue(package))
        };
        match shared.context.post(enqueue) {
            Ok(()) => {
                shared.queued_packages.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                tracing::warn!("Cannot queue work package ({}), running inline", e);
                shared.inline_packages.fetch_add(1, Ordering::SeqCst);
                package.run_inline(shared.handler.as_ref());
            }
        }
    }

    /// Normal priority package
    pub fn perform(
        &self,
        controller: Arc<dyn Controller>,
        items: Vec<Arc<dyn WorkItem>>,
        params: ParamMap,
    ) {
        self.submit(
            WorkRequest::new(controller)
                .items(items.into_iter().map(Some))
                .params(params),
        );
    }

    /// Single-item package
    pub fn perform_item(
        &self,
        controller: Arc<dyn Controller>,
        item: Arc<dyn WorkItem>,
        params: ParamMap,
    ) {
        self.submit(WorkRequest::new(controller).item(item).params(params));
    }

    /// Package that always runs on the caller's thread
    pub fn perform_inline(
        &self,
        controller: Arc<dyn Controller>,
        items: Vec<Arc<dyn WorkItem>>,
        params: ParamMap,
    ) {
        self.submit(
            WorkRequest::new(controller)
                .items(items.into_iter().map(Some))
                .params(params)
                .force_inline(true),
        );
    }

    /// Normal priority package whose first item reports to `component`
    pub fn perform_with_feedback(
        &self,
        controller: Arc<dyn Controller>,
        items: Vec<Arc<dyn WorkItem>>,
        params: ParamMap,
        component: Arc<dyn ComponentInstance>,
    ) {
        self.submit(
            WorkRequest::new(controller)
                .items(items.into_iter().map(Some))
                .params(params)
                .component(component)
                .special_success_handling(true),
        );
    }

    /// High priority package; the first item reports to `component`
    pub fn perform_high_priority(
        &self,
        controller: Arc<dyn Controller>,
        items: Vec<Arc<dyn WorkItem>>,
        params: ParamMap,
        component: Arc<dyn ComponentInstance>,
    ) {
        self.submit(
            WorkRequest::new(controller)
                .items(items.into_iter().map(Some))
                .params(params)
                .component(component)
                .priority(Priority::High)
                .special_success_handling(true),
        );
    }

    /// Stop background execution for good
    ///
    /// Idempotent and non-blocking. Packages still waiting in the lanes or in
    /// the pool's backlog are dropped without running; later submissions run
    /// inline.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let backlog = shared.pool.as_ref().map_or(0, WorkerPool::shutdown_now);
        let purged = shared.lanes.purge();
        shared.dropped_packages.fetch_add(purged as u64, Ordering::SeqCst);

        if purged + backlog > 0 {
            tracing::warn!(
                "Dispatcher shut down with {} waiting and {} backlogged work packages dropped",
                purged,
                backlog
            );
        }
        tracing::info!("Dispatcher shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    /// Whether packages submitted from the serialized context may be queued
    pub fn uses_worker_threads(&self) -> bool {
        self.shared.pool.is_some()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    pub fn lane_counts(&self) -> LaneCounts {
        self.shared.lanes.counts()
    }

    /// Get dispatcher stats
    pub fn stats(&self) -> DispatcherStats {
        let shared = &self.shared;
        DispatcherStats {
            lanes: shared.lanes.counts(),
            created_workers: shared.pool.as_ref().map_or(0, WorkerPool::created_workers),
            live_workers: shared.pool.as_ref().map_or(0, WorkerPool::live_workers),
            inline_packages: shared.inline_packages.load(Ordering::SeqCst),
            queued_packages: shared.queued_packages.load(Ordering::SeqCst),
            completed_packages: shared.completed_packages.load(Ordering::SeqCst),
            dropped_packages: shared.dropped_packages.load(Ordering::SeqCst),
        }
    }
}
